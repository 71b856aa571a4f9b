//! mikurpl 多源复制守护进程
//!
//! 一个从库同时从多个主库复制,每个主库对应一个命名通道:
//! - **生命周期**: stopped / starting / running / stopping / failed 状态机,
//!   所有变更经由单一监督任务串行执行
//! - **通道监控**: 每个通道一个工作任务,按间隔检查 IO/SQL 线程与主库信息
//! - **故障隔离**: 单个通道失败不影响其它通道(快速失败策略除外)
//! - **进程支持**: pid 文件、后台运行、SIGTERM 停止、SIGHUP 重启

pub mod channel;
pub mod daemon;
pub mod process;
pub mod state;

pub use channel::{ChannelSnapshot, ChannelSpec, ChannelState};
pub use daemon::{DaemonHandle, DaemonStatus, DaemonTopology, MultiSourceDaemon};
pub use process::{daemonize, read_pid, serve, signal_daemon, wait_for_exit, DaemonSignal, Forked, PidFile};
pub use state::{DaemonState, StateChange};

use mikurpl_common::{LogConfig, RplError, RplResult};
use std::fs::OpenOptions;
use std::sync::Mutex;

/// # Brief
/// 初始化日志
///
/// `RUST_LOG` 优先于配置的级别。配置了日志文件时追加写入该文件(后台运行时
/// 标准输出已被关闭),否则写入标准错误。
pub fn init_logging(config: &LogConfig) -> RplResult<()> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let writer = match config.file {
        Some(ref path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(config.file.is_none())
        .with_writer(writer);
    let layer = if config.json { layer.json().boxed() } else { layer.boxed() };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| RplError::Config(format!("cannot initialise logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_logging_json_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rplms.log");
        let config = LogConfig {
            level: "debug".into(),
            file: Some(path.clone()),
            json: true,
        };
        init_logging(&config).unwrap();
        tracing::error!("logging initialised");
        assert!(path.exists());

        // 全局订阅者只能安装一次
        let err = init_logging(&LogConfig::default()).unwrap_err();
        assert!(matches!(err, RplError::Config(_)));
    }
}
