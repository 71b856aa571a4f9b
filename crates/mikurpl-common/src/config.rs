//! 配置模块
//!
//! 本模块定义了 mikurpl 的所有配置选项:
//! - 日志配置(级别、文件、JSON 输出)
//! - 复制搭建配置(最低版本、重试次数、退避时间)
//! - 多源守护进程配置(监控间隔、通道重试、失败策略、PID 文件)
//! - 事务跳过配置
//!
//! 支持从 TOML 文件加载配置,所有字段都有默认值。

use crate::error::{RplError, RplResult};
use crate::retry::RetryPolicy;
use crate::types::ServerVersion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RplConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub setup: SetupConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub skip: SkipConfig,
}

impl RplConfig {
    /// # Brief
    /// 从 TOML 文件加载配置
    ///
    /// # Arguments
    /// * `path` - 配置文件路径
    pub fn from_file(path: &Path) -> RplResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> RplResult<Self> {
        let config: RplConfig =
            toml::from_str(content).map_err(|e| RplError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RplResult<()> {
        if self.setup.attempts == 0 || self.setup.test_attempts == 0 {
            return Err(RplError::Config("setup attempts must be at least 1".into()));
        }
        if self.daemon.channel_attempts == 0 || self.daemon.reconnect_attempts == 0 {
            return Err(RplError::Config("daemon attempts must be at least 1".into()));
        }
        if self.daemon.interval_secs == 0 {
            return Err(RplError::Config("daemon interval must be at least 1 second".into()));
        }
        if self.skip.inject_attempts == 0 {
            return Err(RplError::Config("skip inject_attempts must be at least 1".into()));
        }
        for value in &self.daemon.report_values {
            if !matches!(value.as_str(), "health" | "gtid" | "uuid") {
                return Err(RplError::Config(format!(
                    "unknown report value '{}' (expected health, gtid or uuid)",
                    value
                )));
            }
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 日志文件;为空时输出到 stderr
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
        }
    }
}

/// 复制搭建配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_setup_min_version")]
    pub min_version: ServerVersion,

    /// 等待复制进入运行状态的最大尝试次数
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_setup_backoff_ms")]
    pub backoff_ms: u64,

    /// 测试数据库同步的最大尝试次数
    #[serde(default = "default_attempts")]
    pub test_attempts: u32,

    /// 将 InnoDB / 存储引擎的警告升级为致命错误
    #[serde(default)]
    pub pedantic: bool,
}

fn default_setup_min_version() -> ServerVersion { ServerVersion::new(5, 0, 0) }
fn default_attempts() -> u32 { 10 }
fn default_setup_backoff_ms() -> u64 { 1000 }

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            min_version: default_setup_min_version(),
            attempts: default_attempts(),
            backoff_ms: default_setup_backoff_ms(),
            test_attempts: default_attempts(),
            pedantic: false,
        }
    }
}

impl SetupConfig {
    pub fn start_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.attempts, Duration::from_millis(self.backoff_ms))
    }

    pub fn verify_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.test_attempts, Duration::from_millis(self.backoff_ms))
    }
}

/// 通道失败时守护进程的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// 单个通道失败只影响该通道
    #[default]
    Isolate,
    /// 启动期间任一通道耗尽预算即整体失败
    FailFast,
}

/// 多源复制守护进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_min_version")]
    pub min_version: ServerVersion,

    /// 监控与报告间隔(秒)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// 每个通道搭建的最大尝试次数
    #[serde(default = "default_channel_attempts")]
    pub channel_attempts: u32,

    /// 重连间隔(毫秒)
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// 监控时的最大重连次数
    #[serde(default = "default_channel_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,

    /// 周期性报告的内容: health, gtid, uuid
    #[serde(default = "default_report_values")]
    pub report_values: Vec<String>,
}

fn default_daemon_min_version() -> ServerVersion { ServerVersion::new(5, 6, 9) }
fn default_interval_secs() -> u64 { 15 }
fn default_channel_attempts() -> u32 { 3 }
fn default_reconnect_backoff_ms() -> u64 { 3000 }
fn default_pidfile() -> PathBuf { PathBuf::from("./rplms_daemon.pid") }
fn default_report_values() -> Vec<String> { vec!["health".to_string()] }

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            min_version: default_daemon_min_version(),
            interval_secs: default_interval_secs(),
            channel_attempts: default_channel_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_attempts: default_channel_attempts(),
            failure_policy: FailurePolicy::default(),
            pidfile: default_pidfile(),
            report_values: default_report_values(),
        }
    }
}

impl DaemonConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn channel_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.channel_attempts, Duration::from_millis(self.reconnect_backoff_ms))
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.reconnect_attempts, Duration::from_millis(self.reconnect_backoff_ms))
    }

    pub fn reports(&self, value: &str) -> bool {
        self.report_values.iter().any(|v| v == value)
    }
}

/// 事务跳过配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipConfig {
    /// 每个空事务注入的最大尝试次数
    #[serde(default = "default_inject_attempts")]
    pub inject_attempts: u32,

    #[serde(default = "default_skip_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_inject_attempts() -> u32 { 1 }
fn default_skip_backoff_ms() -> u64 { 500 }

impl Default for SkipConfig {
    fn default() -> Self {
        Self {
            inject_attempts: default_inject_attempts(),
            backoff_ms: default_skip_backoff_ms(),
        }
    }
}

impl SkipConfig {
    pub fn inject_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.inject_attempts, Duration::from_millis(self.backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RplConfig::default();
        assert_eq!(config.setup.attempts, 10);
        assert_eq!(config.setup.min_version, ServerVersion::new(5, 0, 0));
        assert_eq!(config.daemon.min_version, ServerVersion::new(5, 6, 9));
        assert_eq!(config.daemon.failure_policy, FailurePolicy::Isolate);
        assert!(config.daemon.reports("health"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RplConfig::from_toml(
            r#"
            [setup]
            attempts = 3
            pedantic = true

            [daemon]
            failure_policy = "fail-fast"
            report_values = ["health", "gtid"]
            "#,
        )
        .unwrap();
        assert_eq!(config.setup.attempts, 3);
        assert!(config.setup.pedantic);
        assert_eq!(config.setup.test_attempts, 10);
        assert_eq!(config.daemon.failure_policy, FailurePolicy::FailFast);
        assert!(config.daemon.reports("gtid"));
        assert_eq!(config.daemon.interval_secs, 15);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RplConfig::from_toml("[setup]\nattempts = 0\n").is_err());
        assert!(RplConfig::from_toml("[daemon]\nreport_values = [\"lag\"]\n").is_err());
        assert!(RplConfig::from_toml("[setup]\nmin_version = \"x\"\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nlevel = \"debug\"\n[skip]\ninject_attempts = 2").unwrap();
        let config = RplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.skip.inject_attempts, 2);
    }
}
