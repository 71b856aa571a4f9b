//! 命令行参数定义

use clap::{Args, Parser, Subcommand, ValueEnum};
use mikurpl_common::{ConnectionDescriptor, FailurePolicy, ReplicationUser, RplConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mikurpl")]
#[command(author = "MikuDB Team")]
#[command(version)]
#[command(about = "mikurpl - MySQL replication administration tools")]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, env = "MIKURPL_CONFIG")]
    pub config: Option<PathBuf>,

    /// 详细程度,可重复
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(long, global = true, default_value = "text")]
    pub format: String,

    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 在主库与从库之间搭建复制
    Replicate(ReplicateArgs),
    /// 多源复制守护进程
    Rplms(RplmsArgs),
    /// 在从库上跳过 GTID 事务
    Skiptrx(SkiptrxArgs),
}

#[derive(Args, Debug)]
pub struct ReplicateArgs {
    /// 主库连接,格式 user[:password]@host[:port][:socket]
    #[arg(long)]
    pub main: ConnectionDescriptor,

    #[arg(long)]
    pub subordinate: ConnectionDescriptor,

    /// 复制用户,格式 user:password
    #[arg(long)]
    pub rpl_user: ReplicationUser,

    /// 把警告视为错误
    #[arg(long)]
    pub pedantic: bool,

    /// 用于验证复制的测试库
    #[arg(long)]
    pub test_db: Option<String>,

    #[arg(long)]
    pub main_log_file: Option<String>,

    #[arg(long, requires = "main_log_file")]
    pub main_log_pos: Option<u64>,

    /// 从主库第一个二进制日志开始复制
    #[arg(long, conflicts_with = "main_log_file")]
    pub start_from_beginning: bool,

    /// 搭建的最大尝试次数
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonMode {
    Start,
    Stop,
    Restart,
    Nodetach,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailoverPolicy {
    Isolate,
    FailFast,
}

impl From<FailoverPolicy> for FailurePolicy {
    fn from(policy: FailoverPolicy) -> Self {
        match policy {
            FailoverPolicy::Isolate => FailurePolicy::Isolate,
            FailoverPolicy::FailFast => FailurePolicy::FailFast,
        }
    }
}

#[derive(Args, Debug)]
pub struct RplmsArgs {
    /// stop / restart 只需要 pid 文件
    #[arg(long)]
    pub subordinate: Option<ConnectionDescriptor>,

    /// 逗号分隔的主库列表
    #[arg(long, value_delimiter = ',')]
    pub mains: Vec<ConnectionDescriptor>,

    #[arg(long)]
    pub rpl_user: Option<ReplicationUser>,

    /// 监控间隔(秒)
    #[arg(long)]
    pub interval: Option<u64>,

    /// 周期性报告内容: health, gtid, uuid
    #[arg(long, value_delimiter = ',')]
    pub report_values: Vec<String>,

    #[arg(long, value_enum)]
    pub failover_policy: Option<FailoverPolicy>,

    #[arg(long, value_enum)]
    pub daemon: Option<DaemonMode>,

    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// 日志文件,后台运行时使用
    #[arg(long)]
    pub log: Option<PathBuf>,
}

impl RplmsArgs {
    /// 命令行选项覆盖配置文件
    pub fn apply(&self, config: &mut RplConfig) {
        if let Some(interval) = self.interval {
            config.daemon.interval_secs = interval;
        }
        if !self.report_values.is_empty() {
            config.daemon.report_values = self.report_values.iter().map(|v| v.trim().to_lowercase()).collect();
        }
        if let Some(policy) = self.failover_policy {
            config.daemon.failure_policy = policy.into();
        }
        if let Some(ref pidfile) = self.pidfile {
            config.daemon.pidfile = pidfile.clone();
        }
        if let Some(ref log) = self.log {
            config.log.file = Some(log.clone());
        }
    }
}

#[derive(Args, Debug)]
pub struct SkiptrxArgs {
    /// 要跳过的 GTID 集合
    #[arg(long)]
    pub gtid_set: String,

    /// 逗号分隔的从库列表
    #[arg(long, value_delimiter = ',', required = true)]
    pub subordinates: Vec<ConnectionDescriptor>,

    /// 只计算要跳过的事务
    #[arg(long)]
    pub dryrun: bool,
}
