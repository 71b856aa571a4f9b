//! 错误类型定义模块
//!
//! 定义 mikurpl 的统一错误类型 RplError 和 Result 别名。
//! 每个变体都携带足以定位问题的上下文(服务器标识、检查项名称、GTID 区间)。

use thiserror::Error;

/// mikurpl 错误类型
#[derive(Error, Debug)]
pub enum RplError {
    /// 无法连接或认证失败
    #[error("Cannot connect to {server}: {reason}")]
    Connection { server: String, reason: String },

    /// 服务器版本低于要求
    #[error("The {server} version {found} is incompatible. Utility requires version {required} or higher")]
    Version {
        server: String,
        found: String,
        required: String,
    },

    /// 两个端点解析为同一身份
    #[error("Uniqueness violation: {0}")]
    Uniqueness(String),

    /// InnoDB / 存储引擎的致命不兼容
    #[error("Compatibility error ({check}): {message}")]
    Compatibility { check: String, message: String },

    /// 主库未开启二进制日志
    #[error("{server}: Main must have binary logging turned on.")]
    BinlogDisabled { server: String },

    /// 重试预算耗尽
    #[error("{operation} did not complete after {attempts} attempts: {last}")]
    SetupTimeout {
        operation: String,
        attempts: u32,
        last: String,
    },

    /// 连接用户缺少全局权限
    #[error("User '{user}' on {server} does not have sufficient privileges to {operation} (required: {required}).")]
    Privileges {
        server: String,
        user: String,
        operation: String,
        required: String,
    },

    /// 复制搭建失败
    #[error("Cannot setup replication. {0}")]
    Setup(Box<RplError>),

    /// GTID 集合格式错误
    #[error("Invalid GTID set '{input}': {reason}")]
    GtidFormat { input: String, reason: String },

    /// 一个或多个从库仅部分完成跳过
    #[error("Transaction skip incomplete on: {}", .subordinates.join(", "))]
    PartialSkip { subordinates: Vec<String> },

    /// 另一个生命周期请求正在进行
    #[error("Daemon is busy with another lifecycle request")]
    DaemonBusy,

    /// 语句执行失败
    #[error("Query failed on {server}: {statement}: {reason}")]
    Query {
        server: String,
        statement: String,
        reason: String,
    },

    /// 连接描述符格式错误
    #[error("Invalid descriptor '{input}': {reason}")]
    Descriptor { input: String, reason: String },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 操作在检查点被取消
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// 非法状态转换
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RplError {
    pub fn connection(server: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    pub fn query(server: impl Into<String>, statement: impl Into<String>, reason: impl ToString) -> Self {
        Self::Query {
            server: server.into(),
            statement: statement.into(),
            reason: reason.to_string(),
        }
    }

    pub fn gtid_format(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GtidFormat {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn descriptor(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Descriptor {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// # Brief
    /// 判断错误是否值得在重试预算内再次尝试
    ///
    /// 只有网络/语句层面的瞬时失败可以重试;校验类错误重试也不会改变结果。
    pub fn is_transient(&self) -> bool {
        match self {
            RplError::Setup(inner) => inner.is_transient(),
            other => matches!(
                other,
                RplError::Connection { .. } | RplError::Query { .. } | RplError::SetupTimeout { .. }
            ),
        }
    }

    /// # Brief
    /// 剥去 Setup 包装,返回根因
    pub fn root(&self) -> &RplError {
        match self {
            RplError::Setup(inner) => inner.root(),
            other => other,
        }
    }
}

/// mikurpl Result 类型别名
pub type RplResult<T> = Result<T, RplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RplError::connection("main 'h:1'", "refused").is_transient());
        assert!(RplError::query("h:1", "SELECT 1", "gone away").is_transient());
        assert!(!RplError::DaemonBusy.is_transient());
        assert!(!RplError::BinlogDisabled { server: "h:1".into() }.is_transient());
        assert!(RplError::Setup(Box::new(RplError::connection("h:1", "reset"))).is_transient());
        assert!(!RplError::Setup(Box::new(RplError::Uniqueness("x".into()))).is_transient());
    }

    #[test]
    fn test_setup_error_display_and_root() {
        let err = RplError::Setup(Box::new(RplError::SetupTimeout {
            operation: "replication start on subordinate 'b:3306'".into(),
            attempts: 10,
            last: "IO thread not running".into(),
        }));
        let text = err.to_string();
        assert!(text.starts_with("Cannot setup replication."));
        assert!(text.contains("10 attempts"));
        assert!(matches!(err.root(), RplError::SetupTimeout { attempts: 10, .. }));
    }

    #[test]
    fn test_partial_skip_lists_subordinates() {
        let err = RplError::PartialSkip {
            subordinates: vec!["a:3306".into(), "b:3306".into()],
        };
        assert_eq!(err.to_string(), "Transaction skip incomplete on: a:3306, b:3306");
    }
}
