//! SQL 方言与语句构造
//!
//! 8.0.23 起复制语句改用 REPLICA / SOURCE 术语,8.2 起 `SHOW MASTER STATUS`
//! 被 `SHOW BINARY LOG STATUS` 取代。`Dialect` 根据服务器版本生成对应语句。

use mikurpl_common::ServerVersion;

const REPLICA_SYNTAX_SINCE: ServerVersion = ServerVersion::new(8, 0, 23);
const BINARY_LOG_STATUS_SINCE: ServerVersion = ServerVersion::new(8, 2, 0);

/// IO 线程等待主库事件时的状态文本
pub const WAITING_STATES: [&str; 2] = ["Waiting for master to send event", "Waiting for source to send event"];

/// 单引号字符串字面量
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// 反引号标识符
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// 账户名 `'user'@'host'`
pub fn account(user: &str, host: &str) -> String {
    format!("{}@{}", quote_literal(user), quote_literal(host))
}

/// `SET GTID_NEXT = '...'`
pub fn set_gtid_next(value: &str) -> String {
    format!("SET GTID_NEXT = {}", quote_literal(value))
}

/// CHANGE MASTER TO / CHANGE REPLICATION SOURCE TO 的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSource {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub log_file: Option<String>,
    pub log_pos: Option<u64>,
    pub channel: Option<String>,
}

/// 按服务器版本选择的 SQL 方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    version: ServerVersion,
}

impl Dialect {
    pub fn for_version(version: ServerVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    pub fn uses_replica_syntax(&self) -> bool {
        self.version >= REPLICA_SYNTAX_SINCE
    }

    fn replica_keyword(&self) -> &'static str {
        if self.uses_replica_syntax() { "REPLICA" } else { "SLAVE" }
    }

    fn for_channel(channel: Option<&str>) -> String {
        match channel {
            Some(name) => format!(" FOR CHANNEL {}", quote_literal(name)),
            None => String::new(),
        }
    }

    pub fn show_replica_status(&self, channel: Option<&str>) -> String {
        format!("SHOW {} STATUS{}", self.replica_keyword(), Self::for_channel(channel))
    }

    pub fn start_replica(&self, channel: Option<&str>) -> String {
        format!("START {}{}", self.replica_keyword(), Self::for_channel(channel))
    }

    pub fn stop_replica(&self, channel: Option<&str>) -> String {
        format!("STOP {}{}", self.replica_keyword(), Self::for_channel(channel))
    }

    pub fn start_sql_thread(&self, channel: Option<&str>) -> String {
        format!("START {} SQL_THREAD{}", self.replica_keyword(), Self::for_channel(channel))
    }

    pub fn show_main_status(&self) -> &'static str {
        if self.version >= BINARY_LOG_STATUS_SINCE {
            "SHOW BINARY LOG STATUS"
        } else {
            "SHOW MASTER STATUS"
        }
    }

    pub fn change_source(&self, params: &ChangeSource) -> String {
        let prefix = if self.uses_replica_syntax() { "SOURCE" } else { "MASTER" };
        let mut options = vec![
            format!("{prefix}_HOST = {}", quote_literal(&params.host)),
            format!("{prefix}_PORT = {}", params.port),
            format!("{prefix}_USER = {}", quote_literal(&params.user)),
            format!("{prefix}_PASSWORD = {}", quote_literal(&params.password)),
        ];
        if let Some(ref file) = params.log_file {
            options.push(format!("{prefix}_LOG_FILE = {}", quote_literal(file)));
        }
        if let Some(pos) = params.log_pos {
            options.push(format!("{prefix}_LOG_POS = {}", pos));
        }
        let head = if self.uses_replica_syntax() {
            "CHANGE REPLICATION SOURCE TO"
        } else {
            "CHANGE MASTER TO"
        };
        format!("{} {}{}", head, options.join(", "), Self::for_channel(params.channel.as_deref()))
    }

    pub fn io_state_column(&self) -> &'static str {
        if self.uses_replica_syntax() { "Replica_IO_State" } else { "Slave_IO_State" }
    }

    pub fn io_running_column(&self) -> &'static str {
        if self.uses_replica_syntax() { "Replica_IO_Running" } else { "Slave_IO_Running" }
    }

    pub fn sql_running_column(&self) -> &'static str {
        if self.uses_replica_syntax() { "Replica_SQL_Running" } else { "Slave_SQL_Running" }
    }
}
