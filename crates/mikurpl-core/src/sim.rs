//! 内存模拟服务器集群
//!
//! 实现 [`DatabaseClient`],解释编排层会发出的那一小部分语句:变量与引擎查询、
//! 复制用户管理、二进制日志坐标、复制通道(可配置启动延迟)、GTID 已执行集合、
//! 空事务注入与数据库创建。支持故障注入、语句日志和打开连接计数,
//! 用于搭建、跳过与守护进程的场景测试。

use crate::client::{DatabaseClient, QueryRows, ServerConnection};
use crate::gtid::{Gtid, GtidSet};
use crate::sql::{Dialect, WAITING_STATES};
use async_trait::async_trait;
use mikurpl_common::{ConnectionDescriptor, RplError, RplResult, ServerVersion};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

/// 模拟服务器的 InnoDB 设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInnoDb {
    pub version: String,
    pub page_size: u64,
}

#[derive(Debug, Clone, Default)]
struct SimUser {
    password: String,
    privileges: Vec<String>,
}

#[derive(Debug, Clone)]
struct SimChannel {
    source: String,
    user: String,
    password: String,
    log_file: Option<String>,
    log_pos: Option<u64>,
    started: bool,
    sql_running: bool,
    pending_polls: u32,
}

/// 模拟服务器
#[derive(Debug, Clone)]
pub struct SimServer {
    server_id: u32,
    server_uuid: Option<Uuid>,
    version: String,
    log_bin: bool,
    gtid_mode: bool,
    gtid_executed: GtidSet,
    innodb: Option<SimInnoDb>,
    engines: Vec<(String, String)>,
    table_engines: Vec<String>,
    password: Option<String>,
    databases: BTreeSet<String>,
    users: BTreeMap<(String, String), SimUser>,
    binlogs: Vec<(String, u64)>,
    channels: BTreeMap<String, SimChannel>,
    start_latency: u32,
    sql_thread_stalls: u32,
    apply_events: bool,
    /// 连接用户的全局权限;None 表示拥有全部权限
    connect_grants: Option<Vec<String>>,
    down: bool,
}

impl SimServer {
    pub fn new(server_id: u32) -> Self {
        let version = "8.0.35".to_string();
        Self {
            server_id,
            server_uuid: Some(Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0000_0000 + server_id as u128)),
            innodb: Some(SimInnoDb {
                version: version.clone(),
                page_size: 16384,
            }),
            version,
            log_bin: true,
            gtid_mode: false,
            gtid_executed: GtidSet::new(),
            engines: vec![
                ("InnoDB".into(), "DEFAULT".into()),
                ("MyISAM".into(), "YES".into()),
                ("MEMORY".into(), "YES".into()),
                ("CSV".into(), "YES".into()),
            ],
            table_engines: vec!["InnoDB".into()],
            password: None,
            databases: SYSTEM_DATABASES.iter().map(|s| s.to_string()).collect(),
            users: BTreeMap::new(),
            binlogs: vec![("binlog.000001".into(), 4), ("binlog.000002".into(), 157)],
            channels: BTreeMap::new(),
            start_latency: 0,
            sql_thread_stalls: 0,
            apply_events: true,
            connect_grants: None,
            down: false,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        if let Some(ref mut innodb) = self.innodb {
            innodb.version = version.split('-').next().unwrap_or(version).to_string();
        }
        self
    }

    pub fn with_uuid(mut self, uuid: Option<Uuid>) -> Self {
        self.server_uuid = uuid;
        self
    }

    pub fn with_log_bin(mut self, on: bool) -> Self {
        self.log_bin = on;
        self
    }

    pub fn with_gtid_mode(mut self, on: bool) -> Self {
        self.gtid_mode = on;
        self
    }

    pub fn with_gtid_executed(mut self, executed: GtidSet) -> Self {
        self.gtid_executed = executed;
        self
    }

    pub fn with_innodb(mut self, innodb: Option<SimInnoDb>) -> Self {
        let support = if innodb.is_some() { "DEFAULT" } else { "NO" };
        for (name, s) in &mut self.engines {
            if name == "InnoDB" {
                *s = support.to_string();
            }
        }
        self.innodb = innodb;
        self
    }

    pub fn with_table_engine(mut self, engine: &str) -> Self {
        self.table_engines.push(engine.to_string());
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// START 之后状态查询返回 "Connecting" 的次数
    pub fn with_start_latency(mut self, polls: u32) -> Self {
        self.start_latency = polls;
        self
    }

    /// 之后若干次 START 中 SQL 线程保持停止,需要单独启动
    pub fn with_sql_thread_stalls(mut self, starts: u32) -> Self {
        self.sql_thread_stalls = starts;
        self
    }

    /// 关闭后从库不再应用主库的事件(测试库永远不会出现)
    pub fn with_apply_events(mut self, apply: bool) -> Self {
        self.apply_events = apply;
        self
    }

    /// 限制连接用户的全局权限,`GRANT OPTION` 以 `WITH GRANT OPTION` 形式给出
    pub fn with_connect_grants(mut self, privileges: &[&str]) -> Self {
        self.connect_grants = Some(privileges.iter().map(|p| p.to_ascii_uppercase()).collect());
        self
    }

    fn grants_for(&self, user: &str) -> Vec<String> {
        let Some(ref privileges) = self.connect_grants else {
            return vec![format!("GRANT ALL PRIVILEGES ON *.* TO `{}`@`%` WITH GRANT OPTION", user)];
        };
        let mut grants = vec![format!("GRANT USAGE ON *.* TO `{}`@`%`", user)];
        let listed: Vec<&str> = privileges
            .iter()
            .map(String::as_str)
            .filter(|p| *p != "GRANT OPTION")
            .collect();
        if !listed.is_empty() {
            let with = if privileges.iter().any(|p| p == "GRANT OPTION") { " WITH GRANT OPTION" } else { "" };
            grants.push(format!("GRANT {} ON *.* TO `{}`@`%`{}", listed.join(", "), user, with));
        }
        grants
    }

    pub fn with_user(mut self, user: &str, host: &str, password: &str, privileges: &[&str]) -> Self {
        self.users.insert(
            (user.to_string(), host.to_string()),
            SimUser {
                password: password.to_string(),
                privileges: privileges.iter().map(|p| p.to_string()).collect(),
            },
        );
        self
    }

    fn dialect(&self) -> Dialect {
        Dialect::for_version(self.version.parse().unwrap_or(ServerVersion::new(5, 0, 0)))
    }

    fn variable(&self, name: &str) -> Option<String> {
        let on_off = |b: bool| if b { "ON" } else { "OFF" }.to_string();
        match name.to_ascii_lowercase().as_str() {
            "server_id" => Some(self.server_id.to_string()),
            "server_uuid" => self.server_uuid.map(|u| u.to_string()),
            "version" => Some(self.version.clone()),
            "log_bin" => Some(on_off(self.log_bin)),
            "gtid_mode" => Some(on_off(self.gtid_mode)),
            "innodb_version" => self.innodb.as_ref().map(|i| i.version.clone()),
            "innodb_page_size" => self.innodb.as_ref().map(|i| i.page_size.to_string()),
            _ => None,
        }
    }
}

struct FailRule {
    address: String,
    prefix: String,
    remaining: Option<u32>,
}

#[derive(Default)]
struct ClusterState {
    servers: HashMap<String, SimServer>,
    open: HashMap<String, usize>,
    log: Vec<(String, String)>,
    failures: Vec<FailRule>,
    latency: Duration,
}

/// 模拟集群,地址形如 `host:port`
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, address: &str, server: SimServer) {
        self.state.lock().servers.insert(address.to_string(), server);
    }

    /// 修改服务器;地址不存在时返回 None
    pub fn update<R>(&self, address: &str, f: impl FnOnce(&mut SimServer) -> R) -> Option<R> {
        self.state.lock().servers.get_mut(address).map(f)
    }

    /// 宕机的服务器拒绝新连接,已有连接上的语句也会失败
    pub fn set_down(&self, address: &str, down: bool) {
        self.update(address, |s| s.down = down);
    }

    /// 每次连接和语句前的等待时间
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// 以 `prefix` 开头(大小写不敏感)的语句失败 `times` 次,None 表示一直失败
    pub fn fail_statement(&self, address: &str, prefix: &str, times: Option<u32>) {
        self.state.lock().failures.push(FailRule {
            address: address.to_string(),
            prefix: prefix.to_ascii_uppercase(),
            remaining: times,
        });
    }

    pub fn statements(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn clear_statements(&self) {
        self.state.lock().log.clear();
    }

    pub fn open_connections(&self, address: &str) -> usize {
        self.state.lock().open.get(address).copied().unwrap_or(0)
    }

    pub fn total_open_connections(&self) -> usize {
        self.state.lock().open.values().sum()
    }

    pub fn gtid_executed(&self, address: &str) -> Option<GtidSet> {
        self.state.lock().servers.get(address).map(|s| s.gtid_executed.clone())
    }

    pub fn databases(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .servers
            .get(address)
            .map(|s| s.databases.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_user(&self, address: &str, user: &str, host: &str) -> bool {
        self.state
            .lock()
            .servers
            .get(address)
            .is_some_and(|s| s.users.contains_key(&(user.to_string(), host.to_string())))
    }

    /// 通道指向的源地址
    pub fn channel_source(&self, address: &str, channel: &str) -> Option<String> {
        self.state
            .lock()
            .servers
            .get(address)
            .and_then(|s| s.channels.get(channel))
            .map(|c| c.source.clone())
    }

    pub fn channel_started(&self, address: &str, channel: &str) -> bool {
        self.state
            .lock()
            .servers
            .get(address)
            .and_then(|s| s.channels.get(channel))
            .is_some_and(|c| c.started)
    }
}

#[async_trait]
impl DatabaseClient for SimCluster {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> RplResult<Box<dyn ServerConnection>> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let address = descriptor.address();
        let mut state = self.state.lock();
        let server = state
            .servers
            .get(&address)
            .filter(|s| !s.down)
            .ok_or_else(|| RplError::connection(&address, format!("Can't connect to MySQL server on '{}'", address)))?;
        if let Some(ref expected) = server.password {
            if descriptor.password.as_ref() != Some(expected) {
                return Err(RplError::connection(
                    &address,
                    format!("Access denied for user '{}'", descriptor.user),
                ));
            }
        }
        *state.open.entry(address.clone()).or_default() += 1;
        Ok(Box::new(SimConnection {
            state: self.state.clone(),
            address,
            user: descriptor.user.clone(),
            gtid_next: None,
        }))
    }
}

struct SimConnection {
    state: Arc<Mutex<ClusterState>>,
    address: String,
    user: String,
    gtid_next: Option<Gtid>,
}

#[async_trait]
impl ServerConnection for SimConnection {
    async fn query(&mut self, statement: &str) -> RplResult<QueryRows> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.execute(&self.address, &self.user, &mut self.gtid_next, statement)
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(count) = state.open.get_mut(&self.address) {
            *count = count.saturating_sub(1);
        }
    }
}

struct Patterns {
    show_variable: Regex,
    user_count: Regex,
    create_user: Regex,
    show_grants: Regex,
    grant: Regex,
    replica_status: Regex,
    start_sql_thread: Regex,
    start_replica: Regex,
    stop_replica: Regex,
    change_source: Regex,
    change_option: Regex,
    set_gtid_next: Regex,
    create_database: Regex,
    drop_database: Regex,
}

const LIT: &str = r"'((?:[^'\\]|''|\\.)*)'";
const CHANNEL: &str = r"(?:\s+FOR\s+CHANNEL\s+'((?:[^'\\]|''|\\.)*)')?";
const IDENT: &str = r"(?:`((?:[^`]|``)+)`|(\w+))";

fn patterns() -> RplResult<&'static Patterns> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Ok(Patterns {
                show_variable: Regex::new(&format!(r"(?i)^SHOW\s+(?:GLOBAL\s+)?VARIABLES\s+LIKE\s+{LIT}$"))?,
                user_count: Regex::new(&format!(
                    r"(?i)^SELECT\s+COUNT\(\*\)\s+FROM\s+mysql\.user\s+WHERE\s+user\s*=\s*{LIT}\s+AND\s+host\s*=\s*{LIT}$"
                ))?,
                create_user: Regex::new(&format!(
                    r"(?i)^CREATE\s+USER\s+{LIT}@{LIT}(?:\s+IDENTIFIED\s+BY\s+{LIT})?$"
                ))?,
                show_grants: Regex::new(&format!(r"(?i)^SHOW\s+GRANTS\s+FOR\s+{LIT}@{LIT}$"))?,
                grant: Regex::new(&format!(r"(?i)^GRANT\s+(.+?)\s+ON\s+\*\.\*\s+TO\s+{LIT}@{LIT}"))?,
                replica_status: Regex::new(&format!(r"(?i)^SHOW\s+(?:SLAVE|REPLICA)\s+STATUS{CHANNEL}$"))?,
                start_sql_thread: Regex::new(&format!(r"(?i)^START\s+(?:SLAVE|REPLICA)\s+SQL_THREAD{CHANNEL}$"))?,
                start_replica: Regex::new(&format!(r"(?i)^START\s+(?:SLAVE|REPLICA){CHANNEL}$"))?,
                stop_replica: Regex::new(&format!(r"(?i)^STOP\s+(?:SLAVE|REPLICA){CHANNEL}$"))?,
                change_source: Regex::new(&format!(
                    r"(?is)^CHANGE\s+(?:MASTER|REPLICATION\s+SOURCE)\s+TO\s+(.+?){CHANNEL}$"
                ))?,
                change_option: Regex::new(&format!(r"(\w+)\s*=\s*(?:{LIT}|(\d+))"))?,
                set_gtid_next: Regex::new(&format!(
                    r"(?i)^SET\s+(?:SESSION\s+|@@SESSION\.)?GTID_NEXT\s*=\s*{LIT}$"
                ))?,
                create_database: Regex::new(&format!(r"(?i)^CREATE\s+DATABASE\s+(IF\s+NOT\s+EXISTS\s+)?{IDENT}$"))?,
                drop_database: Regex::new(&format!(r"(?i)^DROP\s+DATABASE\s+(IF\s+EXISTS\s+)?{IDENT}$"))?,
            })
        })
        .as_ref()
        .map_err(|e| RplError::Internal(format!("simulator pattern: {}", e)))
}

fn unquote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn capture(caps: &regex::Captures<'_>, idx: usize) -> Option<String> {
    caps.get(idx).map(|m| unquote(m.as_str()))
}

fn ident(caps: &regex::Captures<'_>, quoted: usize, bare: usize) -> String {
    caps.get(quoted)
        .map(|m| m.as_str().replace("``", "`"))
        .or_else(|| caps.get(bare).map(|m| m.as_str().to_string()))
        .unwrap_or_default()
}

fn one_column(column: &str, values: impl IntoIterator<Item = String>) -> QueryRows {
    QueryRows::new(
        vec![column.to_string()],
        values.into_iter().map(|v| vec![Some(v)]).collect(),
    )
}

impl ClusterState {
    fn execute(
        &mut self,
        address: &str,
        user: &str,
        gtid_next: &mut Option<Gtid>,
        statement: &str,
    ) -> RplResult<QueryRows> {
        let stmt = statement.trim().trim_end_matches(';').trim();
        self.log.push((address.to_string(), stmt.to_string()));

        match self.servers.get(address) {
            Some(server) if !server.down => {}
            _ => {
                return Err(RplError::connection(
                    address,
                    "Lost connection to MySQL server during query",
                ))
            }
        }
        if self.take_failure(address, stmt) {
            return Err(RplError::query(address, stmt, "injected failure"));
        }

        let p = patterns()?;
        let upper = stmt.to_ascii_uppercase();
        let fail = |reason: &str| RplError::query(address, stmt, reason);

        if upper == "SELECT 1" {
            return Ok(QueryRows::scalar_row("1", Some("1".into())));
        }
        if upper == "SELECT VERSION()" {
            let version = self.server(address)?.version.clone();
            return Ok(QueryRows::scalar_row("VERSION()", Some(version)));
        }
        if upper == "SHOW GRANTS FOR CURRENT_USER()" || upper == "SHOW GRANTS" {
            let grants = self.server(address)?.grants_for(user);
            return Ok(one_column(&format!("Grants for {}@%", user), grants));
        }
        if upper == "SELECT @@GLOBAL.GTID_EXECUTED" {
            let executed = self.server(address)?.gtid_executed.to_string();
            return Ok(QueryRows::scalar_row("@@GLOBAL.GTID_EXECUTED", Some(executed)));
        }
        if let Some(caps) = p.show_variable.captures(stmt) {
            let name = capture(&caps, 1).unwrap_or_default();
            let value = self.server(address)?.variable(&name);
            let rows = value.map(|v| vec![vec![Some(name.clone()), Some(v)]]).unwrap_or_default();
            return Ok(QueryRows::new(vec!["Variable_name".into(), "Value".into()], rows));
        }
        if upper == "SHOW ENGINES" {
            let server = self.server(address)?;
            let rows = server
                .engines
                .iter()
                .map(|(n, s)| vec![Some(n.clone()), Some(s.clone())])
                .collect();
            return Ok(QueryRows::new(vec!["Engine".into(), "Support".into()], rows));
        }
        if upper.starts_with("SELECT DISTINCT ENGINE") {
            let engines: BTreeSet<String> = self.server(address)?.table_engines.iter().cloned().collect();
            return Ok(one_column("ENGINE", engines));
        }
        if let Some(caps) = p.user_count.captures(stmt) {
            let key = (capture(&caps, 1).unwrap_or_default(), capture(&caps, 2).unwrap_or_default());
            let count = usize::from(self.server(address)?.users.contains_key(&key));
            return Ok(QueryRows::scalar_row("COUNT(*)", Some(count.to_string())));
        }
        if let Some(caps) = p.create_user.captures(stmt) {
            let key = (capture(&caps, 1).unwrap_or_default(), capture(&caps, 2).unwrap_or_default());
            let password = capture(&caps, 3).unwrap_or_default();
            let server = self.server_mut(address)?;
            if server.users.contains_key(&key) {
                return Err(fail("Operation CREATE USER failed"));
            }
            server.users.insert(key, SimUser { password, privileges: Vec::new() });
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.show_grants.captures(stmt) {
            let key = (capture(&caps, 1).unwrap_or_default(), capture(&caps, 2).unwrap_or_default());
            let server = self.server(address)?;
            let user = server
                .users
                .get(&key)
                .ok_or_else(|| fail("There is no such grant defined"))?;
            let mut grants = vec![format!("GRANT USAGE ON *.* TO '{}'@'{}'", key.0, key.1)];
            if !user.privileges.is_empty() {
                grants.push(format!("GRANT {} ON *.* TO '{}'@'{}'", user.privileges.join(", "), key.0, key.1));
            }
            return Ok(one_column(&format!("Grants for {}@{}", key.0, key.1), grants));
        }
        if let Some(caps) = p.grant.captures(stmt) {
            let privileges = caps.get(1).map(|m| m.as_str().to_ascii_uppercase()).unwrap_or_default();
            let key = (capture(&caps, 2).unwrap_or_default(), capture(&caps, 3).unwrap_or_default());
            let server = self.server_mut(address)?;
            let user = server
                .users
                .get_mut(&key)
                .ok_or_else(|| fail("You are not allowed to create a user with GRANT"))?;
            for privilege in privileges.split(',') {
                let privilege = privilege.trim().to_string();
                if !user.privileges.contains(&privilege) {
                    user.privileges.push(privilege);
                }
            }
            return Ok(QueryRows::empty());
        }
        if upper == "SHOW MASTER STATUS" || upper == "SHOW BINARY LOG STATUS" {
            let server = self.server(address)?;
            let columns = vec!["File".into(), "Position".into(), "Executed_Gtid_Set".into()];
            if !server.log_bin {
                return Ok(QueryRows::new(columns, Vec::new()));
            }
            let rows = server
                .binlogs
                .last()
                .map(|(file, pos)| {
                    vec![vec![
                        Some(file.clone()),
                        Some(pos.to_string()),
                        Some(server.gtid_executed.to_string()),
                    ]]
                })
                .unwrap_or_default();
            return Ok(QueryRows::new(columns, rows));
        }
        if upper == "SHOW BINARY LOGS" || upper == "SHOW MASTER LOGS" {
            let server = self.server(address)?;
            if !server.log_bin {
                return Err(fail("You are not using binary logging"));
            }
            let rows = server
                .binlogs
                .iter()
                .map(|(f, size)| vec![Some(f.clone()), Some(size.to_string())])
                .collect();
            return Ok(QueryRows::new(vec!["Log_name".into(), "File_size".into()], rows));
        }
        if let Some(caps) = p.replica_status.captures(stmt) {
            return self.replica_status(address, capture(&caps, 1));
        }
        if let Some(caps) = p.start_sql_thread.captures(stmt) {
            let names = self.channel_names(address, capture(&caps, 1), stmt)?;
            let server = self.server_mut(address)?;
            for name in names {
                if let Some(ch) = server.channels.get_mut(&name) {
                    ch.sql_running = true;
                }
            }
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.start_replica.captures(stmt) {
            let names = self.channel_names(address, capture(&caps, 1), stmt)?;
            if names.is_empty() {
                return Err(fail("The server is not configured as slave; fix in config file or with CHANGE MASTER TO"));
            }
            let server = self.server_mut(address)?;
            let latency = server.start_latency;
            for name in names {
                let stall = server.sql_thread_stalls > 0;
                if stall {
                    server.sql_thread_stalls -= 1;
                }
                if let Some(ch) = server.channels.get_mut(&name) {
                    if !ch.started {
                        ch.started = true;
                        ch.sql_running = !stall;
                        ch.pending_polls = latency;
                    }
                }
            }
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.stop_replica.captures(stmt) {
            let names = self.channel_names(address, capture(&caps, 1), stmt)?;
            let server = self.server_mut(address)?;
            for name in names {
                if let Some(ch) = server.channels.get_mut(&name) {
                    ch.started = false;
                    ch.sql_running = false;
                }
            }
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.change_source.captures(stmt) {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let name = capture(&caps, 2).unwrap_or_default();
            let mut options: HashMap<String, String> = HashMap::new();
            for opt in p.change_option.captures_iter(body) {
                let key = opt.get(1).map(|m| m.as_str().to_ascii_uppercase()).unwrap_or_default();
                let key = key
                    .trim_start_matches("MASTER_")
                    .trim_start_matches("SOURCE_")
                    .to_string();
                let value = capture(&opt, 2).or_else(|| opt.get(3).map(|m| m.as_str().to_string()));
                options.insert(key, value.unwrap_or_default());
            }
            let host = options.get("HOST").cloned().ok_or_else(|| fail("missing host"))?;
            let port = options.get("PORT").and_then(|p| p.parse::<u16>().ok()).unwrap_or(3306);
            let server = self.server_mut(address)?;
            if server.channels.get(&name).is_some_and(|c| c.started) {
                return Err(fail("This operation cannot be performed with a running slave; run STOP SLAVE first"));
            }
            let source = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };
            server.channels.insert(
                name,
                SimChannel {
                    source,
                    user: options.get("USER").cloned().unwrap_or_default(),
                    password: options.get("PASSWORD").cloned().unwrap_or_default(),
                    log_file: options.get("LOG_FILE").cloned(),
                    log_pos: options.get("LOG_POS").and_then(|p| p.parse().ok()),
                    started: false,
                    sql_running: false,
                    pending_polls: 0,
                },
            );
            return Ok(QueryRows::empty());
        }
        if upper == "BEGIN" || upper == "START TRANSACTION" || upper == "ROLLBACK" {
            return Ok(QueryRows::empty());
        }
        if upper == "COMMIT" {
            if let Some(gtid) = gtid_next.take() {
                let server = self.server_mut(address)?;
                server.gtid_executed = server.gtid_executed.union(&GtidSet::single(gtid));
            }
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.set_gtid_next.captures(stmt) {
            let value = capture(&caps, 1).unwrap_or_default();
            if value.eq_ignore_ascii_case("AUTOMATIC") {
                *gtid_next = None;
                return Ok(QueryRows::empty());
            }
            if !self.server(address)?.gtid_mode {
                return Err(fail("@@SESSION.GTID_NEXT cannot be set to UUID:NUMBER when @@GLOBAL.GTID_MODE = OFF"));
            }
            let parsed = GtidSet::parse(&value)?;
            let gtid = parsed.iter().next().ok_or_else(|| fail("invalid GTID_NEXT"))?;
            *gtid_next = Some(gtid);
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.create_database.captures(stmt) {
            let if_not_exists = caps.get(1).is_some();
            let name = ident(&caps, 2, 3);
            let server = self.server_mut(address)?;
            if !server.databases.insert(name) && !if_not_exists {
                return Err(fail("Can't create database; database exists"));
            }
            return Ok(QueryRows::empty());
        }
        if let Some(caps) = p.drop_database.captures(stmt) {
            let if_exists = caps.get(1).is_some();
            let name = ident(&caps, 2, 3);
            let server = self.server_mut(address)?;
            if !server.databases.remove(&name) && !if_exists {
                return Err(fail("Can't drop database; database doesn't exist"));
            }
            return Ok(QueryRows::empty());
        }
        if upper == "SHOW DATABASES" {
            return Ok(one_column("Database", self.visible_databases(address)?));
        }

        Err(fail("unsupported statement"))
    }

    fn server(&self, address: &str) -> RplResult<&SimServer> {
        self.servers
            .get(address)
            .ok_or_else(|| RplError::connection(address, "unknown server"))
    }

    fn server_mut(&mut self, address: &str) -> RplResult<&mut SimServer> {
        self.servers
            .get_mut(address)
            .ok_or_else(|| RplError::connection(address, "unknown server"))
    }

    fn take_failure(&mut self, address: &str, stmt: &str) -> bool {
        let upper = stmt.to_ascii_uppercase();
        let Some(idx) = self
            .failures
            .iter()
            .position(|r| r.address == address && upper.starts_with(&r.prefix))
        else {
            return false;
        };
        if let Some(ref mut remaining) = self.failures[idx].remaining {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.failures.remove(idx);
            }
        }
        true
    }

    // 指定通道时只返回该通道(必须存在),否则返回全部通道
    fn channel_names(&self, address: &str, channel: Option<String>, stmt: &str) -> RplResult<Vec<String>> {
        let server = self.server(address)?;
        match channel {
            Some(name) if server.channels.contains_key(&name) => Ok(vec![name]),
            Some(name) => Err(RplError::query(
                address,
                stmt,
                format!("Slave channel '{}' does not exist", name),
            )),
            None => Ok(server.channels.keys().cloned().collect()),
        }
    }

    fn source_accepts(&self, channel: &SimChannel) -> bool {
        let Some(source) = self.servers.get(&channel.source) else {
            return false;
        };
        !source.down
            && source.log_bin
            && source.users.iter().any(|((user, _), u)| {
                user == &channel.user
                    && u.password == channel.password
                    && u.privileges.iter().any(|p| p == "REPLICATION SLAVE" || p == "ALL PRIVILEGES")
            })
    }

    fn channel_live(&self, channel: &SimChannel) -> bool {
        channel.started && channel.pending_polls == 0 && channel.sql_running && self.source_accepts(channel)
    }

    fn replica_status(&mut self, address: &str, channel: Option<String>) -> RplResult<QueryRows> {
        let names = match channel {
            Some(name) => {
                if self.server(address)?.channels.contains_key(&name) {
                    vec![name]
                } else {
                    Vec::new()
                }
            }
            None => self.server(address)?.channels.keys().cloned().collect(),
        };
        let dialect = self.server(address)?.dialect();
        let replica = dialect.uses_replica_syntax();
        let waiting = if replica { WAITING_STATES[1] } else { WAITING_STATES[0] };
        let connecting = if replica { "Connecting to source" } else { "Connecting to master" };

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let Some(ch) = self.server(address)?.channels.get(&name).cloned() else {
                continue;
            };
            let accepted = self.source_accepts(&ch);
            let server = self.server_mut(address)?;
            let settling = ch.started && ch.pending_polls > 0;
            if settling {
                if let Some(live) = server.channels.get_mut(&name) {
                    live.pending_polls -= 1;
                }
            }

            let (state, io_running, io_error) = if !ch.started {
                ("", "No", String::new())
            } else if settling {
                (connecting, "Connecting", String::new())
            } else if accepted {
                (waiting, "Yes", String::new())
            } else {
                (
                    connecting,
                    "Connecting",
                    format!("error connecting to master '{}@{}' - retry-time: 60", ch.user, ch.source),
                )
            };
            let sql_running = if ch.started && ch.sql_running { "Yes" } else { "No" };
            let (host, port) = ch.source.rsplit_once(':').unwrap_or((ch.source.as_str(), "3306"));
            rows.push(vec![
                Some(state.to_string()),
                Some(host.trim_start_matches('[').trim_end_matches(']').to_string()),
                Some(port.to_string()),
                ch.log_file.clone(),
                ch.log_pos.map(|p| p.to_string()),
                Some(io_running.to_string()),
                Some(sql_running.to_string()),
                Some(io_error),
                Some(String::new()),
                Some(server.gtid_executed.to_string()),
                Some(name.clone()),
            ]);
        }

        let (source_prefix, replica_prefix) = if replica { ("Source", "Replica") } else { ("Master", "Slave") };
        let columns = vec![
            dialect.io_state_column().to_string(),
            format!("{}_Host", source_prefix),
            format!("{}_Port", source_prefix),
            format!("{}_Log_File", source_prefix),
            format!("Read_{}_Log_Pos", source_prefix),
            format!("{}_IO_Running", replica_prefix),
            format!("{}_SQL_Running", replica_prefix),
            "Last_IO_Error".to_string(),
            "Last_SQL_Error".to_string(),
            "Executed_Gtid_Set".to_string(),
            "Channel_Name".to_string(),
        ];
        Ok(QueryRows::new(columns, rows))
    }

    fn visible_databases(&self, address: &str) -> RplResult<BTreeSet<String>> {
        let server = self.server(address)?;
        let mut databases = server.databases.clone();
        if server.apply_events {
            for ch in server.channels.values() {
                if self.channel_live(ch) {
                    if let Some(source) = self.servers.get(&ch.source) {
                        databases.extend(source.databases.iter().cloned());
                    }
                }
            }
        }
        Ok(databases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(s: &str) -> ConnectionDescriptor {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_variables_and_version() {
        let cluster = SimCluster::new();
        cluster.add_server("a:3306", SimServer::new(3).with_version("5.7.44-log").with_log_bin(false));
        let mut conn = cluster.connect(&desc("root@a:3306")).await.unwrap();
        let rows = conn.query("SHOW VARIABLES LIKE 'server_id'").await.unwrap();
        assert_eq!(rows.first("Value"), Some("3"));
        let rows = conn.query("SHOW VARIABLES LIKE 'log_bin'").await.unwrap();
        assert_eq!(rows.first("Value"), Some("OFF"));
        assert!(conn.query("SHOW VARIABLES LIKE 'nonexistent'").await.unwrap().is_empty());
        assert_eq!(conn.query("SELECT VERSION()").await.unwrap().scalar(), Some("5.7.44-log"));
        assert!(conn.query("FLUSH EVERYTHING").await.is_err());
    }

    #[tokio::test]
    async fn test_replication_channel_lifecycle() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1).with_user("rpl", "s", "pw", &["REPLICATION SLAVE"]));
        cluster.add_server("s:3306", SimServer::new(2).with_start_latency(1));
        let mut conn = cluster.connect(&desc("root@s:3306")).await.unwrap();
        conn.execute("CHANGE REPLICATION SOURCE TO SOURCE_HOST = 'm', SOURCE_PORT = 3306, SOURCE_USER = 'rpl', SOURCE_PASSWORD = 'pw' FOR CHANNEL 'c1'")
            .await
            .unwrap();
        conn.execute("START REPLICA FOR CHANNEL 'c1'").await.unwrap();

        let first = conn.query("SHOW REPLICA STATUS FOR CHANNEL 'c1'").await.unwrap();
        assert_eq!(first.first("Replica_IO_Running"), Some("Connecting"));
        let second = conn.query("SHOW REPLICA STATUS FOR CHANNEL 'c1'").await.unwrap();
        assert_eq!(second.first("Replica_IO_State"), Some("Waiting for source to send event"));
        assert_eq!(second.first("Replica_SQL_Running"), Some("Yes"));
        assert_eq!(cluster.channel_source("s:3306", "c1").as_deref(), Some("m:3306"));

        let err = conn.execute("CHANGE REPLICATION SOURCE TO SOURCE_HOST = 'x' FOR CHANNEL 'c1'").await;
        assert!(err.is_err());
        conn.execute("STOP REPLICA FOR CHANNEL 'c1'").await.unwrap();
        assert!(!cluster.channel_started("s:3306", "c1"));
    }

    #[tokio::test]
    async fn test_empty_transaction_injection() {
        let u = Uuid::from_u128(77);
        let cluster = SimCluster::new();
        cluster.add_server("s:3306", SimServer::new(2).with_gtid_mode(true));
        let mut conn = cluster.connect(&desc("root@s:3306")).await.unwrap();
        conn.execute(&format!("SET GTID_NEXT = '{}:5'", u)).await.unwrap();
        conn.execute("BEGIN").await.unwrap();
        conn.execute("COMMIT").await.unwrap();
        conn.execute("SET GTID_NEXT = 'AUTOMATIC'").await.unwrap();
        assert_eq!(cluster.gtid_executed("s:3306").unwrap().to_string(), format!("{}:5", u));
    }

    #[tokio::test]
    async fn test_failure_injection_and_connection_counting() {
        let cluster = SimCluster::new();
        cluster.add_server("a:3306", SimServer::new(1));
        cluster.fail_statement("a:3306", "select 1", Some(1));
        let mut conn = cluster.connect(&desc("root@a:3306")).await.unwrap();
        assert!(conn.ping().await.is_err());
        assert!(conn.ping().await.is_ok());
        assert_eq!(cluster.open_connections("a:3306"), 1);

        cluster.set_down("a:3306", true);
        assert!(matches!(conn.ping().await, Err(RplError::Connection { .. })));
        assert!(cluster.connect(&desc("root@a:3306")).await.is_err());
        drop(conn);
        assert_eq!(cluster.total_open_connections(), 0);
        assert_eq!(cluster.statements("a:3306").len(), 3);
    }

    #[tokio::test]
    async fn test_password_checked() {
        let cluster = SimCluster::new();
        cluster.add_server("a:3306", SimServer::new(1).with_password("secret"));
        assert!(cluster.connect(&desc("root:wrong@a:3306")).await.is_err());
        assert!(cluster.connect(&desc("root:secret@a:3306")).await.is_ok());
    }
}
