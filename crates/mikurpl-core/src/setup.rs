//! 复制搭建协议
//!
//! 解析连接 → 拓扑校验 → 配置从库(复制用户、二进制日志坐标、停止/指向/启动复制)
//! → 在重试预算内等待复制线程运行 → 可选的测试库同步验证。
//! 任何致命发现都会在对从库发出写语句之前中止搭建。

use crate::client::{DatabaseClient, QueryRows};
use crate::connector::{connect_pair, ConnectorOptions, ServerEndpoint};
use crate::sql::{account, quote_identifier, quote_literal, ChangeSource, Dialect, WAITING_STATES};
use crate::validator::{validate, TopologyCheckReport, ValidatorOptions};
use mikurpl_common::{
    retry_with, Attempt, ConnectionDescriptor, ReplicationUser, RetryPolicy, RplError, RplResult, ServerVersion,
    SetupConfig,
};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// 复制链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Unconfigured,
    Configuring,
    Running,
    Failed,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStatus::Unconfigured => "unconfigured",
            LinkStatus::Configuring => "configuring",
            LinkStatus::Running => "running",
            LinkStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 一主一从的复制链路
///
/// 最近一次校验报告带有致命发现时,拒绝进入 running。
#[derive(Debug, Clone)]
pub struct ReplicationLink {
    main: String,
    subordinate: String,
    user: ReplicationUser,
    attempts: u32,
    channel: Option<String>,
    status: LinkStatus,
    fatal_report: bool,
}

impl ReplicationLink {
    pub fn new(
        main: impl Into<String>,
        subordinate: impl Into<String>,
        user: ReplicationUser,
        attempts: u32,
        channel: Option<String>,
    ) -> Self {
        Self {
            main: main.into(),
            subordinate: subordinate.into(),
            user,
            attempts,
            channel,
            status: LinkStatus::Unconfigured,
            fatal_report: false,
        }
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn subordinate(&self) -> &str {
        &self.subordinate
    }

    pub fn user(&self) -> &ReplicationUser {
        &self.user
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// 记录最近一次校验结果
    pub fn attach_report(&mut self, report: &TopologyCheckReport) {
        self.fatal_report = report.has_fatal();
    }

    pub fn begin_configuring(&mut self) -> RplResult<()> {
        match self.status {
            LinkStatus::Unconfigured | LinkStatus::Failed => {
                self.status = LinkStatus::Configuring;
                Ok(())
            }
            other => Err(RplError::IllegalTransition(format!("link {} -> configuring", other))),
        }
    }

    pub fn mark_running(&mut self) -> RplResult<()> {
        if self.fatal_report {
            return Err(RplError::IllegalTransition(
                "link cannot run while its check report has a fatal finding".into(),
            ));
        }
        if self.status != LinkStatus::Configuring {
            return Err(RplError::IllegalTransition(format!("link {} -> running", self.status)));
        }
        self.status = LinkStatus::Running;
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        self.status = LinkStatus::Failed;
    }
}

/// 搭建选项
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub min_version: ServerVersion,
    pub pedantic: bool,
    pub start_policy: RetryPolicy,
    pub verify_policy: RetryPolicy,
    /// 多源复制的通道名
    pub channel: Option<String>,
    /// 指定主库二进制日志文件
    pub main_log_file: Option<String>,
    pub main_log_pos: Option<u64>,
    /// 从主库第一个二进制日志的开头开始复制
    pub from_beginning: bool,
    /// 验证用的测试库
    pub test_db: Option<String>,
}

impl SetupOptions {
    pub fn from_config(config: &SetupConfig) -> Self {
        Self {
            min_version: config.min_version,
            pedantic: config.pedantic,
            start_policy: config.start_policy(),
            verify_policy: config.verify_policy(),
            channel: None,
            main_log_file: None,
            main_log_pos: None,
            from_beginning: false,
            test_db: None,
        }
    }
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self::from_config(&SetupConfig::default())
    }
}

/// 测试库同步验证结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Verification {
    Skipped,
    Passed { database: String },
    Failed { database: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub link: ReplicationLink,
    pub report: TopologyCheckReport,
    pub verification: Verification,
}

/// 复制通道状态(SHOW REPLICA STATUS 的一行)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ChannelStatus {
    pub channel: Option<String>,
    pub io_state: String,
    /// Yes / No / Connecting
    pub io_running: String,
    pub sql_running: bool,
    pub last_io_error: Option<String>,
    pub last_sql_error: Option<String>,
}

impl ChannelStatus {
    fn from_row(rows: &QueryRows, row: usize, dialect: Dialect) -> Self {
        let pick = |primary: &str, fallback: &str| {
            rows.value(row, primary)
                .or_else(|| rows.value(row, fallback))
                .map(str::to_string)
                .unwrap_or_default()
        };
        let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            channel: non_empty(rows.value(row, "Channel_Name")),
            io_state: pick(dialect.io_state_column(), alternate(dialect.io_state_column())),
            io_running: pick(dialect.io_running_column(), alternate(dialect.io_running_column())),
            sql_running: pick(dialect.sql_running_column(), alternate(dialect.sql_running_column()))
                .eq_ignore_ascii_case("Yes"),
            last_io_error: non_empty(rows.value(row, "Last_IO_Error")),
            last_sql_error: non_empty(rows.value(row, "Last_SQL_Error")),
        }
    }

    pub fn io_running(&self) -> bool {
        self.io_running.eq_ignore_ascii_case("Yes")
    }

    /// IO 线程在等待主库事件且 SQL 线程在运行
    pub fn is_running(&self) -> bool {
        WAITING_STATES.iter().any(|s| self.io_state.eq_ignore_ascii_case(s)) && self.sql_running
    }

    pub fn describe(&self) -> String {
        let mut text = format!(
            "IO thread {} ({}), SQL thread {}",
            self.io_running,
            if self.io_state.is_empty() { "idle" } else { &self.io_state },
            if self.sql_running { "running" } else { "stopped" }
        );
        if let Some(ref e) = self.last_io_error {
            text.push_str(&format!("; last IO error: {}", e));
        }
        if let Some(ref e) = self.last_sql_error {
            text.push_str(&format!("; last SQL error: {}", e));
        }
        text
    }
}

fn alternate(column: &str) -> &str {
    match column {
        "Replica_IO_State" => "Slave_IO_State",
        "Replica_IO_Running" => "Slave_IO_Running",
        "Replica_SQL_Running" => "Slave_SQL_Running",
        "Slave_IO_State" => "Replica_IO_State",
        "Slave_IO_Running" => "Replica_IO_Running",
        "Slave_SQL_Running" => "Replica_SQL_Running",
        other => other,
    }
}

/// 读取从库上某个通道的复制状态;未配置时返回 None
pub async fn channel_status(
    subordinate: &mut ServerEndpoint,
    channel: Option<&str>,
) -> RplResult<Option<ChannelStatus>> {
    let dialect = subordinate.dialect();
    let rows = match subordinate.query(&dialect.show_replica_status(channel)).await {
        Ok(rows) => rows,
        // 指定的通道不存在
        Err(RplError::Query { .. }) if channel.is_some() => return Ok(None),
        Err(e) => return Err(e),
    };
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(ChannelStatus::from_row(&rows, 0, dialect)))
}

/// 停止从库上某个通道的复制线程(未配置或已停止时不做任何事)
pub async fn stop_replication(subordinate: &mut ServerEndpoint, channel: Option<&str>) -> RplResult<()> {
    let Some(status) = channel_status(subordinate, channel).await? else {
        return Ok(());
    };
    if status.io_running.eq_ignore_ascii_case("No") && !status.sql_running {
        return Ok(());
    }
    let statement = subordinate.dialect().stop_replica(channel);
    subordinate.execute(&statement).await?;
    info!("Stopped replication on {}{}", subordinate.label(), channel_suffix(channel));
    Ok(())
}

fn channel_suffix(channel: Option<&str>) -> String {
    channel.map(|c| format!(" (channel '{}')", c)).unwrap_or_default()
}

/// # Brief
/// 在主库上确保复制用户存在并拥有 REPLICATION SLAVE 权限
///
/// # Arguments
/// * `main` - 主库端点
/// * `user` - 复制用户
/// * `host` - 从库连接主库时使用的主机名
pub async fn ensure_replication_user(main: &mut ServerEndpoint, user: &ReplicationUser, host: &str) -> RplResult<()> {
    let exists = main
        .query(&format!(
            "SELECT COUNT(*) FROM mysql.user WHERE user = {} AND host = {}",
            quote_literal(&user.user),
            quote_literal(host)
        ))
        .await?
        .scalar()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        > 0;

    let who = account(&user.user, host);
    if !exists {
        info!("Creating replication user {} on {}", who, main.label());
        main.execute(&format!("CREATE USER {} IDENTIFIED BY {}", who, quote_literal(&user.password)))
            .await?;
    }

    let grants = main.query(&format!("SHOW GRANTS FOR {}", who)).await?;
    let granted = grants.column(0).flatten().any(|g| {
        let g = g.to_ascii_uppercase();
        g.contains("REPLICATION SLAVE") || g.contains("ALL PRIVILEGES")
    });
    if !granted {
        info!("Granting replication access to {}", who);
        main.execute(&format!("GRANT REPLICATION SLAVE ON *.* TO {}", who)).await?;
    }
    Ok(())
}

/// 确定复制起点 (文件, 位置)
async fn binlog_coordinates(main: &mut ServerEndpoint, options: &SetupOptions) -> RplResult<(String, u64)> {
    if options.from_beginning || options.main_log_file.is_some() {
        let logs: Vec<String> = main
            .query("SHOW BINARY LOGS")
            .await?
            .column(0)
            .flatten()
            .map(str::to_string)
            .collect();
        if let Some(ref file) = options.main_log_file {
            if !logs.contains(file) {
                return Err(RplError::Config(format!(
                    "binary log file '{}' does not exist on {}",
                    file,
                    main.label()
                )));
            }
            return Ok((file.clone(), options.main_log_pos.unwrap_or(4)));
        }
        let first = logs.into_iter().next().ok_or_else(|| RplError::BinlogDisabled {
            server: main.label(),
        })?;
        return Ok((first, 4));
    }

    let statement = main.dialect().show_main_status();
    let rows = main.query(statement).await?;
    match (rows.first("File"), rows.first("Position").and_then(|p| p.parse::<u64>().ok())) {
        (Some(file), Some(pos)) => Ok((file.to_string(), pos)),
        _ => Err(RplError::BinlogDisabled { server: main.label() }),
    }
}

/// 轮询直到复制线程运行;SQL 线程停止时重新启动它
async fn wait_until_running(
    subordinate: &mut ServerEndpoint,
    channel: Option<String>,
    policy: RetryPolicy,
) -> RplResult<()> {
    let operation = format!("replication start on {}{}", subordinate.label(), channel_suffix(channel.as_deref()));
    retry_with(policy, &operation, subordinate, move |sub, attempt| {
        let channel = channel.clone();
        Box::pin(async move {
            let Some(status) = channel_status(sub, channel.as_deref()).await? else {
                return Ok(Attempt::Retry("replication status not available".into()));
            };
            if status.is_running() {
                return Ok(Attempt::Done(()));
            }
            debug!(attempt, "Waiting for replication: {}", status.describe());
            if !status.sql_running {
                let restart = sub.dialect().start_sql_thread(channel.as_deref());
                sub.execute(&restart).await?;
            }
            Ok(Attempt::Retry(status.describe()))
        })
    })
    .await
}

/// 在主库创建测试库并等待它出现在从库上;无论结果如何都删除测试库
async fn verify_with_test_db(
    main: &mut ServerEndpoint,
    subordinate: &mut ServerEndpoint,
    database: &str,
    policy: RetryPolicy,
) -> Verification {
    info!("Testing replication setup with database '{}'", database);
    let quoted = quote_identifier(database);

    let result = match main.execute(&format!("CREATE DATABASE {}", quoted)).await {
        Ok(()) => {
            let operation = format!("test database sync to {}", subordinate.label());
            let name = database.to_string();
            retry_with(policy, &operation, subordinate, move |sub, _| {
                let name = name.clone();
                Box::pin(async move {
                    let rows = sub.query("SHOW DATABASES").await?;
                    if rows.column(0).flatten().any(|db| db == name) {
                        Ok(Attempt::Done(()))
                    } else {
                        Ok(Attempt::Retry(format!("database '{}' not yet on subordinate", name)))
                    }
                })
            })
            .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = main.execute(&format!("DROP DATABASE IF EXISTS {}", quoted)).await {
        warn!("Cannot drop test database '{}' on {}: {}", database, main.label(), e);
    }

    match result {
        Ok(()) => Verification::Passed {
            database: database.to_string(),
        },
        Err(e) => {
            warn!("Replication test with database '{}' failed: {}", database, e);
            Verification::Failed {
                database: database.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// # Brief
/// 解析连接并搭建复制
///
/// # Arguments
/// * `client` - 数据库客户端能力
/// * `main` / `subordinate` - 连接描述符
/// * `user` - 复制用户
/// * `options` - 搭建选项
///
/// # Returns
/// 成功返回链路、校验报告与验证结果;连接在返回前释放
pub async fn setup_replication(
    client: &dyn DatabaseClient,
    main: &ConnectionDescriptor,
    subordinate: &ConnectionDescriptor,
    user: &ReplicationUser,
    options: &SetupOptions,
) -> RplResult<SetupOutcome> {
    let connector = ConnectorOptions {
        min_version: options.min_version,
        unique: true,
    };
    let (mut main_ep, mut sub_ep) = connect_pair(client, main, subordinate, connector).await?;
    configure_replication(&mut main_ep, &mut sub_ep, user, options).await
}

/// 在已解析的端点上执行校验与配置
pub async fn configure_replication(
    main: &mut ServerEndpoint,
    subordinate: &mut ServerEndpoint,
    user: &ReplicationUser,
    options: &SetupOptions,
) -> RplResult<SetupOutcome> {
    let mut link = ReplicationLink::new(
        main.label(),
        subordinate.label(),
        user.clone(),
        options.start_policy.attempts,
        options.channel.clone(),
    );

    let report = validate(main, subordinate, ValidatorOptions { pedantic: options.pedantic }).await?;
    link.attach_report(&report);
    if let Some(err) = report.to_error() {
        link.mark_failed();
        return Err(err);
    }

    link.begin_configuring()?;
    info!("Setting up replication {} -> {}", main.label(), subordinate.label());
    if let Err(e) = configure_subordinate(main, subordinate, user, options).await {
        link.mark_failed();
        return Err(match e {
            RplError::Setup(_) => e,
            other => RplError::Setup(Box::new(other)),
        });
    }
    link.mark_running()?;
    info!("Replication {} -> {} is running", main.label(), subordinate.label());

    let verification = match options.test_db {
        Some(ref db) => verify_with_test_db(main, subordinate, db, options.verify_policy).await,
        None => Verification::Skipped,
    };

    Ok(SetupOutcome {
        link,
        report,
        verification,
    })
}

async fn configure_subordinate(
    main: &mut ServerEndpoint,
    subordinate: &mut ServerEndpoint,
    user: &ReplicationUser,
    options: &SetupOptions,
) -> RplResult<()> {
    let sub_host = subordinate.descriptor().host.clone();
    ensure_replication_user(main, user, &sub_host).await?;

    let (log_file, log_pos) = binlog_coordinates(main, options).await?;
    debug!("Main coordinates: {}:{}", log_file, log_pos);

    let channel = options.channel.as_deref();
    stop_replication(subordinate, channel).await?;

    let main_desc = main.descriptor();
    let change = subordinate.dialect().change_source(&ChangeSource {
        host: main_desc.host.clone(),
        port: main_desc.port,
        user: user.user.clone(),
        password: user.password.clone(),
        log_file: Some(log_file),
        log_pos: Some(log_pos),
        channel: options.channel.clone(),
    });
    subordinate.execute(&change).await?;

    let start = subordinate.dialect().start_replica(channel);
    subordinate.execute(&start).await?;
    subordinate.execute("COMMIT").await?;

    wait_until_running(subordinate, options.channel.clone(), options.start_policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCluster, SimServer};
    use std::time::Duration;

    fn desc(s: &str) -> ConnectionDescriptor {
        s.parse().unwrap()
    }

    fn fast_options() -> SetupOptions {
        SetupOptions {
            start_policy: RetryPolicy::fixed(10, Duration::from_millis(1)),
            verify_policy: RetryPolicy::fixed(10, Duration::from_millis(1)),
            ..SetupOptions::default()
        }
    }

    fn user() -> ReplicationUser {
        "rpl:rpl".parse().unwrap()
    }

    fn cluster() -> SimCluster {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1));
        cluster.add_server("s:3306", SimServer::new(2).with_start_latency(2));
        cluster
    }

    #[tokio::test]
    async fn test_setup_happy_path() {
        let cluster = cluster();
        let outcome = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &fast_options())
            .await
            .unwrap();
        assert_eq!(outcome.link.status(), LinkStatus::Running);
        assert!(outcome.report.passed());
        assert_eq!(outcome.verification, Verification::Skipped);
        assert!(cluster.has_user("m:3306", "rpl", "s"));
        assert_eq!(cluster.channel_source("s:3306", "").as_deref(), Some("m:3306"));
        assert_eq!(cluster.total_open_connections(), 0);

        let statements = cluster.statements("s:3306");
        assert!(statements.iter().any(|s| s.starts_with("CHANGE REPLICATION SOURCE TO SOURCE_HOST = 'm'")));
        assert!(statements.iter().any(|s| s == "START REPLICA"));
    }

    #[tokio::test]
    async fn test_legacy_server_uses_master_syntax() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1).with_version("5.7.44-log"));
        cluster.add_server("s:3306", SimServer::new(2).with_version("5.7.44-log"));
        setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &fast_options())
            .await
            .unwrap();
        let statements = cluster.statements("s:3306");
        assert!(statements.iter().any(|s| s.starts_with("CHANGE MASTER TO MASTER_HOST = 'm'")));
        assert!(statements.iter().any(|s| s == "START SLAVE"));
    }

    #[tokio::test]
    async fn test_binlog_disabled_fails_before_subordinate_writes() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1).with_log_bin(false));
        cluster.add_server("s:3306", SimServer::new(2));
        let err = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, RplError::BinlogDisabled { .. }));
        assert!(err.to_string().contains("Main must have binary logging turned on."));
        let writes = cluster
            .statements("s:3306")
            .into_iter()
            .filter(|s| !s.starts_with("SHOW") && !s.starts_with("SELECT"))
            .count();
        assert_eq!(writes, 0);
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_same_server_id_aborts_with_uniqueness_error() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(5));
        cluster.add_server("s:3306", SimServer::new(5).with_uuid(Some(uuid::Uuid::from_u128(99))));
        let err = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, RplError::Uniqueness(_)));
        assert!(!cluster.statements("s:3306").iter().any(|s| s.starts_with("CHANGE")));
    }

    #[tokio::test]
    async fn test_sql_thread_is_restarted() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1));
        cluster.add_server("s:3306", SimServer::new(2).with_sql_thread_stalls(1));
        let outcome = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &fast_options())
            .await
            .unwrap();
        assert_eq!(outcome.link.status(), LinkStatus::Running);
        assert!(cluster.statements("s:3306").iter().any(|s| s == "START REPLICA SQL_THREAD"));
    }

    #[tokio::test]
    async fn test_start_timeout_wraps_setup_error() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1));
        cluster.add_server("s:3306", SimServer::new(2).with_start_latency(100));
        let options = SetupOptions {
            start_policy: RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..fast_options()
        };
        let err = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &options)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Cannot setup replication."));
        assert!(matches!(err.root(), RplError::SetupTimeout { attempts: 3, .. }));
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_verification_with_test_db() {
        let cluster = cluster();
        let options = SetupOptions {
            test_db: Some("rpl_test".into()),
            ..fast_options()
        };
        let outcome = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &options)
            .await
            .unwrap();
        assert_eq!(outcome.verification, Verification::Passed { database: "rpl_test".into() });
        assert!(!cluster.databases("m:3306").contains(&"rpl_test".to_string()));
    }

    #[tokio::test]
    async fn test_failed_verification_keeps_link_running_and_drops_db() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1));
        cluster.add_server("s:3306", SimServer::new(2).with_apply_events(false));
        let options = SetupOptions {
            test_db: Some("rpl_test".into()),
            verify_policy: RetryPolicy::fixed(2, Duration::from_millis(1)),
            ..fast_options()
        };
        let outcome = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &options)
            .await
            .unwrap();
        assert_eq!(outcome.link.status(), LinkStatus::Running);
        assert!(matches!(outcome.verification, Verification::Failed { .. }));
        assert!(cluster.statements("m:3306").iter().any(|s| s == "DROP DATABASE IF EXISTS `rpl_test`"));
    }

    #[tokio::test]
    async fn test_existing_user_not_recreated_and_explicit_coordinates() {
        let cluster = SimCluster::new();
        cluster.add_server("m:3306", SimServer::new(1).with_user("rpl", "s", "rpl", &["REPLICATION SLAVE"]));
        cluster.add_server("s:3306", SimServer::new(2));
        let options = SetupOptions {
            main_log_file: Some("binlog.000001".into()),
            main_log_pos: Some(4),
            ..fast_options()
        };
        setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &options)
            .await
            .unwrap();
        let main_statements = cluster.statements("m:3306");
        assert!(!main_statements.iter().any(|s| s.starts_with("CREATE USER")));
        assert!(!main_statements.iter().any(|s| s.starts_with("GRANT")));
        assert!(cluster
            .statements("s:3306")
            .iter()
            .any(|s| s.contains("SOURCE_LOG_FILE = 'binlog.000001', SOURCE_LOG_POS = 4")));

        let bad = SetupOptions {
            main_log_file: Some("binlog.999999".into()),
            ..fast_options()
        };
        let err = setup_replication(&cluster, &desc("root@m:3306"), &desc("root@s:3306"), &user(), &bad)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), RplError::Config(_)));
    }

    #[test]
    fn test_link_refuses_running_with_fatal_report() {
        use crate::validator::{check, InnoDbFacts, ServerFacts};
        let facts = |label: &str, id| ServerFacts {
            label: label.into(),
            server_id: id,
            server_uuid: None,
            log_bin: false,
            innodb: InnoDbFacts::default(),
            available_engines: Default::default(),
            table_engines: Default::default(),
        };
        let report = check(&facts("main 'a'", 1), &facts("subordinate 'b'", 2), ValidatorOptions::default());
        let mut link = ReplicationLink::new("main 'a'", "subordinate 'b'", user(), 10, None);
        link.attach_report(&report);
        link.begin_configuring().unwrap();
        assert!(matches!(link.mark_running(), Err(RplError::IllegalTransition(_))));
        assert!(matches!(
            ReplicationLink::new("a", "b", user(), 10, None).mark_running(),
            Err(RplError::IllegalTransition(_))
        ));
    }
}
