//! 拓扑预检
//!
//! 先从主库和从库读取只读的 [`ServerFacts`],再按固定顺序运行五项检查:
//!
//! 1. server_id 唯一性
//! 2. server_uuid 唯一性
//! 3. InnoDB 兼容性
//! 4. 存储引擎可用性
//! 5. 主库二进制日志
//!
//! 每项检查产出带严重级别的结构化发现;没有发现即通过。
//! pedantic 模式把第 3、4 项的警告升级为致命。

use crate::connector::ServerEndpoint;
use mikurpl_common::{RplError, RplResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 检查项标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckId {
    ServerIdUniqueness,
    UuidUniqueness,
    InnodbCompatibility,
    StorageEngines,
    MainBinlog,
}

impl CheckId {
    pub const ORDER: [CheckId; 5] = [
        CheckId::ServerIdUniqueness,
        CheckId::UuidUniqueness,
        CheckId::InnodbCompatibility,
        CheckId::StorageEngines,
        CheckId::MainBinlog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckId::ServerIdUniqueness => "server_id",
            CheckId::UuidUniqueness => "server_uuid",
            CheckId::InnodbCompatibility => "innodb",
            CheckId::StorageEngines => "storage_engines",
            CheckId::MainBinlog => "binlog",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CheckId::ServerIdUniqueness => "Checking server_id values",
            CheckId::UuidUniqueness => "Checking server_uuid values",
            CheckId::InnodbCompatibility => "Checking InnoDB compatibility",
            CheckId::StorageEngines => "Checking storage engines compatibility",
            CheckId::MainBinlog => "Checking main binary logging",
        }
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

/// 单条发现
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub check: CheckId,
    pub severity: Severity,
    pub message: String,
    /// 附加细节,只在高详细度时展示
    pub details: Vec<String>,
}

impl Finding {
    fn new(check: CheckId, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            check,
            severity,
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check: CheckId,
    pub findings: Vec<Finding>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.findings.is_empty()
    }
}

/// 一次校验运行的报告,构建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyCheckReport {
    main: String,
    subordinate: String,
    results: Vec<CheckResult>,
}

impl TopologyCheckReport {
    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn subordinate(&self) -> &str {
        &self.subordinate
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    pub fn result(&self, check: CheckId) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.check == check)
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.results.iter().flat_map(|r| r.findings.iter())
    }

    pub fn first_fatal(&self) -> Option<&Finding> {
        self.findings().find(|f| f.is_fatal())
    }

    pub fn has_fatal(&self) -> bool {
        self.first_fatal().is_some()
    }

    pub fn passed(&self) -> bool {
        self.results.iter().all(CheckResult::passed)
    }

    /// 第一条致命发现对应的错误
    pub fn to_error(&self) -> Option<RplError> {
        let finding = self.first_fatal()?;
        Some(match finding.check {
            CheckId::ServerIdUniqueness | CheckId::UuidUniqueness => RplError::Uniqueness(finding.message.clone()),
            CheckId::InnodbCompatibility | CheckId::StorageEngines => RplError::Compatibility {
                check: finding.check.to_string(),
                message: finding.message.clone(),
            },
            CheckId::MainBinlog => RplError::BinlogDisabled {
                server: self.main.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InnoDbFacts {
    pub available: bool,
    pub version: Option<String>,
    pub page_size: Option<u64>,
}

impl fmt::Display for InnoDbFacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.available {
            return f.write_str("InnoDB not available");
        }
        write!(
            f,
            "innodb_version={}, innodb_page_size={}",
            self.version.as_deref().unwrap_or("unknown"),
            self.page_size.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
        )
    }
}

/// 校验所需的只读服务器事实
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFacts {
    pub label: String,
    pub server_id: u32,
    pub server_uuid: Option<Uuid>,
    pub log_bin: bool,
    pub innodb: InnoDbFacts,
    /// 可用引擎(大写)
    pub available_engines: BTreeSet<String>,
    /// 用户表使用的引擎(大写)
    pub table_engines: BTreeSet<String>,
}

const USER_TABLE_ENGINES: &str = "SELECT DISTINCT ENGINE FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
     AND ENGINE IS NOT NULL";

impl ServerFacts {
    /// 只读地收集一个端点的事实
    pub async fn collect(endpoint: &mut ServerEndpoint) -> RplResult<Self> {
        let available_engines: BTreeSet<String> = endpoint
            .engines()
            .iter()
            .filter(|e| e.is_available())
            .map(|e| e.name.to_ascii_uppercase())
            .collect();

        let innodb_available = available_engines.contains("INNODB");
        let innodb = if innodb_available {
            InnoDbFacts {
                available: true,
                version: endpoint.variable("innodb_version").await?,
                page_size: endpoint
                    .variable("innodb_page_size")
                    .await?
                    .and_then(|v| v.trim().parse().ok()),
            }
        } else {
            InnoDbFacts::default()
        };

        let log_bin = endpoint.variable_on("log_bin").await?;
        let table_engines = endpoint
            .query(USER_TABLE_ENGINES)
            .await?
            .column(0)
            .flatten()
            .map(str::to_ascii_uppercase)
            .collect();

        Ok(Self {
            label: endpoint.label(),
            server_id: endpoint.server_id(),
            server_uuid: endpoint.server_uuid(),
            log_bin,
            innodb,
            available_engines,
            table_engines,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorOptions {
    pub pedantic: bool,
}

/// # Brief
/// 收集事实并运行全部检查
pub async fn validate(
    main: &mut ServerEndpoint,
    subordinate: &mut ServerEndpoint,
    options: ValidatorOptions,
) -> RplResult<TopologyCheckReport> {
    let main_facts = ServerFacts::collect(main).await?;
    let sub_facts = ServerFacts::collect(subordinate).await?;
    let report = check(&main_facts, &sub_facts, options);
    for finding in report.findings() {
        match finding.severity {
            Severity::Fatal => warn!(check = %finding.check, "FATAL: {}", finding.message),
            Severity::Warning => warn!(check = %finding.check, "WARNING: {}", finding.message),
        }
    }
    info!(
        "Topology check {} -> {}: {}",
        report.main,
        report.subordinate,
        if report.has_fatal() { "failed" } else { "passed" }
    );
    Ok(report)
}

/// 在已收集的事实上运行检查(纯函数)
pub fn check(main: &ServerFacts, subordinate: &ServerFacts, options: ValidatorOptions) -> TopologyCheckReport {
    let results = CheckId::ORDER
        .iter()
        .map(|&id| {
            let findings = match id {
                CheckId::ServerIdUniqueness => check_server_ids(main, subordinate),
                CheckId::UuidUniqueness => check_uuids(main, subordinate),
                CheckId::InnodbCompatibility => check_innodb(main, subordinate, options),
                CheckId::StorageEngines => check_engines(main, subordinate, options),
                CheckId::MainBinlog => check_binlog(main),
            };
            debug!("{} ... {}", id.description(), if findings.is_empty() { "pass" } else { "FAIL" });
            CheckResult { check: id, findings }
        })
        .collect();

    TopologyCheckReport {
        main: main.label.clone(),
        subordinate: subordinate.label.clone(),
        results,
    }
}

fn escalate(pedantic: bool) -> Severity {
    if pedantic { Severity::Fatal } else { Severity::Warning }
}

fn check_server_ids(main: &ServerFacts, sub: &ServerFacts) -> Vec<Finding> {
    let id = CheckId::ServerIdUniqueness;
    let mut findings = Vec::new();
    if main.server_id == sub.server_id {
        findings.push(Finding::new(
            id,
            Severity::Fatal,
            format!(
                "The {} and {} have the same server_id ({}).",
                main.label, sub.label, main.server_id
            ),
        ));
    }
    for facts in [main, sub] {
        if facts.server_id == 0 {
            findings.push(Finding::new(
                id,
                Severity::Fatal,
                format!("The server_id on the {} is 0. Replication requires a non-zero server_id.", facts.label),
            ));
        }
    }
    findings
}

fn check_uuids(main: &ServerFacts, sub: &ServerFacts) -> Vec<Finding> {
    let id = CheckId::UuidUniqueness;
    match (main.server_uuid, sub.server_uuid) {
        (Some(a), Some(b)) if a == b => vec![Finding::new(
            id,
            Severity::Fatal,
            format!("The {} and {} have the same server_uuid ({}).", main.label, sub.label, a),
        )],
        (Some(_), None) | (None, Some(_)) => {
            let show = |f: &ServerFacts| {
                format!(
                    "{}: {}",
                    f.label,
                    f.server_uuid.map(|u| u.to_string()).unwrap_or_else(|| "none".into())
                )
            };
            vec![Finding::new(id, Severity::Fatal, "Only one of the servers reports a server_uuid.")
                .with_details(vec![show(main), show(sub)])]
        }
        _ => Vec::new(),
    }
}

fn check_innodb(main: &ServerFacts, sub: &ServerFacts, options: ValidatorOptions) -> Vec<Finding> {
    let id = CheckId::InnodbCompatibility;
    let details = vec![
        format!("{}: {}", main.label, main.innodb),
        format!("{}: {}", sub.label, sub.innodb),
    ];

    if main.innodb.available && !sub.innodb.available {
        return vec![Finding::new(
            id,
            Severity::Fatal,
            "InnoDB is enabled on the main but not available on the subordinate.",
        )
        .with_details(details)];
    }
    if main.innodb.available
        && sub.innodb.available
        && main.innodb.page_size.is_some()
        && sub.innodb.page_size.is_some()
        && main.innodb.page_size != sub.innodb.page_size
    {
        return vec![Finding::new(id, Severity::Fatal, "InnoDB page sizes differ between main and subordinate.")
            .with_details(details)];
    }
    if main.innodb != sub.innodb {
        return vec![Finding::new(
            id,
            escalate(options.pedantic),
            "InnoDB settings differ between main and subordinate.",
        )
        .with_details(details)];
    }
    Vec::new()
}

fn check_engines(main: &ServerFacts, sub: &ServerFacts, options: ValidatorOptions) -> Vec<Finding> {
    let missing: Vec<&str> = main
        .table_engines
        .iter()
        .filter(|e| !sub.available_engines.contains(*e))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        return Vec::new();
    }
    vec![Finding::new(
        CheckId::StorageEngines,
        escalate(options.pedantic),
        format!(
            "The following storage engines used on the main are not available on the subordinate: {}.",
            missing.join(", ")
        ),
    )
    .with_details(vec![format!(
        "{} engines: {}",
        sub.label,
        sub.available_engines.iter().cloned().collect::<Vec<_>>().join(", ")
    )])]
}

fn check_binlog(main: &ServerFacts) -> Vec<Finding> {
    if main.log_bin {
        return Vec::new();
    }
    vec![Finding::new(CheckId::MainBinlog, Severity::Fatal, "Main must have binary logging turned on.")
        .with_details(vec![format!("{}: log_bin=OFF", main.label)])]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(label: &str, id: u32, uuid: u128) -> ServerFacts {
        ServerFacts {
            label: label.to_string(),
            server_id: id,
            server_uuid: Some(Uuid::from_u128(uuid)),
            log_bin: true,
            innodb: InnoDbFacts {
                available: true,
                version: Some("8.0.35".into()),
                page_size: Some(16384),
            },
            available_engines: ["INNODB", "MYISAM"].iter().map(|s| s.to_string()).collect(),
            table_engines: ["INNODB"].iter().map(|s| s.to_string()).collect(),
        }
    }

    fn pair() -> (ServerFacts, ServerFacts) {
        (facts("main 'a:3306'", 1, 1), facts("subordinate 'b:3306'", 2, 2))
    }

    #[test]
    fn test_clean_pair_passes_in_order() {
        let (m, s) = pair();
        let report = check(&m, &s, ValidatorOptions::default());
        assert!(report.passed());
        let order: Vec<CheckId> = report.results().iter().map(|r| r.check).collect();
        assert_eq!(order, CheckId::ORDER.to_vec());
        assert!(report.to_error().is_none());
    }

    #[test]
    fn test_same_server_id_yields_one_finding_naming_both() {
        let (m, mut s) = pair();
        s.server_id = 1;
        let report = check(&m, &s, ValidatorOptions::default());
        let result = report.result(CheckId::ServerIdUniqueness).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert!(result.findings[0].message.contains("main 'a:3306'"));
        assert!(result.findings[0].message.contains("subordinate 'b:3306'"));
        assert!(matches!(report.to_error(), Some(RplError::Uniqueness(_))));
    }

    #[test]
    fn test_zero_server_id_is_fatal() {
        let (mut m, s) = pair();
        m.server_id = 0;
        let report = check(&m, &s, ValidatorOptions::default());
        assert!(report.result(CheckId::ServerIdUniqueness).unwrap().findings[0].is_fatal());
    }

    #[test]
    fn test_uuid_checks() {
        let (m, mut s) = pair();
        s.server_uuid = m.server_uuid;
        let report = check(&m, &s, ValidatorOptions::default());
        assert_eq!(report.result(CheckId::UuidUniqueness).unwrap().findings.len(), 1);

        s.server_uuid = None;
        let report = check(&m, &s, ValidatorOptions::default());
        assert_eq!(report.first_fatal().unwrap().check, CheckId::UuidUniqueness);

        let (mut m, mut s) = pair();
        m.server_uuid = None;
        s.server_uuid = None;
        assert!(check(&m, &s, ValidatorOptions::default()).passed());
    }

    #[test]
    fn test_innodb_version_difference_is_warning_unless_pedantic() {
        let (m, mut s) = pair();
        s.innodb.version = Some("5.7.44".into());
        let report = check(&m, &s, ValidatorOptions::default());
        let finding = &report.result(CheckId::InnodbCompatibility).unwrap().findings[0];
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(finding.message, "InnoDB settings differ between main and subordinate.");
        assert_eq!(finding.details.len(), 2);
        assert!(!report.has_fatal());

        let report = check(&m, &s, ValidatorOptions { pedantic: true });
        assert!(matches!(report.to_error(), Some(RplError::Compatibility { .. })));
    }

    #[test]
    fn test_innodb_hard_incompatibilities() {
        let (m, mut s) = pair();
        s.innodb.page_size = Some(65536);
        assert!(check(&m, &s, ValidatorOptions::default()).has_fatal());

        let (m, mut s) = pair();
        s.innodb = InnoDbFacts::default();
        s.available_engines.remove("INNODB");
        let report = check(&m, &s, ValidatorOptions::default());
        assert_eq!(report.first_fatal().unwrap().check, CheckId::InnodbCompatibility);
    }

    #[test]
    fn test_missing_engine_warning() {
        let (mut m, s) = pair();
        m.table_engines.insert("ROCKSDB".into());
        let report = check(&m, &s, ValidatorOptions::default());
        let finding = &report.result(CheckId::StorageEngines).unwrap().findings[0];
        assert_eq!(finding.severity, Severity::Warning);
        assert!(finding.message.contains("ROCKSDB"));
        assert!(check(&m, &s, ValidatorOptions { pedantic: true }).has_fatal());
    }

    #[test]
    fn test_binlog_off_maps_to_binlog_error() {
        let (mut m, s) = pair();
        m.log_bin = false;
        let report = check(&m, &s, ValidatorOptions::default());
        assert_eq!(
            report.result(CheckId::MainBinlog).unwrap().findings[0].message,
            "Main must have binary logging turned on."
        );
        assert!(matches!(report.to_error(), Some(RplError::BinlogDisabled { ref server }) if server == "main 'a:3306'"));
    }

    #[test]
    fn test_first_fatal_follows_check_order() {
        let (mut m, mut s) = pair();
        m.log_bin = false;
        s.server_id = 1;
        let report = check(&m, &s, ValidatorOptions::default());
        assert_eq!(report.first_fatal().unwrap().check, CheckId::ServerIdUniqueness);
        assert_eq!(report.findings().filter(|f| f.is_fatal()).count(), 2);
    }
}
