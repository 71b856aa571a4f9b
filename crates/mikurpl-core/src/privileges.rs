//! 连接用户的全局权限检查
//!
//! 解析 `SHOW GRANTS FOR CURRENT_USER()` 的输出,只看 `ON *.*` 的授权。

use crate::connector::ServerEndpoint;
use mikurpl_common::{RplError, RplResult};
use std::collections::BTreeSet;
use tracing::debug;

/// 多源复制要求主库和从库上的连接用户都具备的权限
///
/// 每一项是一组可互相替代的权限,满足其一即可。
pub const REPLICATION_PRIVILEGES: &[&[&str]] = &[
    &["SUPER", "REPLICATION_SLAVE_ADMIN"],
    &["SELECT"],
    &["INSERT"],
    &["UPDATE"],
    &["REPLICATION SLAVE"],
    &["GRANT OPTION"],
];

/// 全局权限集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalPrivileges {
    all: bool,
    granted: BTreeSet<String>,
}

impl GlobalPrivileges {
    /// 由 `SHOW GRANTS` 的每一行构建;角色授权与库表级授权被忽略
    pub fn from_grants<'a>(grants: impl IntoIterator<Item = &'a str>) -> Self {
        let mut privileges = Self::default();
        for line in grants {
            privileges.add_grant(line);
        }
        privileges
    }

    fn add_grant(&mut self, line: &str) {
        let upper = line.trim().to_ascii_uppercase();
        let Some(rest) = upper.strip_prefix("GRANT ") else {
            return;
        };
        let Some((list, target)) = rest.split_once(" ON ") else {
            return;
        };
        let on = target.split(" TO ").next().unwrap_or_default().replace('`', "");
        if on.trim() != "*.*" {
            return;
        }
        for privilege in list.split(',') {
            match privilege.trim() {
                "ALL" | "ALL PRIVILEGES" => self.all = true,
                "REPLICATION REPLICA" => {
                    self.granted.insert("REPLICATION SLAVE".into());
                }
                "" => {}
                other => {
                    self.granted.insert(other.to_string());
                }
            }
        }
        if target.contains(" WITH GRANT OPTION") {
            self.granted.insert("GRANT OPTION".into());
        }
    }

    pub fn has(&self, privilege: &str) -> bool {
        let privilege = privilege.to_ascii_uppercase();
        // ALL PRIVILEGES 不含 GRANT OPTION
        if self.all && privilege != "GRANT OPTION" {
            return true;
        }
        self.granted.contains(&privilege)
    }

    /// 未满足的权限组,以每组第一个名字表示
    pub fn missing(&self, required: &[&[&str]]) -> Vec<String> {
        required
            .iter()
            .filter(|any| !any.iter().any(|p| self.has(p)))
            .filter_map(|any| any.first().map(|p| p.to_string()))
            .collect()
    }
}

fn describe(required: &[&[&str]]) -> String {
    let names: Vec<&str> = required.iter().filter_map(|any| any.first().copied()).collect();
    match names.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} AND {}", rest.join(", "), last),
        Some((last, _)) => last.to_string(),
        None => String::new(),
    }
}

/// # Brief
/// 检查连接用户在端点上的全局权限
///
/// # Arguments
/// * `endpoint` - 已连接的端点
/// * `required` - 权限组,见 [`REPLICATION_PRIVILEGES`]
/// * `operation` - 写入错误信息的操作描述
pub async fn check_privileges(
    endpoint: &mut ServerEndpoint,
    required: &[&[&str]],
    operation: &str,
) -> RplResult<()> {
    let rows = endpoint.query("SHOW GRANTS FOR CURRENT_USER()").await?;
    let privileges = GlobalPrivileges::from_grants(rows.column(0).flatten());
    let missing = privileges.missing(required);
    if missing.is_empty() {
        return Ok(());
    }
    debug!("{} lacks {}", endpoint.label(), missing.join(", "));
    Err(RplError::Privileges {
        server: endpoint.label(),
        user: endpoint.descriptor().user.clone(),
        operation: operation.to_string(),
        required: describe(required),
    })
}
