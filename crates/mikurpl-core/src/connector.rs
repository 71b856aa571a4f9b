//! 服务器连接解析
//!
//! 把连接描述符解析为带角色标签的在线服务器句柄,并在解析过程中执行
//! 版本下限与唯一性约束。句柄 drop 时释放连接,所有退出路径都会释放。

use crate::client::{DatabaseClient, QueryRows, ServerConnection};
use crate::gtid::GtidSet;
use crate::sql::{quote_literal, Dialect};
use mikurpl_common::{ConnectionDescriptor, RplError, RplResult, ServerRole, ServerVersion};
use tracing::{debug, info};
use uuid::Uuid;

/// 存储引擎及其支持状态(`YES` / `DEFAULT` / `NO` / `DISABLED`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub name: String,
    pub support: String,
}

impl EngineInfo {
    pub fn is_available(&self) -> bool {
        matches!(self.support.to_ascii_uppercase().as_str(), "YES" | "DEFAULT")
    }
}

/// 连接选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorOptions {
    pub min_version: ServerVersion,
    /// 要求各端点是不同的服务器
    pub unique: bool,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            min_version: ServerVersion::new(5, 0, 0),
            unique: true,
        }
    }
}

/// 已解析的服务器端点
///
/// 身份字段在解析时确定,之后只读。
pub struct ServerEndpoint {
    role: ServerRole,
    descriptor: ConnectionDescriptor,
    server_id: u32,
    server_uuid: Option<Uuid>,
    version: ServerVersion,
    dialect: Dialect,
    engines: Vec<EngineInfo>,
    conn: Box<dyn ServerConnection>,
}

impl ServerEndpoint {
    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn address(&self) -> String {
        self.descriptor.address()
    }

    /// 带角色的标签,如 `main 'db1:3306'`
    pub fn label(&self) -> String {
        label(self.role, &self.descriptor)
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn server_uuid(&self) -> Option<Uuid> {
        self.server_uuid
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn engines(&self) -> &[EngineInfo] {
        &self.engines
    }

    pub fn engine(&self, name: &str) -> Option<&EngineInfo> {
        self.engines.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub async fn query(&mut self, statement: &str) -> RplResult<QueryRows> {
        debug!(server = %self.descriptor.address(), statement, "Executing");
        self.conn.query(statement).await
    }

    pub async fn execute(&mut self, statement: &str) -> RplResult<()> {
        self.query(statement).await.map(|_| ())
    }

    pub async fn ping(&mut self) -> RplResult<()> {
        self.conn.ping().await
    }

    /// 读取全局变量;变量不存在时返回 None
    pub async fn variable(&mut self, name: &str) -> RplResult<Option<String>> {
        let rows = self.query(&format!("SHOW VARIABLES LIKE {}", quote_literal(name))).await?;
        Ok(rows.first("Value").map(str::to_string))
    }

    /// 布尔型变量是否为 ON
    pub async fn variable_on(&mut self, name: &str) -> RplResult<bool> {
        Ok(self
            .variable(name)
            .await?
            .is_some_and(|v| v.eq_ignore_ascii_case("ON") || v == "1"))
    }

    pub async fn gtid_executed(&mut self) -> RplResult<GtidSet> {
        let rows = self.query("SELECT @@GLOBAL.GTID_EXECUTED").await?;
        GtidSet::parse(rows.scalar().unwrap_or_default())
    }

    /// 断开后用同一描述符重新建立连接
    pub async fn reconnect(&mut self, client: &dyn DatabaseClient) -> RplResult<()> {
        let conn = client
            .connect(&self.descriptor)
            .await
            .map_err(|e| relabel(e, &self.label()))?;
        self.conn = conn;
        debug!(server = %self.descriptor.address(), "Reconnected");
        Ok(())
    }
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("role", &self.role)
            .field("address", &self.descriptor.address())
            .field("server_id", &self.server_id)
            .field("server_uuid", &self.server_uuid)
            .field("version", &self.version)
            .finish()
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        debug!(server = %self.descriptor.address(), role = %self.role, "Releasing connection");
    }
}

fn label(role: ServerRole, descriptor: &ConnectionDescriptor) -> String {
    format!("{} '{}'", role, descriptor.address())
}

fn relabel(err: RplError, server: &str) -> RplError {
    match err {
        RplError::Connection { reason, .. } => RplError::connection(server, reason),
        other => other,
    }
}

/// # Brief
/// 连接单个服务器并解析其身份
///
/// # Arguments
/// * `client` - 数据库客户端能力
/// * `descriptor` - 连接描述符
/// * `role` - 端点角色
/// * `min_version` - 版本下限
pub async fn connect(
    client: &dyn DatabaseClient,
    descriptor: &ConnectionDescriptor,
    role: ServerRole,
    min_version: ServerVersion,
) -> RplResult<ServerEndpoint> {
    let server = label(role, descriptor);
    debug!("Connecting to {}", server);
    let mut conn = client.connect(descriptor).await.map_err(|e| relabel(e, &server))?;

    let raw_version = conn.query("SELECT VERSION()").await?;
    let found = raw_version.scalar().unwrap_or_default().to_string();
    let version: ServerVersion = found.parse().map_err(|_| RplError::Version {
        server: server.clone(),
        found: found.clone(),
        required: min_version.to_string(),
    })?;
    if version < min_version {
        return Err(RplError::Version {
            server,
            found,
            required: min_version.to_string(),
        });
    }

    let server_id = conn
        .query("SHOW VARIABLES LIKE 'server_id'")
        .await?
        .first("Value")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| RplError::query(&server, "SHOW VARIABLES LIKE 'server_id'", "server_id is not a number"))?;

    let server_uuid = match conn
        .query("SHOW VARIABLES LIKE 'server_uuid'")
        .await?
        .first("Value")
        .map(str::trim)
    {
        Some(raw) if !raw.is_empty() => Some(
            Uuid::parse_str(raw)
                .map_err(|e| RplError::query(&server, "SHOW VARIABLES LIKE 'server_uuid'", e))?,
        ),
        _ => None,
    };

    let engines = conn
        .query("SHOW ENGINES")
        .await?
        .rows
        .iter()
        .filter_map(|row| {
            let name = row.first()?.as_deref()?;
            let support = row.get(1)?.as_deref().unwrap_or("NO");
            Some(EngineInfo {
                name: name.to_string(),
                support: support.to_string(),
            })
        })
        .collect();

    info!("Connected to {} (server_id={}, version={})", server, server_id, version);
    Ok(ServerEndpoint {
        role,
        descriptor: descriptor.clone(),
        server_id,
        server_uuid,
        version,
        dialect: Dialect::for_version(version),
        engines,
        conn,
    })
}

/// # Brief
/// 连接一组端点,执行唯一性约束
///
/// 联系任何服务器之前先拒绝指向同一端点的描述符;解析后,server_id 与
/// server_uuid 都相同的两个端点视为经由两个地址到达的同一服务器。
/// 只共享其中一项的端点交由拓扑校验报告。
pub async fn connect_all(
    client: &dyn DatabaseClient,
    descriptors: &[(ConnectionDescriptor, ServerRole)],
    options: ConnectorOptions,
) -> RplResult<Vec<ServerEndpoint>> {
    if options.unique {
        for (i, (a, role_a)) in descriptors.iter().enumerate() {
            for (b, role_b) in &descriptors[i + 1..] {
                if a.same_endpoint(b) {
                    return Err(RplError::Uniqueness(format!(
                        "{} and {} name the same server",
                        label(*role_a, a),
                        label(*role_b, b)
                    )));
                }
            }
        }
    }

    let mut endpoints = Vec::with_capacity(descriptors.len());
    for (descriptor, role) in descriptors {
        endpoints.push(connect(client, descriptor, *role, options.min_version).await?);
    }

    if options.unique {
        for (i, a) in endpoints.iter().enumerate() {
            for b in &endpoints[i + 1..] {
                let same_uuid = a.server_uuid.is_some() && a.server_uuid == b.server_uuid;
                if same_uuid && a.server_id == b.server_id {
                    return Err(RplError::Uniqueness(format!(
                        "{} and {} are the same server (server_id {}, server_uuid {})",
                        a.label(),
                        b.label(),
                        a.server_id,
                        a.server_uuid.map(|u| u.to_string()).unwrap_or_default()
                    )));
                }
            }
        }
    }
    Ok(endpoints)
}

/// 连接一个主库和一个从库
pub async fn connect_pair(
    client: &dyn DatabaseClient,
    main: &ConnectionDescriptor,
    subordinate: &ConnectionDescriptor,
    options: ConnectorOptions,
) -> RplResult<(ServerEndpoint, ServerEndpoint)> {
    let descriptors = [
        (main.clone(), ServerRole::Main),
        (subordinate.clone(), ServerRole::Subordinate),
    ];
    let mut endpoints = connect_all(client, &descriptors, options).await?.into_iter();
    match (endpoints.next(), endpoints.next()) {
        (Some(m), Some(s)) => Ok((m, s)),
        _ => Err(RplError::Internal("connector returned fewer endpoints than requested".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCluster, SimServer};

    fn desc(s: &str) -> ConnectionDescriptor {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_connect_resolves_identity() {
        let cluster = SimCluster::new();
        cluster.add_server("m1:3306", SimServer::new(1).with_version("5.7.44-log"));
        let ep = connect(&cluster, &desc("root@m1:3306"), ServerRole::Main, ServerVersion::new(5, 0, 0))
            .await
            .unwrap();
        assert_eq!(ep.server_id(), 1);
        assert_eq!(ep.version(), ServerVersion::new(5, 7, 44));
        assert!(ep.server_uuid().is_some());
        assert!(ep.engine("InnoDB").is_some_and(EngineInfo::is_available));
        assert_eq!(ep.label(), "main 'm1:3306'");
        assert_eq!(cluster.open_connections("m1:3306"), 1);
        drop(ep);
        assert_eq!(cluster.open_connections("m1:3306"), 0);
    }

    #[tokio::test]
    async fn test_version_floor() {
        let cluster = SimCluster::new();
        cluster.add_server("old:3306", SimServer::new(7).with_version("5.5.62"));
        let err = connect(&cluster, &desc("root@old:3306"), ServerRole::Subordinate, ServerVersion::new(5, 6, 9))
            .await
            .unwrap_err();
        match err {
            RplError::Version { server, found, required } => {
                assert_eq!(server, "subordinate 'old:3306'");
                assert_eq!(found, "5.5.62");
                assert_eq!(required, "5.6.9");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_names_role() {
        let cluster = SimCluster::new();
        let err = connect(&cluster, &desc("root@nowhere:3306"), ServerRole::Main, ServerVersion::new(5, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RplError::Connection { ref server, .. } if server == "main 'nowhere:3306'"));
    }

    #[tokio::test]
    async fn test_same_endpoint_rejected_before_contact() {
        let cluster = SimCluster::new();
        cluster.add_server("localhost:3306", SimServer::new(1));
        let err = connect_pair(
            &cluster,
            &desc("root@localhost:3306"),
            &desc("root@127.0.0.1:3306"),
            ConnectorOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RplError::Uniqueness(_)));
        assert!(cluster.statements("localhost:3306").is_empty());
    }

    #[tokio::test]
    async fn test_same_server_via_two_addresses() {
        let cluster = SimCluster::new();
        let uuid = Uuid::from_u128(42);
        cluster.add_server("a:3306", SimServer::new(5).with_uuid(Some(uuid)));
        cluster.add_server("b:3306", SimServer::new(5).with_uuid(Some(uuid)));
        let err = connect_pair(&cluster, &desc("root@a:3306"), &desc("root@b:3306"), ConnectorOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RplError::Uniqueness(_)));
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_shared_server_id_only_is_left_to_validator() {
        let cluster = SimCluster::new();
        cluster.add_server("a:3306", SimServer::new(5));
        cluster.add_server("b:3306", SimServer::new(5).with_uuid(Some(Uuid::from_u128(9))));
        let (m, s) = connect_pair(&cluster, &desc("root@a:3306"), &desc("root@b:3306"), ConnectorOptions::default())
            .await
            .unwrap();
        assert_eq!(m.server_id(), s.server_id());
    }
}
