//! mysql_async 适配器
//!
//! 以文本协议执行语句,所有列值转换为字符串。

use async_trait::async_trait;
use mikurpl_common::{ConnectionDescriptor, RplError, RplResult};
use mikurpl_core::{DatabaseClient, QueryRows, ServerConnection};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Value};
use tracing::debug;

/// 通过 mysql_async 建立连接的客户端
#[derive(Debug, Clone, Default)]
pub struct MySqlClient;

impl MySqlClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> RplResult<Box<dyn ServerConnection>> {
        let address = descriptor.address();
        let opts = OptsBuilder::default()
            .ip_or_hostname(descriptor.host.clone())
            .tcp_port(descriptor.port)
            .user(Some(descriptor.user.clone()))
            .pass(descriptor.password.clone())
            .socket(descriptor.socket.clone());

        let conn = Conn::new(opts)
            .await
            .map_err(|e| RplError::connection(&address, e.to_string()))?;
        debug!("Connected to {}", address);
        Ok(Box::new(MySqlConnection {
            address,
            conn: Some(conn),
        }))
    }
}

struct MySqlConnection {
    address: String,
    conn: Option<Conn>,
}

impl MySqlConnection {
    fn conn(&mut self) -> RplResult<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| RplError::connection(&self.address, "connection already closed"))
    }
}

/// IO 错误视为连接丢失,其它错误归为语句失败
fn classify(address: &str, statement: &str, err: mysql_async::Error) -> RplError {
    match err {
        mysql_async::Error::Io(e) => RplError::connection(address, e.to_string()),
        other => RplError::query(address, statement, other.to_string()),
    }
}

#[async_trait]
impl ServerConnection for MySqlConnection {
    async fn query(&mut self, statement: &str) -> RplResult<QueryRows> {
        let address = self.address.clone();
        let fail = |e| classify(&address, statement, e);

        let conn = self.conn()?;
        let mut result = conn.query_iter(statement).await.map_err(fail)?;
        let columns: Vec<String> = result
            .columns()
            .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
            .unwrap_or_default();
        let rows: Vec<Row> = result.collect().await.map_err(fail)?;
        result.drop_result().await.map_err(fail)?;
        Ok(QueryRows::new(columns, rows.iter().map(row_values).collect()))
    }

    async fn ping(&mut self) -> RplResult<()> {
        let address = self.address.clone();
        self.conn()?
            .ping()
            .await
            .map_err(|e| classify(&address, "PING", e))
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // 运行时已关闭时连接直接丢弃
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = conn.disconnect().await;
                });
            }
        }
    }
}

fn row_values(row: &Row) -> Vec<Option<String>> {
    (0..row.len()).map(|i| row.as_ref(i).and_then(value_to_string)).collect()
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        Value::Date(y, mo, d, h, mi, s, us) => Some(if *us > 0 {
            format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}", y, mo, d, h, mi, s, us)
        } else {
            format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, mi, s)
        }),
        Value::Time(negative, days, h, mi, s, us) => {
            let hours = u32::from(*h) + days * 24;
            let sign = if *negative { "-" } else { "" };
            Some(if *us > 0 {
                format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, mi, s, us)
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion() {
        assert_eq!(value_to_string(&Value::NULL), None);
        assert_eq!(value_to_string(&Value::Bytes(b"ON".to_vec())).as_deref(), Some("ON"));
        assert_eq!(value_to_string(&Value::Int(-3)).as_deref(), Some("-3"));
        assert_eq!(value_to_string(&Value::UInt(157)).as_deref(), Some("157"));
        assert_eq!(
            value_to_string(&Value::Date(2024, 1, 2, 3, 4, 5, 0)).as_deref(),
            Some("2024-01-02 03:04:05")
        );
        assert_eq!(
            value_to_string(&Value::Time(true, 1, 2, 3, 4, 0)).as_deref(),
            Some("-26:03:04")
        );
    }
}
