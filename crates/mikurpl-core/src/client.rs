//! 数据库客户端能力接口
//!
//! 编排层只通过这里的两个 trait 与数据库交互:建立连接、执行语句并取回行。
//! CLI 使用 MySQL 适配器实现它们,测试使用 `sim` 模块的内存模拟服务器。

use async_trait::async_trait;
use mikurpl_common::{ConnectionDescriptor, RplResult};

/// 连接工厂
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// 建立一个新连接;不可达或认证失败返回 `Connection` 错误
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> RplResult<Box<dyn ServerConnection>>;
}

/// 单个服务器连接
///
/// 连接在 drop 时释放。
#[async_trait]
pub trait ServerConnection: Send {
    /// 执行一条语句;失败返回 `Query` 错误
    async fn query(&mut self, statement: &str) -> RplResult<QueryRows>;

    async fn execute(&mut self, statement: &str) -> RplResult<()> {
        self.query(statement).await.map(|_| ())
    }

    async fn ping(&mut self) -> RplResult<()> {
        self.execute("SELECT 1").await
    }
}

/// 查询结果:列名 + 可空字符串行
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// 单行单列结果
    pub fn scalar_row(column: &str, value: Option<String>) -> Self {
        Self::new(vec![column.to_string()], vec![vec![value]])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// 列名查找(大小写不敏感)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// 第一行指定列的值
    pub fn first(&self, column: &str) -> Option<&str> {
        self.value(0, column)
    }

    /// 第一行第一列的值
    pub fn scalar(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }

    /// 指定列下标的所有值
    pub fn column(&self, idx: usize) -> impl Iterator<Item = Option<&str>> {
        self.rows.iter().map(move |row| row.get(idx).and_then(|v| v.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_rows_access() {
        let rows = QueryRows::new(
            vec!["Variable_name".into(), "Value".into()],
            vec![
                vec![Some("server_id".into()), Some("1".into())],
                vec![Some("log_bin".into()), None],
            ],
        );
        assert_eq!(rows.first("value"), Some("1"));
        assert_eq!(rows.value(1, "Value"), None);
        assert_eq!(rows.scalar(), Some("server_id"));
        assert_eq!(rows.column(0).flatten().collect::<Vec<_>>(), vec!["server_id", "log_bin"]);
        assert_eq!(rows.value(5, "Value"), None);
        assert!(QueryRows::empty().scalar().is_none());
    }
}
