//! mikurpl 命令行工具
//!
//! - `replicate`: 在主库与从库之间搭建并验证复制
//! - `rplms`: 多源复制守护进程(前台或后台运行)
//! - `skiptrx`: 在一个或多个从库上以空事务跳过 GTID 事务

pub mod cli;
pub mod commands;
pub mod formatter;
pub mod mysql;

pub use cli::Cli;
pub use formatter::{Formatter, OutputFormat};
pub use mysql::MySqlClient;
