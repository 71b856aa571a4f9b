//! 基础类型定义模块
//!
//! 服务器角色、连接描述符、复制用户描述符与服务器版本号。

use crate::error::{RplError, RplResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 3306;

/// 服务器在拓扑中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Main,
    Subordinate,
}

impl ServerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Main => "main",
            ServerRole::Subordinate => "subordinate",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接描述符
///
/// 格式: `user[:password]@host[:port][:socket]`,IPv6 地址需要用方括号包裹。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub socket: Option<String>,
}

impl ConnectionDescriptor {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            password: None,
            host: host.into(),
            port,
            socket: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    /// 用于日志与报告的地址标签 (host:port)
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// # Brief
    /// 判断两个描述符是否指向同一个服务器端点
    ///
    /// 两边都指定了 socket 时只比较 socket 文件,否则比较同一主机上的端口。
    /// localhost / 127.0.0.1 / ::1 视为同一主机。
    pub fn same_endpoint(&self, other: &ConnectionDescriptor) -> bool {
        if let (Some(a), Some(b)) = (&self.socket, &other.socket) {
            return a == b;
        }
        self.port == other.port && normalize_host(&self.host) == normalize_host(&other.host)
    }
}

fn normalize_host(host: &str) -> String {
    match host.to_ascii_lowercase().as_str() {
        "localhost" | "127.0.0.1" | "::1" => "localhost".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address())?;
        if let Some(ref socket) = self.socket {
            write!(f, ":{}", socket)?;
        }
        Ok(())
    }
}

// 不输出密码
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .finish()
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = RplError;

    fn from_str(input: &str) -> RplResult<Self> {
        let input = input.trim();
        let at = input
            .rfind('@')
            .ok_or_else(|| RplError::descriptor(input, "missing '@' between credentials and host"))?;
        let (credentials, location) = (&input[..at], &input[at + 1..]);

        let (user, password) = match credentials.split_once(':') {
            Some((user, password)) => (user, Some(password.to_string())),
            None => (credentials, None),
        };
        if user.is_empty() {
            return Err(RplError::descriptor(input, "user is empty"));
        }

        let (host, rest) = if let Some(stripped) = location.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| RplError::descriptor(input, "unterminated '[' in host"))?;
            let rest = &stripped[end + 1..];
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            (&stripped[..end], rest)
        } else {
            match location.split_once(':') {
                Some((host, rest)) => (host, rest),
                None => (location, ""),
            }
        };
        if host.is_empty() {
            return Err(RplError::descriptor(input, "host is empty"));
        }

        let (port, socket) = match rest.split_once(':') {
            Some((port, socket)) => (port, Some(socket)),
            None => (rest, None),
        };
        let port = if port.is_empty() {
            DEFAULT_PORT
        } else {
            port.parse::<u16>()
                .map_err(|_| RplError::descriptor(input, format!("invalid port '{}'", port)))?
        };

        Ok(Self {
            user: user.to_string(),
            password,
            host: host.to_string(),
            port,
            socket: socket.filter(|s| !s.is_empty()).map(str::to_string),
        })
    }
}

/// 复制用户描述符 (`user:password`)
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicationUser {
    pub user: String,
    pub password: String,
}

impl ReplicationUser {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ReplicationUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationUser").field("user", &self.user).finish()
    }
}

impl FromStr for ReplicationUser {
    type Err = RplError;

    fn from_str(input: &str) -> RplResult<Self> {
        let (user, password) = input.split_once(':').unwrap_or((input, ""));
        if user.is_empty() {
            return Err(RplError::descriptor(input, "replication user must be in the form user:password"));
        }
        Ok(Self::new(user, password))
    }
}

/// 服务器版本号
///
/// 解析 `8.0.33-log`、`5.7.44-0ubuntu0.18.04.1` 之类的版本字符串,只保留前三段数字。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ServerVersion {
    type Err = RplError;

    fn from_str(input: &str) -> RplResult<Self> {
        let mut parts = input.trim().split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        let major = parts
            .next()
            .flatten()
            .ok_or_else(|| RplError::descriptor(input, "invalid server version"))?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);

        Ok(Self::new(major, minor, patch))
    }
}

impl Serialize for ServerVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let desc: ConnectionDescriptor = "root:secret@db1:3307:/tmp/mysql.sock".parse().unwrap();
        assert_eq!(desc.user, "root");
        assert_eq!(desc.password.as_deref(), Some("secret"));
        assert_eq!(desc.host, "db1");
        assert_eq!(desc.port, 3307);
        assert_eq!(desc.socket.as_deref(), Some("/tmp/mysql.sock"));
    }

    #[test]
    fn test_parse_descriptor_defaults() {
        let desc: ConnectionDescriptor = "rpl@db2".parse().unwrap();
        assert_eq!(desc.password, None);
        assert_eq!(desc.port, DEFAULT_PORT);
        assert_eq!(desc.address(), "db2:3306");
    }

    #[test]
    fn test_parse_descriptor_password_with_at_sign() {
        let desc: ConnectionDescriptor = "root:p@ss@db1:3306".parse().unwrap();
        assert_eq!(desc.password.as_deref(), Some("p@ss"));
        assert_eq!(desc.host, "db1");
    }

    #[test]
    fn test_parse_ipv6_descriptor() {
        let desc: ConnectionDescriptor = "root:x@[::1]:3310".parse().unwrap();
        assert_eq!(desc.host, "::1");
        assert_eq!(desc.port, 3310);
        assert_eq!(desc.address(), "[::1]:3310");
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!("db1:3306".parse::<ConnectionDescriptor>().is_err());
        assert!(":pw@db1".parse::<ConnectionDescriptor>().is_err());
        assert!("root@db1:notaport".parse::<ConnectionDescriptor>().is_err());
    }

    #[test]
    fn test_same_endpoint() {
        let a: ConnectionDescriptor = "root@localhost:3306".parse().unwrap();
        let b: ConnectionDescriptor = "other@127.0.0.1:3306".parse().unwrap();
        let c: ConnectionDescriptor = "root@localhost:3307".parse().unwrap();
        assert!(a.same_endpoint(&b));
        assert!(!a.same_endpoint(&c));
    }

    #[test]
    fn test_same_endpoint_by_socket() {
        let a: ConnectionDescriptor = "root@localhost:3306:/tmp/mysql-a.sock".parse().unwrap();
        let b: ConnectionDescriptor = "root@localhost:3306:/tmp/mysql-b.sock".parse().unwrap();
        let a2: ConnectionDescriptor = "rpl@127.0.0.1:3310:/tmp/mysql-a.sock".parse().unwrap();
        let tcp: ConnectionDescriptor = "root@localhost:3306".parse().unwrap();
        // 同一主机同一端口,但 socket 不同
        assert!(!a.same_endpoint(&b));
        assert!(a.same_endpoint(&a2));
        // 只有一边给出 socket 时按主机和端口比较
        assert!(a.same_endpoint(&tcp));
    }

    #[test]
    fn test_debug_hides_password() {
        let desc: ConnectionDescriptor = "root:secret@db1".parse().unwrap();
        assert!(!format!("{:?}", desc).contains("secret"));
    }

    #[test]
    fn test_replication_user() {
        let user: ReplicationUser = "rpl:rpl".parse().unwrap();
        assert_eq!(user.user, "rpl");
        assert_eq!(user.password, "rpl");
        assert!(":x".parse::<ReplicationUser>().is_err());
    }

    #[test]
    fn test_server_version_parse_and_order() {
        let v: ServerVersion = "8.0.33-log".parse().unwrap();
        assert_eq!(v, ServerVersion::new(8, 0, 33));
        let old: ServerVersion = "5.6".parse().unwrap();
        assert_eq!(old, ServerVersion::new(5, 6, 0));
        assert!(old < ServerVersion::new(5, 6, 9));
        assert!("mariadb".parse::<ServerVersion>().is_err());
    }
}
