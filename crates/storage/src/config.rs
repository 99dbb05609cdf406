//! Backend connection settings.
//!
//! Loading these from files, flags or the environment is the caller's job;
//! everything here deserializes with serde and falls back to the defaults
//! for missing fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// PostgreSQL connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    /// Disable TLS. When false the server certificate is fully verified.
    pub insecure: bool,
    /// Full `postgres://` URL. Overrides the individual fields when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_str: Option<String>,
    /// Connection attempts made by `init` before giving up.
    pub retry_count: u32,
    #[serde(with = "secs")]
    pub retry_wait: Duration,
    pub max_connections: u32,
    #[serde(with = "secs")]
    pub acquire_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "pcsuser".to_string(),
            password: String::new(),
            dbname: "pcsdb".to_string(),
            insecure: false,
            conn_str: None,
            retry_count: 5,
            retry_wait: Duration::from_secs(10),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PostgresConfig {
    /// Settings for a `postgres://` URL, keeping the default retry policy.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            conn_str: Some(url.into()),
            ..Self::default()
        }
    }
}

/// etcd connection and layout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Skip TLS. When false (the default, as for PostgreSQL), connections use
    /// TLS with system roots; plaintext `http://` endpoints need this set.
    pub insecure: bool,
    /// Every key written by this layer lives under this prefix.
    pub key_prefix: String,
    pub retry_count: u32,
    #[serde(with = "secs")]
    pub retry_wait: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Locations stored per transition page.
    pub page_size: usize,
    /// Largest encoded value written under a single key.
    pub max_value_bytes: usize,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://localhost:2379".to_string()],
            username: None,
            password: None,
            insecure: false,
            key_prefix: "/pcs".to_string(),
            retry_count: 5,
            retry_wait: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            page_size: 1000,
            max_value_bytes: 1024 * 1024,
        }
    }
}

/// Identity of a distributed lock: every provider configured with the same
/// name contends for the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockName {
    pub namespace: String,
    pub name: String,
}

impl LockName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Default for LockName {
    fn default() -> Self {
        Self::new("pcs", "distlock")
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Durations as whole seconds, the way operators write them in config files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_defaults_match_service_defaults() {
        let c = PostgresConfig::default();
        assert_eq!(c.host, "localhost");
        assert_eq!(c.port, 5432);
        assert_eq!(c.user, "pcsuser");
        assert_eq!(c.dbname, "pcsdb");
        assert_eq!(c.retry_count, 5);
        assert_eq!(c.retry_wait, Duration::from_secs(10));
        assert!(!c.insecure);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let c: PostgresConfig = toml::from_str(
            r#"
            host = "db.example"
            retry_wait = 2
            insecure = true
            "#,
        )
        .unwrap();
        assert_eq!(c.host, "db.example");
        assert_eq!(c.retry_wait, Duration::from_secs(2));
        assert!(c.insecure);
        assert_eq!(c.port, 5432);
    }

    #[test]
    fn both_backends_default_to_tls() {
        assert!(!PostgresConfig::default().insecure);
        let etcd = EtcdConfig::default();
        assert!(!etcd.insecure);
        assert!(etcd.endpoints.iter().all(|e| e.starts_with("https://")));
    }

    #[test]
    fn etcd_config_round_trips_through_toml() {
        let mut c = EtcdConfig::default();
        c.endpoints = vec!["http://etcd-0:2379".into(), "http://etcd-1:2379".into()];
        c.insecure = true;
        c.page_size = 50;
        let text = toml::to_string(&c).unwrap();
        let back: EtcdConfig = toml::from_str(&text).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn default_lock_name() {
        assert_eq!(LockName::default().to_string(), "pcs/distlock");
    }
}
