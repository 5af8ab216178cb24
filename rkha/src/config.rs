use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;

use crate::coordinator::LockPath;
use crate::error::ConfigIncomplete;

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Controller settings, read once at startup and never mutated afterwards.
///
/// ```yaml
/// coordination-endpoints: ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
/// session-timeout: 10000
/// root-path: /ems
/// group-root-path: ft
/// instance-name: broker1
/// up-command: /opt/ems/bin/ems-up.sh
/// down-command: /opt/ems/bin/ems-down.sh
/// failover-delay: 5
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailoverConfig {
    // Xline/etcd endpoints, either a list or a comma separated string
    #[serde(default, deserialize_with = "endpoint_list")]
    pub coordination_endpoints: Vec<String>,
    // session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub root_path: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub group_root_path: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub instance_name: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub up_command: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub down_command: Option<String>,
    // forwarded verbatim as argv[1] of the up command
    #[serde(default, deserialize_with = "optional_scalar")]
    pub failover_delay: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Everything one primary episode needs, derived from a complete config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPlan {
    pub lock_path: LockPath,
    pub up_command: String,
    pub up_args: Vec<String>,
    pub down_command: String,
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}

impl FailoverConfig {
    /// Builds the plan for the next episode, or reports which required keys
    /// are missing. Blank values count as missing.
    pub fn plan(&self) -> Result<FailoverPlan, ConfigIncomplete> {
        let required = [
            ("root-path", &self.root_path),
            ("group-root-path", &self.group_root_path),
            ("instance-name", &self.instance_name),
            ("up-command", &self.up_command),
            ("down-command", &self.down_command),
        ];
        let missing: Vec<&'static str> = required
            .iter()
            .filter(|(_, value)| non_blank(value).is_none())
            .map(|(key, _)| *key)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigIncomplete { missing });
        }

        let segment = |value: &Option<String>| non_blank(value).unwrap_or_default().to_string();
        Ok(FailoverPlan {
            lock_path: LockPath::from_segments([
                segment(&self.root_path),
                segment(&self.group_root_path),
                segment(&self.instance_name),
            ]),
            up_command: segment(&self.up_command),
            up_args: non_blank(&self.failover_delay)
                .map(|delay| vec![delay.to_string()])
                .unwrap_or_default(),
            down_command: segment(&self.down_command),
        })
    }

    /// Lease TTL for the coordination session, in whole seconds (at least 1).
    pub fn session_ttl_secs(&self) -> i64 {
        let secs = self.session_timeout.div_ceil(1000).max(1);
        i64::try_from(secs).unwrap_or(i64::MAX)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn load_config(path: &Path) -> Result<FailoverConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse YAML config {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<FailoverConfig> {
    // an empty file is a valid (if useless) config
    if content.trim().is_empty() {
        return Ok(FailoverConfig {
            session_timeout: DEFAULT_SESSION_TIMEOUT_MS,
            ..Default::default()
        });
    }
    let cfg: FailoverConfig = serde_yaml::from_str(content)?;
    Ok(cfg)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Endpoints {
    List(Vec<String>),
    Joined(String),
}

fn endpoint_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Endpoints>::deserialize(deserializer)?;
    let endpoints = match raw {
        None => Vec::new(),
        Some(Endpoints::List(list)) => list,
        Some(Endpoints::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(endpoints
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect())
}

/// Accepts strings, numbers and booleans alike, so `failover-delay: 5` and
/// `failover-delay: "5"` mean the same thing.
fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected a scalar value, found {other:?}"
        ))),
    }
}
