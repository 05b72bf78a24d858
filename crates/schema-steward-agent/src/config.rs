use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use schema_steward_domain::ensure_non_empty;
use serde::Deserialize;

pub const DEFAULT_AUDIT_DB: &str = "./schema-steward-audit.sqlite3";
pub const DEFAULT_AGENT_ID: &str = "schema-steward-agent";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OBSERVATION_WINDOW_SECS: u64 = 300;

/// Optional YAML file. Secrets never live here: each connection names the
/// environment variable holding its DSN.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigFile {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub audit_db: Option<PathBuf>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub observation_window_secs: Option<u64>,
    #[serde(default)]
    pub control_plane: Option<ControlPlaneSection>,
    #[serde(default)]
    pub connections: Vec<ConnectionSection>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub coordinator_db: Option<PathBuf>,
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    pub connection_id: String,
    pub dsn_env: String,
}

/// Load and validate a config file.
///
/// # Errors
/// Returns an error when the file cannot be read or fails validation.
pub fn load_config_file(path: &Path) -> Result<AgentConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config_yaml(&content)
}

/// # Errors
/// Returns an error for malformed YAML, unknown keys or invalid values.
pub fn parse_config_yaml(yaml: &str) -> Result<AgentConfigFile> {
    let config: AgentConfigFile =
        serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid agent config YAML: {err}"))?;
    validate_connections(&config.connections)?;
    if config.batch_size == Some(0) {
        return Err(anyhow!("batch_size MUST be greater than zero"));
    }
    Ok(config)
}

fn validate_connections(connections: &[ConnectionSection]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for connection in connections {
        ensure_non_empty("connection_id", &connection.connection_id)?;
        ensure_non_empty("dsn_env", &connection.dsn_env)?;
        if !seen.insert(connection.connection_id.as_str()) {
            return Err(anyhow!(
                "duplicate connection_id: {}",
                connection.connection_id
            ));
        }
    }
    Ok(())
}

/// Parse a `connection_id=ENV_VAR` flag value.
///
/// # Errors
/// Returns an error when either side is missing.
pub fn parse_connection_flag(raw: &str) -> Result<ConnectionSection> {
    let (connection_id, dsn_env) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("connection '{raw}' must look like connection_id=DSN_ENV_VAR"))?;
    let section = ConnectionSection {
        connection_id: connection_id.trim().to_string(),
        dsn_env: dsn_env.trim().to_string(),
    };
    ensure_non_empty("connection_id", &section.connection_id)?;
    ensure_non_empty("dsn_env", &section.dsn_env)?;
    Ok(section)
}

/// Command-line and environment values; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub agent_id: Option<String>,
    pub audit_db: Option<PathBuf>,
    pub coordinator_url: Option<String>,
    pub coordinator_db: Option<PathBuf>,
    pub api_token_env: Option<String>,
    pub control_timeout_ms: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub observation_window_secs: Option<u64>,
    pub connections: Vec<ConnectionSection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneTarget {
    Http {
        base_url: String,
        api_token_env: Option<String>,
    },
    /// Same-host coordinator database, no HTTP hop.
    Local { coordinator_db: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub agent_id: String,
    pub audit_db: PathBuf,
    pub control_plane: ControlPlaneTarget,
    pub control_timeout: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub observation_window: Duration,
    pub connections: Vec<ConnectionSection>,
}

impl AgentSettings {
    /// Merge file values under command-line overrides and apply defaults.
    ///
    /// # Errors
    /// Returns an error when no coordinator is configured, no connection is
    /// served, or a value is out of range.
    pub fn resolve(file: AgentConfigFile, overrides: Overrides) -> Result<Self> {
        let section = file.control_plane.unwrap_or_default();

        let coordinator_db = overrides.coordinator_db.or(section.coordinator_db);
        let base_url = overrides.coordinator_url.or(section.base_url);
        let control_plane = match (coordinator_db, base_url) {
            (Some(coordinator_db), _) => ControlPlaneTarget::Local { coordinator_db },
            (None, Some(base_url)) => {
                ensure_non_empty("coordinator_url", &base_url)?;
                ControlPlaneTarget::Http {
                    base_url,
                    api_token_env: overrides.api_token_env.or(section.api_token_env),
                }
            }
            (None, None) => {
                return Err(anyhow!(
                    "no coordinator configured; set --coordinator-url or --coordinator-db"
                ))
            }
        };

        let connections = if overrides.connections.is_empty() {
            file.connections
        } else {
            overrides.connections
        };
        if connections.is_empty() {
            return Err(anyhow!(
                "no connections configured; pass --connection connection_id=DSN_ENV_VAR"
            ));
        }
        validate_connections(&connections)?;

        let batch_size = overrides
            .batch_size
            .or(file.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(anyhow!("batch_size MUST be greater than zero"));
        }

        let agent_id = overrides
            .agent_id
            .or(file.agent_id)
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
        ensure_non_empty("agent_id", &agent_id)?;

        Ok(Self {
            agent_id,
            audit_db: overrides
                .audit_db
                .or(file.audit_db)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_DB)),
            control_plane,
            control_timeout: Duration::from_millis(
                overrides
                    .control_timeout_ms
                    .or(section.timeout_ms)
                    .unwrap_or(DEFAULT_CONTROL_TIMEOUT_MS),
            ),
            poll_interval: Duration::from_secs(
                overrides
                    .poll_interval_secs
                    .or(file.poll_interval_secs)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            batch_size,
            observation_window: Duration::from_secs(
                overrides
                    .observation_window_secs
                    .or(file.observation_window_secs)
                    .unwrap_or(DEFAULT_OBSERVATION_WINDOW_SECS),
            ),
            connections,
        })
    }

    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|connection| connection.connection_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{
        parse_config_yaml, parse_connection_flag, AgentConfigFile, AgentSettings,
        ControlPlaneTarget, Overrides, DEFAULT_AUDIT_DB,
    };

    const SAMPLE: &str = r"
agent_id: agent-eu-1
poll_interval_secs: 15
control_plane:
  base_url: http://coordinator.internal:4020
  api_token_env: STEWARD_API_TOKEN
connections:
  - connection_id: conn-primary
    dsn_env: STEWARD_DSN_PRIMARY
  - connection_id: conn-reporting
    dsn_env: STEWARD_DSN_REPORTING
";

    #[test]
    fn file_values_apply_with_defaults() {
        let file = parse_config_yaml(SAMPLE).unwrap_or_else(|_| unreachable!());
        let settings =
            AgentSettings::resolve(file, Overrides::default()).unwrap_or_else(|_| unreachable!());

        assert_eq!(settings.agent_id, "agent-eu-1");
        assert_eq!(settings.poll_interval, Duration::from_secs(15));
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.observation_window, Duration::from_secs(300));
        assert_eq!(settings.control_timeout, Duration::from_secs(5));
        assert_eq!(settings.audit_db, PathBuf::from(DEFAULT_AUDIT_DB));
        assert_eq!(
            settings.control_plane,
            ControlPlaneTarget::Http {
                base_url: "http://coordinator.internal:4020".to_string(),
                api_token_env: Some("STEWARD_API_TOKEN".to_string()),
            }
        );
        assert_eq!(
            settings.connection_ids(),
            vec!["conn-primary".to_string(), "conn-reporting".to_string()]
        );
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file = parse_config_yaml(SAMPLE).unwrap_or_else(|_| unreachable!());
        let overrides = Overrides {
            poll_interval_secs: Some(5),
            coordinator_db: Some(PathBuf::from("/var/lib/steward/coordinator.sqlite3")),
            connections: vec![
                parse_connection_flag("conn-canary=CANARY_DSN").unwrap_or_else(|_| unreachable!())
            ],
            ..Overrides::default()
        };
        let settings = AgentSettings::resolve(file, overrides).unwrap_or_else(|_| unreachable!());

        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert!(matches!(
            settings.control_plane,
            ControlPlaneTarget::Local { .. }
        ));
        assert_eq!(settings.connection_ids(), vec!["conn-canary".to_string()]);
    }

    #[test]
    fn unknown_keys_and_duplicates_are_rejected() {
        assert!(parse_config_yaml("agent_id: a\nsecret_dsn: mysql://root@db\n").is_err());
        assert!(parse_config_yaml(
            "connections:\n  - {connection_id: a, dsn_env: A}\n  - {connection_id: a, dsn_env: B}\n"
        )
        .is_err());
        assert!(parse_config_yaml("batch_size: 0\n").is_err());
    }

    #[test]
    fn coordinator_and_connections_are_required() {
        let no_coordinator = AgentSettings::resolve(
            AgentConfigFile::default(),
            Overrides {
                connections: vec![parse_connection_flag("a=A").unwrap_or_else(|_| unreachable!())],
                ..Overrides::default()
            },
        );
        assert!(no_coordinator.is_err());

        let no_connections = AgentSettings::resolve(
            AgentConfigFile::default(),
            Overrides {
                coordinator_url: Some("http://127.0.0.1:4020".to_string()),
                ..Overrides::default()
            },
        );
        assert!(no_connections.is_err());
    }

    #[test]
    fn connection_flag_requires_both_sides() {
        assert!(parse_connection_flag("conn-a").is_err());
        assert!(parse_connection_flag("=ENV").is_err());
        assert!(parse_connection_flag("conn-a=").is_err());
    }
}
