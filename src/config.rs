use crate::session::ReconnectPolicy;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Timing and retry knobs of the session core.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long `POST /sessions` waits for the first QR or ready signal.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// How long a send waits for the session to become ready.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_secs")]
    pub reconnect_base_delay_secs: u64,
    /// How long a restore from stored credentials may take to reach open.
    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
    /// Bridge request/ack timeout.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: default_start_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_secs: default_reconnect_base_delay_secs(),
            restore_timeout_secs: default_restore_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_secs(self.reconnect_base_delay_secs),
        )
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sessions_dir: default_sessions_dir(),
            uploads_dir: default_uploads_dir(),
            bridge_url: default_bridge_url(),
            max_upload_bytes: default_max_upload_bytes(),
            session: SessionConfig::default(),
        }
    }
}

// Default functions
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}
fn default_sessions_dir() -> PathBuf {
    PathBuf::from("auth_sessions")
}
fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:8765".into()
}
fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_start_timeout_secs() -> u64 {
    60
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_secs() -> u64 {
    2
}
fn default_restore_timeout_secs() -> u64 {
    60
}
fn default_ack_timeout_secs() -> u64 {
    30
}

/// Load config from TOML file with env var overrides.
pub fn load(path: &Path) -> anyhow::Result<GatewayConfig> {
    let content = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path.display());
        String::new()
    };

    let mut config: GatewayConfig = toml::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut GatewayConfig,
    var: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = var("WAGATE_HOST") {
        config.host = v;
    }
    if let Some(v) = var("WAGATE_PORT") {
        config.port = v
            .parse()
            .with_context(|| format!("WAGATE_PORT is not a port number: {v}"))?;
    }
    if let Some(v) = var("WAGATE_SESSIONS_DIR") {
        config.sessions_dir = PathBuf::from(v);
    }
    if let Some(v) = var("WAGATE_UPLOADS_DIR") {
        config.uploads_dir = PathBuf::from(v);
    }
    if let Some(v) = var("WAGATE_BRIDGE_URL") {
        config.bridge_url = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_applied_on_empty_toml() {
        let cfg: GatewayConfig = toml::from_str("").expect("empty toml should parse");
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.sessions_dir, PathBuf::from("auth_sessions"));
        assert_eq!(cfg.uploads_dir, PathBuf::from("uploads"));
        assert_eq!(cfg.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(cfg.session, SessionConfig::default());
        assert_eq!(cfg.session.start_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.session.send_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.session.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn partial_toml_overrides_only_set_fields() {
        let toml_str = r#"
port = 9090
bridge_url = "ws://bridge:8765"

[session]
idle_timeout_secs = 60
"#;
        let cfg: GatewayConfig = toml::from_str(toml_str).expect("valid toml");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.bridge_url, "ws://bridge:8765");
        assert_eq!(cfg.session.idle_timeout_secs, 60);
        // defaults preserved for unset fields
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.session.max_reconnect_attempts, 5);
    }

    #[test]
    fn reconnect_policy_from_config() {
        let policy = SessionConfig::default().reconnect_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("WAGATE_PORT", "8081"),
            ("WAGATE_SESSIONS_DIR", "/var/lib/wagate/sessions"),
        ]
        .into_iter()
        .collect();
        let mut cfg = GatewayConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.sessions_dir, PathBuf::from("/var/lib/wagate/sessions"));
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn bad_port_override_is_an_error() {
        let mut cfg = GatewayConfig::default();
        let err = apply_env_overrides(&mut cfg, |k| {
            (k == "WAGATE_PORT").then(|| "not-a-port".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("WAGATE_PORT"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.bridge_url, "ws://127.0.0.1:8765");
    }
}
