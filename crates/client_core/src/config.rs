use std::{collections::HashMap, fs, path::Path, time::Duration};

use peer_negotiation::{PeerOptions, DEFAULT_STUN_SERVER};
use serde::Deserialize;
use url::Url;

use crate::backoff::{BackoffPolicy, RECONNECT_ATTEMPT_CAP};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub ice_servers: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            heartbeat_interval_ms: 25_000,
            poll_interval_ms: 2_500,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 20_000,
            request_timeout_ms: 15_000,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl ClientSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
            RECONNECT_ATTEMPT_CAP,
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Upper bound for one REST request, so a stalled server surfaces as a transport failure.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn endpoints(&self) -> anyhow::Result<RealtimeEndpoints> {
        RealtimeEndpoints::new(&self.server_url)
    }
}

/// Derives the REST base and websocket urls from one server url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeEndpoints {
    http_base: Url,
}

impl RealtimeEndpoints {
    pub fn new(server_url: &str) -> anyhow::Result<Self> {
        let http_base = Url::parse(server_url.trim_end_matches('/'))?;
        match http_base.scheme() {
            "http" | "https" => Ok(Self { http_base }),
            other => Err(anyhow::anyhow!(
                "server_url must start with http:// or https://, got {other}://"
            )),
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}",
            self.http_base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn events_url(&self, token: &str) -> Url {
        self.ws_url("ws/events", token)
    }

    pub fn call_url(&self, room: &str, token: &str) -> Url {
        self.ws_url(&format!("ws/calls/{room}"), token)
    }

    fn ws_url(&self, path: &str, token: &str) -> Url {
        let mut url = self.http_base.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always an allowed scheme change.
        let _ = url.set_scheme(scheme);
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}/api/{path}"));
        url.query_pairs_mut().clear().append_pair("token", token);
        url
    }
}

pub fn load_settings(path: Option<&Path>) -> ClientSettings {
    let mut settings = ClientSettings::default();

    let path = path.unwrap_or_else(|| Path::new("client.toml"));
    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_file_values(&mut settings, &file_cfg);
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_values(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("heartbeat_interval_ms").and_then(as_u64) {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = file_cfg.get("poll_interval_ms").and_then(as_u64) {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = file_cfg.get("reconnect_base_delay_ms").and_then(as_u64) {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = file_cfg.get("reconnect_max_delay_ms").and_then(as_u64) {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = file_cfg.get("request_timeout_ms").and_then(as_u64) {
        settings.request_timeout_ms = v;
    }
    if let Some(servers) = file_cfg.get("ice_servers").and_then(toml::Value::as_array) {
        settings.ice_servers = servers
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }
}

fn as_u64(value: &toml::Value) -> Option<u64> {
    value.as_integer().and_then(|v| u64::try_from(v).ok())
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("MESSENGER_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("APP__HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = var("APP__POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.poll_interval_ms = v;
    }
    if let Some(v) = var("APP__RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = var("APP__RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = var("APP__ICE_SERVERS") {
        settings.ice_servers = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
