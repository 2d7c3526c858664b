use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::domain::ChatId;
use url::Url;

use crate::{error::TransportError, reconnect::ReconnectPolicy};

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_url: String,
    pub api_prefix: String,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub page_size: u32,
    pub typing_timeout: Duration,
    pub send_promotion_delay: Duration,
    pub delivered_ack_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".into(),
            api_prefix: "/api".into(),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            page_size: 50,
            typing_timeout: Duration::from_millis(3_000),
            send_promotion_delay: Duration::from_millis(300),
            delivered_ack_delay: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    api_prefix: Option<String>,
    connect_timeout_ms: Option<u64>,
    page_size: Option<u32>,
    reconnect_max_attempts: Option<u32>,
}

impl ClientSettings {
    pub fn rest_base(&self) -> String {
        format!(
            "{}{}",
            self.api_url.trim_end_matches('/'),
            self.api_prefix.trim_end_matches('/')
        )
    }

    /// `<ws-scheme>://<host>/ws/chat/<chatId>/?token=<token>`.
    pub fn socket_url(&self, room: Option<&ChatId>, token: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|err| TransportError::InvalidEndpoint(format!("{}: {err}", self.api_url)))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            TransportError::InvalidEndpoint(format!("cannot switch {} to {scheme}", self.api_url))
        })?;

        let base_path = url.path().trim_end_matches('/').to_string();
        let path = match room {
            Some(room) => format!("{base_path}/ws/chat/{room}/"),
            None => format!("{base_path}/ws/chat/"),
        };
        url.set_path(&path);
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            if let Some(v) = file_cfg.api_url {
                settings.api_url = v;
            }
            if let Some(v) = file_cfg.api_prefix {
                settings.api_prefix = v;
            }
            if let Some(v) = file_cfg.connect_timeout_ms {
                settings.connect_timeout = Duration::from_millis(v);
            }
            if let Some(v) = file_cfg.page_size {
                settings.page_size = v;
            }
            if let Some(v) = file_cfg.reconnect_max_attempts {
                settings.reconnect.max_attempts = v;
            }
        }
    }

    if let Some(v) = env("CHAT_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_PREFIX") {
        settings.api_prefix = v;
    }
    if let Some(v) = env("APP__CONNECT_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.connect_timeout = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = env("APP__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect.max_attempts = parsed;
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
