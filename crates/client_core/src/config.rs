use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSettings {
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_secs: u64,
}

impl SocketSettings {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_min_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            reconnect_min_ms: 500,
            reconnect_max_ms: 5_000,
            // Handheld links can take minutes to come up.
            connect_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub socket_url: Option<String>,
    pub retry: RetrySettings,
    pub socket: SocketSettings,
    pub history_page_size: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            socket_url: None,
            retry: RetrySettings::default(),
            socket: SocketSettings::default(),
            history_page_size: 20,
        }
    }
}

impl ClientSettings {
    /// Realtime endpoint, derived from the API base URL unless set explicitly.
    pub fn resolved_socket_url(&self) -> Option<String> {
        if let Some(url) = &self.socket_url {
            return Some(url.clone());
        }
        derive_socket_url(&self.api_base_url)
    }
}

pub fn derive_socket_url(api_base_url: &str) -> Option<String> {
    let trimmed = api_base_url.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return None;
    };
    Some(format!("{ws}/ws"))
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    apply(&mut settings, &key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "ignoring malformed settings file"),
        }
    }

    for key in [
        "api_base_url",
        "socket_url",
        "retry_max_attempts",
        "retry_base_delay_ms",
        "retry_jitter_ms",
        "socket_reconnect_min_ms",
        "socket_reconnect_max_ms",
        "socket_connect_timeout_secs",
        "history_page_size",
    ] {
        let env_key = format!("APP__{}", key.to_ascii_uppercase());
        if let Some(value) = env(&env_key) {
            apply(&mut settings, key, &value);
        }
    }

    if settings.socket.reconnect_max_ms < settings.socket.reconnect_min_ms {
        settings.socket.reconnect_max_ms = settings.socket.reconnect_min_ms;
    }
    if settings.history_page_size == 0 {
        settings.history_page_size = ClientSettings::default().history_page_size;
    }

    settings
}

fn apply(settings: &mut ClientSettings, key: &str, value: &str) {
    match key {
        "api_base_url" => settings.api_base_url = value.to_string(),
        "socket_url" => settings.socket_url = Some(value.to_string()),
        "retry_max_attempts" => set_parsed(key, value, &mut settings.retry.max_attempts),
        "retry_base_delay_ms" => set_parsed(key, value, &mut settings.retry.base_delay_ms),
        "retry_jitter_ms" => set_parsed(key, value, &mut settings.retry.jitter_ms),
        "socket_reconnect_min_ms" => {
            set_parsed(key, value, &mut settings.socket.reconnect_min_ms)
        }
        "socket_reconnect_max_ms" => {
            set_parsed(key, value, &mut settings.socket.reconnect_max_ms)
        }
        "socket_connect_timeout_secs" => {
            set_parsed(key, value, &mut settings.socket.connect_timeout_secs)
        }
        "history_page_size" => set_parsed(key, value, &mut settings.history_page_size),
        _ => warn!(key, "ignoring unknown setting"),
    }
}

fn set_parsed<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring malformed setting"),
    }
}
