use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::{connection::BackoffPolicy, transport::ws_base_from_server_url};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub auth_token: String,
    pub user_id: i64,
    pub display_name: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub mark_read_delay_ms: u64,
    pub notification_sound_path: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            ws_url: None,
            auth_token: String::new(),
            user_id: 0,
            display_name: "me".into(),
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            mark_read_delay_ms: 2_000,
            notification_sound_path: "static/sounds/notification.mp3".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    auth_token: Option<String>,
    user_id: Option<i64>,
    display_name: Option<String>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    mark_read_delay_ms: Option<u64>,
    notification_sound_path: Option<String>,
}

impl ClientSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.backoff_base_ms.max(1));
        BackoffPolicy {
            base,
            max: Duration::from_millis(self.backoff_max_ms).max(base),
        }
    }

    pub fn mark_read_delay(&self) -> Duration {
        Duration::from_millis(self.mark_read_delay_ms)
    }

    pub fn ws_base(&self) -> Result<Url> {
        match &self.ws_url {
            Some(ws_url) => {
                let ws_url = if ws_url.ends_with('/') {
                    ws_url.clone()
                } else {
                    format!("{ws_url}/")
                };
                Url::parse(&ws_url).with_context(|| format!("invalid ws_url: {ws_url}"))
            }
            None => ws_base_from_server_url(&self.server_url),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_token.is_empty() {
            return Err(anyhow!(
                "missing auth token: set auth_token in client.toml or APP__AUTH_TOKEN"
            ));
        }
        self.ws_base()?;
        Ok(())
    }

    fn apply_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.server_url {
            self.server_url = v;
        }
        if let Some(v) = file_cfg.ws_url {
            self.ws_url = Some(v);
        }
        if let Some(v) = file_cfg.auth_token {
            self.auth_token = v;
        }
        if let Some(v) = file_cfg.user_id {
            self.user_id = v;
        }
        if let Some(v) = file_cfg.display_name {
            self.display_name = v;
        }
        if let Some(v) = file_cfg.backoff_base_ms {
            self.backoff_base_ms = v;
        }
        if let Some(v) = file_cfg.backoff_max_ms {
            self.backoff_max_ms = v;
        }
        if let Some(v) = file_cfg.mark_read_delay_ms {
            self.mark_read_delay_ms = v;
        }
        if let Some(v) = file_cfg.notification_sound_path {
            self.notification_sound_path = v;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CHAT_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = var("APP__AUTH_TOKEN") {
            self.auth_token = v;
        }
        if let Some(parsed) = var("APP__USER_ID").and_then(|v| v.parse().ok()) {
            self.user_id = parsed;
        }
        if let Some(v) = var("APP__DISPLAY_NAME") {
            self.display_name = v;
        }
        if let Some(parsed) = var("APP__BACKOFF_BASE_MS").and_then(|v| v.parse().ok()) {
            self.backoff_base_ms = parsed;
        }
        if let Some(parsed) = var("APP__BACKOFF_MAX_MS").and_then(|v| v.parse().ok()) {
            self.backoff_max_ms = parsed;
        }
        if let Some(parsed) = var("APP__MARK_READ_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.mark_read_delay_ms = parsed;
        }
        if let Some(v) = var("APP__NOTIFICATION_SOUND_PATH") {
            self.notification_sound_path = v;
        }
    }
}

/// Defaults, then `path` (if it exists), then the environment.
pub fn load_settings(path: impl AsRef<Path>) -> Result<ClientSettings> {
    let path = path.as_ref();
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.apply_file(file_cfg);
    }

    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
