use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub channel: ChannelConfig,
    pub guide: GuideConfig,
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Expected value of the `X-Telegram-Bot-Api-Secret-Token` header
    pub webhook_secret: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Channel the guide is gated on, with or without the leading '@'
    pub username: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuideConfig {
    pub document_url: String,
    #[serde(default)]
    pub pick_tour_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    pub supabase_url: String,
    pub service_key: String,
    #[serde(default = "default_audit_table")]
    pub table: String,
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_webhook_path() -> String {
    "/tg-webhook".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_audit_table() -> String {
    "tg_updates".to_string()
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        port: default_port(),
        webhook_path: default_webhook_path(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

impl ChannelConfig {
    /// Bare channel name, used to build `t.me` links.
    pub fn name(&self) -> &str {
        self.username.trim_start_matches('@')
    }

    /// `@name` form accepted by `getChatMember`.
    pub fn chat_ref(&self) -> String {
        format!("@{}", self.name())
    }

    pub fn link(&self) -> String {
        format!("https://t.me/{}", self.name())
    }
}

impl Config {
    /// Where the follow-up "pick a tour" button points. Falls back to the channel.
    pub fn pick_tour_url(&self) -> String {
        self.guide
            .pick_tour_url
            .clone()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.channel.link())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content, |name| std::env::var(name).ok())
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(port) = std::env::var("PORT").ok().filter(|p| !p.is_empty()) {
            config.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }

        Ok(config)
    }

    /// Parse and validate TOML, resolving `${VAR}` placeholders through `lookup`.
    pub fn parse<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolved = substitute_env(content, lookup);
        let config: Config = toml::from_str(&resolved).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("telegram.bot_token", &self.telegram.bot_token),
            ("telegram.webhook_secret", &self.telegram.webhook_secret),
            ("channel.username", &self.channel.username),
            ("guide.document_url", &self.guide.document_url),
        ];
        for (key, value) in required {
            if value.trim().is_empty() || value.contains("${") {
                anyhow::bail!("Missing value for {key}");
            }
        }
        if self.channel.name().is_empty() {
            anyhow::bail!("Missing value for channel.username");
        }
        if !self.server.webhook_path.starts_with('/') {
            anyhow::bail!(
                "server.webhook_path must start with '/': {}",
                self.server.webhook_path
            );
        }
        Ok(())
    }
}

/// Replace `${NAME}` with `lookup(NAME)`. Unknown or malformed placeholders stay verbatim.
fn substitute_env<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
