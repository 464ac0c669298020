use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bot: BotConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub api_id: i64,
    pub api_hash: String,
    pub token: String,
    pub admin_id: u64,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: Option<String>,
}

impl StoreConfig {
    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or("channel_manager")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub subscription_sweep_secs: Option<u64>,
    pub invite_sweep_secs: Option<u64>,
    pub send_retry_attempts: Option<u32>,
}

impl RuntimeConfig {
    pub fn subscription_sweep_secs(&self) -> u64 {
        self.subscription_sweep_secs.unwrap_or(60)
    }

    pub fn invite_sweep_secs(&self) -> u64 {
        self.invite_sweep_secs.unwrap_or(600)
    }

    pub fn send_retry_attempts(&self) -> u32 {
        self.send_retry_attempts.unwrap_or(3)
    }
}

/// User-facing texts. Every field is optional; the built-in wording is used
/// when a template is not configured. Templates may carry `{placeholders}`
/// filled via [`format_template`].
#[derive(Debug, Default, Deserialize, Clone)]
pub struct MessagesConfig {
    pub request_received: Option<String>,
    pub accepted: Option<String>,
    pub rejected: Option<String>,
    pub contact_url: Option<String>,
    pub removal_scheduled: Option<String>,
    pub warning: Option<String>,
    pub removed: Option<String>,
    pub forwarded_ack: Option<String>,
}

impl MessagesConfig {
    pub fn request_received(&self) -> &str {
        self.request_received
            .as_deref()
            .unwrap_or("Your request has been sent to the admin. Please wait for approval.")
    }

    pub fn accepted(&self) -> &str {
        self.accepted
            .as_deref()
            .unwrap_or("Congratulations! Your request has been accepted. Here are your invite links:")
    }

    pub fn rejected(&self) -> &str {
        self.rejected.as_deref().unwrap_or(
            "Sorry, your request has been rejected.\n\nYou need to pay your monthly subscription to receive invite links. Contact the admin for payment instructions.",
        )
    }

    pub fn contact_url(&self) -> &str {
        self.contact_url.as_deref().unwrap_or("https://t.me/")
    }

    // {date} = local wall-clock removal instant
    pub fn removal_scheduled(&self) -> &str {
        self.removal_scheduled
            .as_deref()
            .unwrap_or("You will be removed from the channels on {date}.")
    }

    pub fn warning(&self) -> &str {
        self.warning
            .as_deref()
            .unwrap_or("Warning: you will be removed from the channels in 24 hours. Contact the admin to renew.")
    }

    pub fn removed(&self) -> &str {
        self.removed
            .as_deref()
            .unwrap_or("You have been removed from the channels. Contact the admin to renew your subscription.")
    }

    pub fn forwarded_ack(&self) -> &str {
        self.forwarded_ack
            .as_deref()
            .unwrap_or("Your message has been forwarded to the admin.")
    }
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.api_id <= 0 {
        return Err(anyhow!("bot.api_id must be a positive platform app id"));
    }
    if cfg.bot.api_hash.trim().is_empty() {
        return Err(anyhow!("bot.api_hash must not be empty"));
    }
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token must not be empty"));
    }
    if cfg.bot.admin_id == 0 {
        return Err(anyhow!("bot.admin_id must be a valid user id"));
    }
    if cfg.store.uri.trim().is_empty() {
        return Err(anyhow!("store.uri must not be empty"));
    }
    if cfg.http.port == 0 {
        return Err(anyhow!("http.port must not be 0"));
    }
    if cfg.runtime.subscription_sweep_secs() == 0 {
        return Err(anyhow!("runtime.subscription_sweep_secs must be > 0"));
    }
    if cfg.runtime.invite_sweep_secs() == 0 {
        return Err(anyhow!("runtime.invite_sweep_secs must be > 0"));
    }
    if let Some(contact) = &cfg.messages.contact_url {
        url::Url::parse(contact)
            .with_context(|| format!("messages.contact_url is not a valid URL: {contact}"))?;
    }
    Ok(())
}

pub fn format_template(s: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = s.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{}}}", k), v);
    }
    out
}

pub fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
bot:
  api_id: 12345
  api_hash: "0123456789abcdef"
  token: "110201543:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw"
  admin_id: 777000
store:
  uri: "mongodb://localhost:27017"
http:
  port: 8000
"#;

    #[test]
    fn parses_minimal_config_and_applies_defaults() {
        let cfg: Config = serde_yaml::from_str(FULL).unwrap();
        validate_config(&cfg).unwrap();
        assert_eq!(cfg.store.database(), "channel_manager");
        assert_eq!(cfg.runtime.subscription_sweep_secs(), 60);
        assert_eq!(cfg.runtime.invite_sweep_secs(), 600);
        assert_eq!(cfg.runtime.send_retry_attempts(), 3);
        assert!(cfg.messages.warning().contains("24 hours"));
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let without_token = FULL.replace("  token: \"110201543:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw\"\n", "");
        assert!(serde_yaml::from_str::<Config>(&without_token).is_err());
    }

    #[test]
    fn rejects_empty_credentials() {
        let mut cfg: Config = serde_yaml::from_str(FULL).unwrap();
        cfg.bot.token = "  ".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg: Config = serde_yaml::from_str(FULL).unwrap();
        cfg.bot.api_id = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg: Config = serde_yaml::from_str(FULL).unwrap();
        cfg.bot.admin_id = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_contact_url() {
        let mut cfg: Config = serde_yaml::from_str(FULL).unwrap();
        cfg.messages.contact_url = Some("not a url".into());
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn template_substitution() {
        let mut vars = HashMap::new();
        vars.insert("date", "2026-08-07 at 10:00:00".to_string());
        let out = format_template("removed on {date}", &vars);
        assert_eq!(out, "removed on 2026-08-07 at 10:00:00");
    }

    #[test]
    fn config_arg_parsing() {
        let args = vec!["--config".to_string(), "/etc/warden.yaml".to_string()];
        assert_eq!(parse_config_arg(&args), Some(PathBuf::from("/etc/warden.yaml")));
        assert_eq!(parse_config_arg(&[]), None);
    }
}
