//! TOML configuration.
//!
//! Loaded once by the CLI via [`load_config`] and passed by reference into
//! the constructors of the clients and services. Secrets may come from the
//! environment instead of the file (`OPENAI_API_KEY`, `FEISHU_APP_SECRET`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use chat_digest_core::batch::MAX_BATCH_SIZE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub completion: CompletionConfig,
    #[serde(default)]
    pub chatlog: ChatlogConfig,
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_timeout() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

impl CompletionConfig {
    /// Chat-completions base URL for the configured provider.
    pub fn resolved_base_url(&self) -> Result<String> {
        if let Some(url) = &self.base_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        match self.provider.as_str() {
            "openai" => Ok("https://api.openai.com/v1".to_string()),
            "openrouter" => Ok("https://openrouter.ai/api/v1".to_string()),
            "custom" => bail!("completion.base_url must be set when provider is 'custom'"),
            other => bail!("Unknown completion provider: '{}'", other),
        }
    }

    /// API key from the file, falling back to `OPENAI_API_KEY`.
    pub fn resolved_api_key(&self) -> Result<String> {
        match &self.api_key {
            Some(key) if !key.is_empty() => Ok(key.clone()),
            _ => std::env::var("OPENAI_API_KEY")
                .context("completion.api_key not set and OPENAI_API_KEY environment variable not set"),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatlogConfig {
    #[serde(default = "default_chatlog_url")]
    pub base_url: String,
    #[serde(default = "default_chatlog_timeout")]
    pub timeout_secs: u64,
    /// UTC offset applied to naive timestamps from the chat log, in minutes.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

impl Default for ChatlogConfig {
    fn default() -> Self {
        Self {
            base_url: default_chatlog_url(),
            timeout_secs: default_chatlog_timeout(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

fn default_chatlog_url() -> String {
    "http://127.0.0.1:5030".to_string()
}
fn default_chatlog_timeout() -> u64 {
    10
}
fn default_utc_offset_minutes() -> i32 {
    480
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeishuConfig {
    pub app_id: String,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default = "default_feishu_api")]
    pub api_base: String,
    #[serde(default = "default_feishu_web")]
    pub web_base: String,
    /// Folder the new base is created in. Empty means the app's root.
    #[serde(default)]
    pub folder_token: String,
    #[serde(default = "default_feishu_timeout")]
    pub timeout_secs: u64,
}

fn default_feishu_api() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}
fn default_feishu_web() -> String {
    "https://feishu.cn/base".to_string()
}
fn default_feishu_timeout() -> u64 {
    30
}

impl FeishuConfig {
    /// App secret from the file, falling back to `FEISHU_APP_SECRET`.
    pub fn resolved_app_secret(&self) -> Result<String> {
        match &self.app_secret {
            Some(secret) if !secret.is_empty() => Ok(secret.clone()),
            _ => std::env::var("FEISHU_APP_SECRET")
                .context("feishu.app_secret not set and FEISHU_APP_SECRET environment variable not set"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_commit_slice")]
    pub commit_slice: usize,
    #[serde(default = "default_commit_delay_ms")]
    pub commit_delay_ms: u64,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_attachment_concurrency")]
    pub attachment_concurrency: usize,
    #[serde(default = "default_attachment_timeout")]
    pub attachment_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub classify: bool,
    #[serde(default = "default_true")]
    pub transfer_ownership: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            commit_slice: default_commit_slice(),
            commit_delay_ms: default_commit_delay_ms(),
            batch_delay_ms: default_batch_delay_ms(),
            attachment_concurrency: default_attachment_concurrency(),
            attachment_timeout_secs: default_attachment_timeout(),
            classify: true,
            transfer_ownership: true,
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_commit_slice() -> usize {
    100
}
fn default_commit_delay_ms() -> u64 {
    1000
}
fn default_batch_delay_ms() -> u64 {
    3000
}
fn default_attachment_concurrency() -> usize {
    4
}
fn default_attachment_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Completion
    match config.completion.provider.as_str() {
        "openai" | "openrouter" => {}
        "custom" => {
            if config.completion.base_url.is_none() {
                bail!("completion.base_url must be set when provider is 'custom'");
            }
        }
        other => bail!(
            "Unknown completion provider: '{}'. Must be openai, openrouter, or custom.",
            other
        ),
    }
    if config.completion.model.trim().is_empty() {
        bail!("completion.model must not be empty");
    }

    // Destination
    if config.feishu.app_id.trim().is_empty() {
        bail!("feishu.app_id must not be empty");
    }

    // Export
    let export = &config.export;
    if !(1..=MAX_BATCH_SIZE).contains(&export.batch_size) {
        bail!("export.batch_size must be in [1, {}]", MAX_BATCH_SIZE);
    }
    if !(1..=MAX_BATCH_SIZE).contains(&export.commit_slice) {
        bail!("export.commit_slice must be in [1, {}]", MAX_BATCH_SIZE);
    }
    if export.attachment_concurrency == 0 {
        bail!("export.attachment_concurrency must be > 0");
    }
    if export.attachment_timeout_secs == 0 {
        bail!("export.attachment_timeout_secs must be > 0");
    }

    // Logging
    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
[completion]
model = "gpt-4o-mini"

[feishu]
app_id = "cli_test"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config(MINIMAL);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.completion.provider, "openai");
        assert_eq!(config.chatlog.base_url, "http://127.0.0.1:5030");
        assert_eq!(config.export.batch_size, 100);
        assert_eq!(config.export.batch_delay_ms, 3000);
        assert!(config.export.classify);
        assert_eq!(config.feishu.web_base, "https://feishu.cn/base");
        assert_eq!(
            config.completion.resolved_base_url().unwrap(),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn rejects_oversized_batch() {
        let file = write_config(&format!("{}\n[export]\nbatch_size = 500\n", MINIMAL));
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn custom_provider_needs_base_url() {
        let body = r#"
[completion]
provider = "custom"
model = "local"

[feishu]
app_id = "cli_test"
"#;
        let file = write_config(body);
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn unknown_provider() {
        let body = MINIMAL.replace("[completion]", "[completion]\nprovider = \"bogus\"");
        let file = write_config(&body);
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/chatdigest.example.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.chatlog.utc_offset_minutes, 480);
        assert!(config.export.transfer_ownership);
    }

    #[test]
    fn missing_file() {
        let err = load_config(Path::new("/nonexistent/chatdigest.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
