use anyhow::Result;

use crate::chatlog::ChatlogClient;
use crate::config::Config;
use crate::feishu::FeishuClient;

/// Result of one connectivity probe.
#[derive(Debug, Clone)]
pub struct CheckStatus {
    pub name: &'static str,
    pub status: String,
    pub healthy: bool,
}

impl CheckStatus {
    fn from_result(name: &'static str, result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                name,
                status: "OK".to_string(),
                healthy: true,
            },
            Err(e) => Self {
                name,
                status: format!("{:#}", e),
                healthy: false,
            },
        }
    }
}

/// Probe the chat source, completion settings and destination credentials.
pub async fn check_services(config: &Config) -> Result<Vec<CheckStatus>> {
    let chatlog = match ChatlogClient::new(&config.chatlog) {
        Ok(client) => client.check_connection().await,
        Err(e) => Err(e),
    };

    // Completion settings are only validated locally; a probe call would cost tokens.
    let completion = config
        .completion
        .resolved_base_url()
        .and_then(|_| config.completion.resolved_api_key())
        .map(|_| ());

    let feishu = match FeishuClient::new(&config.feishu) {
        Ok(client) => client.check_credentials().await,
        Err(e) => Err(e),
    };

    Ok(vec![
        CheckStatus::from_result("chatlog", chatlog),
        CheckStatus::from_result("completion", completion),
        CheckStatus::from_result("feishu", feishu),
    ])
}

pub async fn run_check(config: &Config) -> Result<()> {
    let statuses = check_services(config).await?;

    println!("{:<12} {:<8} STATUS", "SERVICE", "HEALTHY");
    for s in &statuses {
        println!("{:<12} {:<8} {}", s.name, s.healthy, s.status);
    }

    if let Some(failed) = statuses.iter().find(|s| !s.healthy) {
        anyhow::bail!("{} is not reachable or not configured", failed.name);
    }
    Ok(())
}
