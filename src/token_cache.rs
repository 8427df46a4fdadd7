//! Cached access token with proactive refresh.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::traits::{AccessToken, TokenSource};

/// Tokens this close to expiry are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Single-writer cache in front of a [`TokenSource`].
///
/// The lock is held across the refresh so concurrent callers wait for one
/// fetch instead of racing several.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_margin(source, REFRESH_MARGIN)
    }

    pub fn with_margin(source: Arc<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            margin,
            current: Mutex::new(None),
        }
    }

    /// A token valid for at least the refresh margin.
    pub async fn token(&self) -> Result<String> {
        let mut guard = self.current.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() + self.margin {
                return Ok(cached.token.clone());
            }
        }

        tracing::debug!("Refreshing access token");
        let fresh = self
            .source
            .fetch_token()
            .await
            .context("Failed to obtain access token")?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token so the next call refetches.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
