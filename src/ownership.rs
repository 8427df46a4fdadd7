//! Handing a freshly created base over to the application's owner.
//!
//! Bases are created by the application identity, so without this step no
//! human can manage them. A failure here is reported but never fails the
//! export.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::traits::TabularStore;

/// What happened to ownership of the exported base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OwnershipOutcome {
    Transferred { owner_id: String },
    Skipped,
    Failed { reason: String },
}

impl OwnershipOutcome {
    pub fn is_transferred(&self) -> bool {
        matches!(self, OwnershipOutcome::Transferred { .. })
    }
}

/// Look up the application owner and transfer the base to them.
pub async fn transfer_to_app_owner(store: &dyn TabularStore, app_token: &str) -> OwnershipOutcome {
    match try_transfer(store, app_token).await {
        Ok(owner_id) => {
            tracing::info!(%app_token, %owner_id, "Transferred base ownership");
            OwnershipOutcome::Transferred { owner_id }
        }
        Err(e) => {
            let reason = format!("{:#}", e);
            tracing::warn!(%app_token, %reason, "Ownership transfer failed; base stays with the application");
            OwnershipOutcome::Failed { reason }
        }
    }
}

async fn try_transfer(store: &dyn TabularStore, app_token: &str) -> Result<String> {
    let owner_id = store
        .get_app_owner(store.app_id())
        .await
        .context("Failed to resolve application owner")?;
    store
        .transfer_ownership(app_token, &owner_id)
        .await
        .context("Failed to transfer ownership")?;
    Ok(owner_id)
}
