use chrono::Utc;
use log::info;

use crate::cms::backend::{BackendError, ContentStore};
use crate::cms::models::{Caller, ContentItem, UserConfig};

const SAMPLE_CONTENT: [&str; 3] = [
    "# Sample 1\nThis is sample markdown content for testing.",
    "# Sample 2\nAnother piece of content to demonstrate the CMS.",
    "# Sample 3\nYou can edit or delete this content from the dashboard.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Existing,
    Created,
}

/// First-login setup: a default config plus three sample rows, skipped when
/// the user already has a config. The inserts are independent calls; a
/// failure part way leaves whatever was written before it.
pub async fn bootstrap_user(
    store: &dyn ContentStore,
    caller: &Caller,
) -> Result<BootstrapOutcome, BackendError> {
    if store.get_config(caller).await?.is_some() {
        return Ok(BootstrapOutcome::Existing);
    }

    store.insert_config(caller, &UserConfig::default()).await?;

    let now = Utc::now();
    for content in SAMPLE_CONTENT {
        let row = ContentItem::new(&caller.user_id, content, now);
        store.insert_content(caller, &row).await?;
    }

    info!("Initialized new user {} with default config and sample data", caller.user_id);
    Ok(BootstrapOutcome::Created)
}
