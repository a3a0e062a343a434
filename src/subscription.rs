use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use log::warn;
use thiserror::Error;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Browser push subscription as produced by `PushManager.subscribe()`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

impl PushSubscription {
    fn normalize_base64url(input: &str) -> String {
        let without_padding = input.trim_end_matches('=');

        without_padding
            .replace('+', "-")
            .replace('/', "_")
    }

    pub fn normalized(&self) -> Self {
        PushSubscription {
            endpoint: self.endpoint.clone(),
            keys: SubscriptionKeys {
                p256dh: Self::normalize_base64url(&self.keys.p256dh),
                auth: Self::normalize_base64url(&self.keys.auth),
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.endpoint.is_empty() && !self.keys.p256dh.is_empty() && !self.keys.auth.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] heed::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Subscriptions keyed by the caller-supplied external id. Registering an id
/// that already exists replaces the previous subscription.
pub trait SubscriptionStore: Send + Sync {
    fn register(&self, external_id: &str, subscription: &PushSubscription) -> Result<(), StoreError>;
    fn get(&self, external_id: &str) -> Result<Option<PushSubscription>, StoreError>;
    fn all(&self) -> Result<Vec<(String, PushSubscription)>, StoreError>;
    fn remove(&self, external_id: &str) -> Result<bool, StoreError>;
    fn count(&self) -> Result<u64, StoreError>;
}

/// Parses the flat file layout `{external_id: {endpoint, keys}}`.
///
/// Entries that are not valid subscriptions are skipped with a warning; the
/// second value is how many were skipped.
pub fn parse_subscription_file(
    contents: &str,
) -> Result<(Vec<(String, PushSubscription)>, usize), serde_json::Error> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(contents)?;
    let mut entries = Vec::with_capacity(raw.len());
    let mut skipped = 0;

    for (external_id, value) in raw {
        match serde_json::from_value::<PushSubscription>(value) {
            Ok(subscription) => entries.push((external_id, subscription)),
            Err(e) => {
                warn!("Skipping subscription for {}: {}", external_id, e);
                skipped += 1;
            }
        }
    }

    Ok((entries, skipped))
}

pub fn to_subscription_file(
    entries: Vec<(String, PushSubscription)>,
) -> Result<String, serde_json::Error> {
    let map: BTreeMap<String, PushSubscription> = entries.into_iter().collect();
    serde_json::to_string_pretty(&map)
}

pub fn import_subscriptions(
    store: &dyn SubscriptionStore,
    contents: &str,
) -> Result<(usize, usize), StoreError> {
    let (entries, skipped) = parse_subscription_file(contents)?;
    let imported = entries.len();
    for (external_id, subscription) in entries {
        store.register(&external_id, &subscription)?;
    }
    Ok((imported, skipped))
}
