use heed::{Database, Env, EnvOpenOptions};
use heed::types::*;
use std::fs;
use std::path::Path;
use log::{debug, warn};
use crate::config::Settings;
use crate::subscription::{PushSubscription, StoreError, SubscriptionStore};

/// LMDB-backed subscription store. Every write is its own write transaction;
/// LMDB admits one writer at a time, so concurrent registrations serialize
/// instead of overwriting each other's read-modify-write cycles.
pub struct DbHandler {
    pub env: Env,
    subscriptions: Database<Str, Bytes>,
}

impl DbHandler {
    pub fn new(settings: &Settings) -> Result<Self, StoreError> {
        Self::open(&settings.db_path, settings.db_map_size)
    }

    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;

        let environment = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path)?
        };

        let subscriptions = {
            let mut wtxn = environment.write_txn()?;
            let subscriptions = environment.create_database(&mut wtxn, Some("push_subscriptions"))?;
            wtxn.commit()?;
            subscriptions
        };

        Ok(Self {
            env: environment,
            subscriptions,
        })
    }
}

impl SubscriptionStore for DbHandler {
    fn register(&self, external_id: &str, subscription: &PushSubscription) -> Result<(), StoreError> {
        let data = serde_json::to_vec(subscription)?;

        let mut wtxn = self.env.write_txn()?;
        self.subscriptions.put(&mut wtxn, external_id, &data)?;
        wtxn.commit()?;

        debug!("Saved push subscription for {}", external_id);
        Ok(())
    }

    fn get(&self, external_id: &str) -> Result<Option<PushSubscription>, StoreError> {
        let rtxn = self.env.read_txn()?;

        match self.subscriptions.get(&rtxn, external_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn all(&self) -> Result<Vec<(String, PushSubscription)>, StoreError> {
        let rtxn = self.env.read_txn()?;

        let mut entries = Vec::new();
        for result in self.subscriptions.iter(&rtxn)? {
            let (external_id, bytes) = result?;
            match serde_json::from_slice::<PushSubscription>(bytes) {
                Ok(subscription) => entries.push((external_id.to_string(), subscription)),
                Err(e) => warn!("Skipping unreadable subscription for {}: {}", external_id, e),
            }
        }

        debug!("Loaded {} subscriptions", entries.len());
        Ok(entries)
    }

    fn remove(&self, external_id: &str) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.subscriptions.delete(&mut wtxn, external_id)?;
        wtxn.commit()?;
        Ok(existed)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.subscriptions.len(&rtxn)?)
    }
}
