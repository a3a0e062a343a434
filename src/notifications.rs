use std::sync::Arc;
use log::{debug, error, info, warn};
use serde::Serialize;
use crate::subscription::{StoreError, SubscriptionStore};
use crate::web_push::{PushError, PushSender};

#[derive(Serialize, Debug, Clone)]
pub struct NotificationPayload<'a> {
    pub title: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NotFound,
    Failed,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
}

/// Looks subscriptions up in the store and hands them to the push sender.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn SubscriptionStore>,
    sender: Arc<dyn PushSender>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn SubscriptionStore>, sender: Arc<dyn PushSender>) -> Self {
        Self { store, sender }
    }

    pub async fn send(
        &self,
        external_id: &str,
        title: &str,
        content: &str,
    ) -> Result<SendOutcome, StoreError> {
        let Some(subscription) = self.store.get(external_id)? else {
            warn!("No subscription found for user: {}", external_id);
            return Ok(SendOutcome::NotFound);
        };

        let payload = serde_json::to_vec(&NotificationPayload { title, content })?;

        match self.sender.deliver(&subscription, &payload).await {
            Ok(()) => {
                info!("Push notification sent to {}: {}", external_id, title);
                Ok(SendOutcome::Delivered)
            }
            Err(PushError::EndpointGone) => {
                info!("Removing expired subscription for {}", external_id);
                self.store.remove(external_id)?;
                Ok(SendOutcome::Failed)
            }
            Err(e) => {
                error!("Failed to send push notification to {}: {}", external_id, e);
                Ok(SendOutcome::Failed)
            }
        }
    }

    /// Sends to every stored subscription. Individual failures are counted,
    /// never propagated.
    pub async fn broadcast(&self, title: &str, content: &str) -> Result<BroadcastReport, StoreError> {
        let recipients = self.store.all()?;
        let mut report = BroadcastReport { attempted: recipients.len(), delivered: 0 };

        for (external_id, _) in &recipients {
            match self.send(external_id, title, content).await {
                Ok(SendOutcome::Delivered) => report.delivered += 1,
                Ok(outcome) => debug!("Broadcast to {} ended with {:?}", external_id, outcome),
                Err(e) => error!("Broadcast to {} failed: {}", external_id, e),
            }
        }

        info!(
            "Broadcast notification sent to {}/{} users",
            report.delivered, report.attempted
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbHandler;
    use crate::subscription::{PushSubscription, SubscriptionKeys};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Fails for endpoints containing "fail", reports "gone" ones as expired.
    #[derive(Default)]
    struct FakeSender {
        delivered: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl PushSender for FakeSender {
        async fn deliver(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
            if subscription.endpoint.contains("fail") {
                return Err(PushError::Delivery("503 Service Unavailable".to_string()));
            }
            if subscription.endpoint.contains("gone") {
                return Err(PushError::EndpointGone);
            }
            let payload = serde_json::from_slice(payload).unwrap();
            self.delivered.lock().await.push((subscription.endpoint.clone(), payload));
            Ok(())
        }
    }

    fn subscription(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.to_string(),
            keys: SubscriptionKeys { p256dh: "p256dh".to_string(), auth: "auth".to_string() },
        }
    }

    fn setup() -> (Dispatcher, Arc<DbHandler>, Arc<FakeSender>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("push-cms-dispatch-{}", uuid::Uuid::new_v4()));
        let db = Arc::new(DbHandler::open(&dir, 16 * 1024 * 1024).unwrap());
        let sender = Arc::new(FakeSender::default());
        let dispatcher = Dispatcher::new(db.clone(), sender.clone());
        (dispatcher, db, sender, dir)
    }

    #[tokio::test]
    async fn send_to_registered_id_delivers_json_payload() {
        let (dispatcher, db, sender, dir) = setup();
        db.register("device-1", &subscription("https://push.example.com/1")).unwrap();

        let outcome = dispatcher.send("device-1", "Hello", "World").await.unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);

        let delivered = sender.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, serde_json::json!({"title": "Hello", "content": "World"}));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn send_to_unknown_id_is_not_found() {
        let (dispatcher, _db, sender, dir) = setup();
        let outcome = dispatcher.send("nobody", "Hello", "World").await.unwrap();
        assert_eq!(outcome, SendOutcome::NotFound);
        assert!(sender.delivered.lock().await.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn broadcast_tolerates_individual_failures() {
        let (dispatcher, db, sender, dir) = setup();
        db.register("a", &subscription("https://push.example.com/a")).unwrap();
        db.register("b", &subscription("https://push.example.com/fail")).unwrap();
        db.register("c", &subscription("https://push.example.com/c")).unwrap();

        let report = dispatcher.broadcast("Hi", "all").await.unwrap();
        assert_eq!(report, BroadcastReport { attempted: 3, delivered: 2 });
        assert_eq!(sender.delivered.lock().await.len(), 2);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn gone_endpoint_is_removed() {
        let (dispatcher, db, _sender, dir) = setup();
        db.register("old", &subscription("https://push.example.com/gone")).unwrap();

        let outcome = dispatcher.send("old", "Hi", "there").await.unwrap();
        assert_eq!(outcome, SendOutcome::Failed);
        assert!(db.get("old").unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn broadcast_with_no_subscriptions() {
        let (dispatcher, _db, _sender, dir) = setup();
        let report = dispatcher.broadcast("Hi", "nobody").await.unwrap();
        assert_eq!(report, BroadcastReport { attempted: 0, delivered: 0 });
        let _ = std::fs::remove_dir_all(dir);
    }
}
