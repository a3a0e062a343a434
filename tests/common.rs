#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use push_cms_server::cms::backend::{AuthProvider, BackendError, ContentStore};
use push_cms_server::cms::models::{AuthenticatedUser, Caller, ContentItem, Identity, UserConfig};
use push_cms_server::cms::routes::CmsContext;
use push_cms_server::cms::session::{Session, SESSION_COOKIE};
use push_cms_server::config::Settings;
use push_cms_server::db::DbHandler;
use push_cms_server::http_server::PushContext;
use push_cms_server::notifications::Dispatcher;
use push_cms_server::subscription::{PushSubscription, SubscriptionStore};
use push_cms_server::web_push::{PushError, PushSender};

pub const SECRET_KEY: &str = "test-secret-key";
pub const JWT_SECRET: &str = "test-jwt-secret";
pub const BOT_JWT_SECRET: &str = "test-bot-secret";

pub fn bot_addr() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

pub fn outside_addr() -> SocketAddr {
    "203.0.113.9:40000".parse().unwrap()
}

pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("push-cms-test-{}", Uuid::new_v4()))
}

pub fn test_settings(overrides: &[(&str, &str)]) -> Settings {
    let db_path = temp_db_path();
    let db_path = db_path.to_string_lossy().to_string();
    let mut all: Vec<(&str, &str)> = vec![
        ("env", "testing"),
        ("db_path", db_path.as_str()),
        ("allowed_bot_ips", "127.0.0.1"),
        ("vapid_public_key", "test-public-key"),
        ("vapid_private_key", "test-private-key"),
        ("jwt_secret", JWT_SECRET),
        ("jwt_api_key", "test-api-key"),
        ("bot_jwt_secret", BOT_JWT_SECRET),
        ("secret_key", SECRET_KEY),
        ("public_base_url", "http://cms.test"),
    ];
    all.extend_from_slice(overrides);
    Settings::with_overrides(&all).expect("Failed to build test settings")
}

/// Records every delivery. Endpoints containing "fail" are refused and
/// endpoints containing "gone" are reported as expired.
#[derive(Default)]
pub struct RecordingSender {
    pub delivered: Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl PushSender for RecordingSender {
    async fn deliver(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        if subscription.endpoint.contains("fail") {
            return Err(PushError::Delivery("push service returned 500".to_string()));
        }
        if subscription.endpoint.contains("gone") {
            return Err(PushError::EndpointGone);
        }
        let payload = serde_json::from_slice(payload).expect("payload should be JSON");
        self.delivered.lock().await.push((subscription.endpoint.clone(), payload));
        Ok(())
    }
}

pub struct PushHarness {
    pub ctx: Arc<PushContext>,
    pub store: Arc<DbHandler>,
    pub sender: Arc<RecordingSender>,
}

pub fn push_harness(overrides: &[(&str, &str)]) -> PushHarness {
    let settings = test_settings(overrides);
    let store = Arc::new(DbHandler::new(&settings).expect("Failed to open test database"));
    let sender = Arc::new(RecordingSender::default());

    let ctx = Arc::new(PushContext {
        settings: Arc::new(settings),
        store: store.clone(),
        dispatcher: Dispatcher::new(store.clone(), sender.clone()),
    });

    PushHarness { ctx, store, sender }
}

pub fn subscription_json(endpoint: &str) -> serde_json::Value {
    serde_json::json!({
        "endpoint": endpoint,
        "keys": {
            "p256dh": "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM",
            "auth": "tBHItJI5svbpez7KI4CCXg",
        }
    })
}

pub fn register_directly(store: &DbHandler, external_id: &str, endpoint: &str) {
    let subscription: PushSubscription = serde_json::from_value(subscription_json(endpoint)).unwrap();
    store.register(external_id, &subscription).unwrap();
}

/// In-memory stand-in for the hosted identity service and tables.
///
/// Authorization codes of the form `code-<user>` log in `<user>`; any other
/// code is rejected.
#[derive(Default)]
pub struct MemoryBackend {
    pub configs: Mutex<HashMap<String, UserConfig>>,
    pub content: Mutex<Vec<ContentItem>>,
    pub verifiers: Mutex<Vec<String>>,
    pub config_inserts: AtomicUsize,
    pub content_inserts: AtomicUsize,
    pub sign_outs: AtomicUsize,
    /// When set, table calls fail the way an expired access token does.
    pub tokens_expired: AtomicBool,
}

impl MemoryBackend {
    fn check_token(&self) -> Result<(), BackendError> {
        if self.tokens_expired.load(Ordering::SeqCst) {
            return Err(BackendError::Status { status: 401, body: "JWT expired".to_string() });
        }
        Ok(())
    }

    pub async fn content_for(&self, user_id: &str) -> Vec<ContentItem> {
        self.content
            .lock()
            .await
            .iter()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect()
    }
}

pub fn test_user(user_id: &str) -> AuthenticatedUser {
    AuthenticatedUser {
        id: user_id.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        identities: vec![Identity {
            id: format!("google-{}", user_id),
            user_id: user_id.to_string(),
            provider: "google".to_string(),
            identity_data: serde_json::json!({ "email": format!("{}@example.com", user_id) }),
            created_at: None,
            updated_at: None,
        }],
        created_at: Some("2024-01-01T00:00:00Z".to_string()),
        access_token: format!("access-{}", user_id),
        expires_in: Some(3600),
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    fn authorize_url(
        &self,
        provider: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String, BackendError> {
        Ok(format!(
            "https://auth.test/authorize?provider={}&redirect_to={}&code_challenge={}",
            provider, redirect_to, code_challenge
        ))
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<AuthenticatedUser, BackendError> {
        self.verifiers.lock().await.push(verifier.to_string());
        match code.strip_prefix("code-") {
            Some(user_id) if !user_id.is_empty() => Ok(test_user(user_id)),
            _ => Err(BackendError::InvalidCode("invalid flow state".to_string())),
        }
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), BackendError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryBackend {
    async fn get_config(&self, caller: &Caller) -> Result<Option<UserConfig>, BackendError> {
        self.check_token()?;
        Ok(self.configs.lock().await.get(&caller.user_id).cloned())
    }

    async fn insert_config(&self, caller: &Caller, config: &UserConfig) -> Result<(), BackendError> {
        self.config_inserts.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().await.insert(caller.user_id.clone(), config.clone());
        Ok(())
    }

    async fn update_config(&self, caller: &Caller, config: &UserConfig) -> Result<(), BackendError> {
        if let Some(existing) = self.configs.lock().await.get_mut(&caller.user_id) {
            *existing = config.clone();
        }
        Ok(())
    }

    async fn list_content(&self, caller: &Caller) -> Result<Vec<ContentItem>, BackendError> {
        self.check_token()?;
        let mut items = self.content_for(&caller.user_id).await;
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(items)
    }

    async fn insert_content(&self, _caller: &Caller, item: &ContentItem) -> Result<Option<ContentItem>, BackendError> {
        self.content_inserts.fetch_add(1, Ordering::SeqCst);
        self.content.lock().await.push(item.clone());
        Ok(Some(item.clone()))
    }

    async fn update_content(
        &self,
        caller: &Caller,
        id: Uuid,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ContentItem>, BackendError> {
        let mut rows = self.content.lock().await;
        let row = rows
            .iter_mut()
            .find(|item| item.id == id && item.user_id == caller.user_id);
        Ok(row.map(|item| {
            item.content = content.to_string();
            item.timestamp = timestamp;
            item.clone()
        }))
    }

    async fn delete_content(&self, caller: &Caller, id: Uuid) -> Result<(), BackendError> {
        self.content
            .lock()
            .await
            .retain(|item| !(item.id == id && item.user_id == caller.user_id));
        Ok(())
    }
}

pub struct CmsHarness {
    pub ctx: Arc<CmsContext>,
    pub backend: Arc<MemoryBackend>,
}

pub fn cms_harness() -> CmsHarness {
    let backend = Arc::new(MemoryBackend::default());
    let ctx = Arc::new(CmsContext {
        settings: Arc::new(test_settings(&[])),
        auth: backend.clone(),
        store: backend.clone(),
    });
    CmsHarness { ctx, backend }
}

/// `Cookie` header value for a logged-in session of `user_id`.
pub fn session_header(user_id: &str) -> String {
    let token = Session::from_user(test_user(user_id), 3600)
        .encode(SECRET_KEY)
        .expect("Failed to encode session");
    format!("{}={}", SESSION_COOKIE, token)
}

pub fn form_body(fields: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
}

pub fn json_body(response: &warp::http::Response<warp::hyper::body::Bytes>) -> serde_json::Value {
    serde_json::from_slice(response.body()).expect("Response body should be JSON")
}
