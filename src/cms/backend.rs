use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::cms::models::{AuthenticatedUser, Caller, ContentItem, UserConfig};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("authorization code rejected: {0}")]
    InvalidCode(String),
    #[error("backend misconfigured: {0}")]
    Config(String),
}

/// OAuth login delegated to the hosted identity service.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn authorize_url(
        &self,
        provider: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String, BackendError>;

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<AuthenticatedUser, BackendError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError>;
}

/// Rows of `user_configs` and `user_content`, always scoped to the caller.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_config(&self, caller: &Caller) -> Result<Option<UserConfig>, BackendError>;

    async fn insert_config(&self, caller: &Caller, config: &UserConfig) -> Result<(), BackendError>;

    async fn update_config(&self, caller: &Caller, config: &UserConfig) -> Result<(), BackendError>;

    /// Newest first.
    async fn list_content(&self, caller: &Caller) -> Result<Vec<ContentItem>, BackendError>;

    async fn insert_content(&self, caller: &Caller, item: &ContentItem) -> Result<Option<ContentItem>, BackendError>;

    async fn update_content(
        &self,
        caller: &Caller,
        id: Uuid,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ContentItem>, BackendError>;

    async fn delete_content(&self, caller: &Caller, id: Uuid) -> Result<(), BackendError>;
}
