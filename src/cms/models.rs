use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVICTION_METHODS: [&str; 3] = ["fifo", "lifo", "lru"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub method: String,
    pub enabled: bool,
    pub limit: i64,
}

/// Per-user dashboard settings: which columns to show and how the client-side
/// cache evicts entries.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub headers: Vec<String>,
    pub eviction: Eviction,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            headers: vec!["timestamp".to_string(), "id".to_string(), "content".to_string()],
            eviction: Eviction {
                method: "fifo".to_string(),
                enabled: true,
                limit: 10,
            },
        }
    }
}

impl UserConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.headers.is_empty() || self.headers.iter().any(|h| h.trim().is_empty()) {
            return Err("headers must be a non-empty list of column names".to_string());
        }
        if !EVICTION_METHODS.contains(&self.eviction.method.as_str()) {
            return Err(format!(
                "eviction method must be one of {}",
                EVICTION_METHODS.join(", ")
            ));
        }
        if self.eviction.limit <= 0 {
            return Err("eviction limit must be a positive integer".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

impl ContentItem {
    pub fn new(user_id: &str, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        ContentItem {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            timestamp,
            content: content.into(),
        }
    }
}

/// Linked login provider as reported by the identity service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Identity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub provider: String,
    #[serde(default)]
    pub identity_data: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: Option<String>,
    pub identities: Vec<Identity>,
    pub created_at: Option<String>,
    pub access_token: String,
    /// Seconds until `access_token` expires, when the identity service says.
    pub expires_in: Option<u64>,
}

/// Owner scope for every store call: the row owner and the token the hosted
/// backend uses to enforce row-level security.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub access_token: String,
}
