use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::cms::backend::{AuthProvider, BackendError, ContentStore};
use crate::cms::models::{AuthenticatedUser, Caller, ContentItem, Identity, UserConfig};
use crate::config::Settings;

const CONFIG_TABLE: &str = "user_configs";
const CONTENT_TABLE: &str = "user_content";

/// Client for a Supabase project: GoTrue under `/auth/v1`, PostgREST under
/// `/rest/v1`. Table calls carry the user's access token so row-level
/// security applies on top of the explicit `user_id` filters.
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ConfigRow {
    config: UserConfig,
}

#[derive(Deserialize)]
struct RemoteUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    identities: Option<Vec<Identity>>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    user: RemoteUser,
}

impl SupabaseClient {
    pub fn new(settings: &Settings) -> Result<Self, BackendError> {
        Self::with_endpoint(
            &settings.supabase_url,
            &settings.supabase_key,
            Duration::from_secs(settings.backend_timeout_secs),
        )
    }

    pub fn with_endpoint(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, BackendError> {
        if base_url.is_empty() || api_key.is_empty() {
            return Err(BackendError::Config(
                "missing Supabase credentials, set PCS_SUPABASE_URL and PCS_SUPABASE_KEY".to_string(),
            ));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn scoped(&self, builder: RequestBuilder, caller: &Caller) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&caller.access_token)
    }

    async fn checked(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status { status: status.as_u16(), body })
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

#[async_trait]
impl AuthProvider for SupabaseClient {
    fn authorize_url(
        &self,
        provider: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String, BackendError> {
        let url = Url::parse_with_params(
            &self.auth_endpoint("authorize"),
            &[
                ("provider", provider),
                ("redirect_to", redirect_to),
                ("code_challenge", code_challenge),
                ("code_challenge_method", "plain"),
            ],
        ).map_err(|e| BackendError::Config(e.to_string()))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<AuthenticatedUser, BackendError> {
        let response = self.http
            .post(self.auth_endpoint("token"))
            .query(&[("grant_type", "pkce")])
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({
                "auth_code": code,
                "code_verifier": verifier,
            }))
            .send()
            .await?;

        let response = match Self::checked(response).await {
            Ok(response) => response,
            Err(BackendError::Status { status, body }) if (400..500).contains(&status) => {
                return Err(BackendError::InvalidCode(body));
            }
            Err(e) => return Err(e),
        };

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        debug!("Exchanged authorization code for user {}", token.user.id);

        Ok(AuthenticatedUser {
            id: token.user.id,
            email: token.user.email,
            identities: token.user.identities.unwrap_or_default(),
            created_at: token.user.created_at,
            access_token: token.access_token,
            expires_in: token.expires_in,
        })
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let response = self.http
            .post(self.auth_endpoint("logout"))
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for SupabaseClient {
    async fn get_config(&self, caller: &Caller) -> Result<Option<UserConfig>, BackendError> {
        let request = self.http
            .get(self.rest_url(CONFIG_TABLE))
            .query(&[("select", "config".to_string()), ("user_id", eq(&caller.user_id))]);
        let response = Self::checked(self.scoped(request, caller).send().await?).await?;

        let rows: Vec<ConfigRow> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(rows.into_iter().next().map(|row| row.config))
    }

    async fn insert_config(&self, caller: &Caller, config: &UserConfig) -> Result<(), BackendError> {
        let request = self.http
            .post(self.rest_url(CONFIG_TABLE))
            .json(&serde_json::json!({
                "user_id": caller.user_id,
                "config": config,
            }));
        Self::checked(self.scoped(request, caller).send().await?).await?;
        Ok(())
    }

    async fn update_config(&self, caller: &Caller, config: &UserConfig) -> Result<(), BackendError> {
        let request = self.http
            .patch(self.rest_url(CONFIG_TABLE))
            .query(&[("user_id", eq(&caller.user_id))])
            .json(&serde_json::json!({ "config": config }));
        Self::checked(self.scoped(request, caller).send().await?).await?;
        Ok(())
    }

    async fn list_content(&self, caller: &Caller) -> Result<Vec<ContentItem>, BackendError> {
        let request = self.http
            .get(self.rest_url(CONTENT_TABLE))
            .query(&[
                ("select", "*".to_string()),
                ("user_id", eq(&caller.user_id)),
                ("order", "timestamp.desc".to_string()),
            ]);
        let response = Self::checked(self.scoped(request, caller).send().await?).await?;

        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn insert_content(&self, caller: &Caller, item: &ContentItem) -> Result<Option<ContentItem>, BackendError> {
        let request = self.http
            .post(self.rest_url(CONTENT_TABLE))
            .header("Prefer", "return=representation")
            .json(item);
        let response = Self::checked(self.scoped(request, caller).send().await?).await?;

        let rows: Vec<ContentItem> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn update_content(
        &self,
        caller: &Caller,
        id: Uuid,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ContentItem>, BackendError> {
        let request = self.http
            .patch(self.rest_url(CONTENT_TABLE))
            .query(&[("id", eq(id)), ("user_id", eq(&caller.user_id))])
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "content": content,
                "timestamp": timestamp,
            }));
        let response = Self::checked(self.scoped(request, caller).send().await?).await?;

        let rows: Vec<ContentItem> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn delete_content(&self, caller: &Caller, id: Uuid) -> Result<(), BackendError> {
        let request = self.http
            .delete(self.rest_url(CONTENT_TABLE))
            .query(&[("id", eq(id)), ("user_id", eq(&caller.user_id))]);
        Self::checked(self.scoped(request, caller).send().await?).await?;
        Ok(())
    }
}
