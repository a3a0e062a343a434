use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::TokenError;
use crate::cms::models::{AuthenticatedUser, Caller, Identity};

pub const SESSION_COOKIE: &str = "session";
pub const PKCE_COOKIE: &str = "pkce_verifier";

/// Logged-in user, carried in a signed cookie. Decoding checks the signature,
/// the expiry and that the user id is present.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Session {
    #[serde(rename = "sub")]
    pub user_id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub created_at: Option<String>,
    pub access_token: String,
    pub exp: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Session {
    /// Lives `ttl_secs`, or less when the access token expires sooner.
    pub fn from_user(user: AuthenticatedUser, ttl_secs: u64) -> Self {
        let ttl_secs = user.expires_in.map_or(ttl_secs, |upstream| upstream.min(ttl_secs));
        let now = now_secs();

        Session {
            user_id: user.id,
            email: user.email,
            identities: user.identities,
            created_at: user.created_at,
            access_token: user.access_token,
            exp: now + ttl_secs,
        }
    }

    /// Seconds left before `exp`, for the cookie `Max-Age`.
    pub fn max_age(&self) -> u64 {
        self.exp.saturating_sub(now_secs())
    }

    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.user_id.clone(),
            access_token: self.access_token.clone(),
        }
    }

    /// The session as shown to the user, without the access token.
    pub fn public_user(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.user_id,
            "email": self.email,
            "identities": self.identities,
            "created_at": self.created_at,
        })
    }

    pub fn encode(&self, secret: &str) -> Result<String, TokenError> {
        Ok(encode(&Header::default(), self, &EncodingKey::from_secret(secret.as_bytes()))?)
    }

    pub fn decode(token: &str, secret: &str) -> Result<Self, TokenError> {
        let session = decode::<Session>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )?.claims;

        if session.user_id.is_empty() {
            return Err(TokenError::Jwt(jsonwebtoken::errors::ErrorKind::InvalidSubject.into()));
        }
        Ok(session)
    }
}

pub fn session_cookie(token: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn verifier_cookie(verifier: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/auth/callback; HttpOnly; SameSite=Lax; Max-Age=600",
        PKCE_COOKIE, verifier
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn expired_cookie(name: &str, path: &str) -> String {
    format!("{}=; Path={}; HttpOnly; Max-Age=0", name, path)
}
