use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum distance between a bot request's timestamp and the server clock.
pub const TIMESTAMP_WINDOW_MS: i64 = 5 * 60 * 1000;
const BOT_TOKEN_LIFETIME_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotRejection {
    UnauthorizedIp,
    InvalidTimestamp,
    InvalidToken,
}

impl BotRejection {
    pub fn message(&self) -> &'static str {
        match self {
            BotRejection::UnauthorizedIp => "Unauthorized IP address",
            BotRejection::InvalidTimestamp => "Invalid or expired timestamp",
            BotRejection::InvalidToken => "Invalid bot token",
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Either user_email or user_external_id must be provided")]
    MissingIdentifier,
    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("system clock error")]
    Clock,
}

/// Plain string-prefix match, not CIDR-aware: `10.0.0.1` also admits `10.0.0.15`.
pub fn validate_ip_prefix(ip: &str, allowed_prefix: &str) -> bool {
    if ip.is_empty() || allowed_prefix.is_empty() {
        return false;
    }
    ip.starts_with(allowed_prefix)
}

/// Accepts timestamps strictly less than five minutes away from `now_ms`,
/// in either direction.
pub fn validate_timestamp(timestamp_ms: i64, now_ms: i64) -> bool {
    if timestamp_ms < 0 {
        error!("Invalid timestamp: {}", timestamp_ms);
        return false;
    }
    let age = (now_ms as i128 - timestamp_ms as i128).abs();
    age < TIMESTAMP_WINDOW_MS as i128
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn now_secs() -> Result<u64, TokenError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TokenError::Clock)
}

/// First `X-Forwarded-For` hop when present, otherwise the peer address.
pub fn client_ip(forwarded_for: Option<&str>, remote: Option<SocketAddr>) -> String {
    if let Some(first) = forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }
    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BotClaims {
    pub bot_id: String,
    pub iat: u64,
    pub exp: u64,
}

pub fn issue_bot_jwt(bot_id: &str, secret: &str) -> Result<String, TokenError> {
    let iat = now_secs()?;
    let claims = BotClaims {
        bot_id: bot_id.to_string(),
        iat,
        exp: iat + BOT_TOKEN_LIFETIME_SECS,
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

pub fn validate_bot_jwt(token: &str, secret: &str) -> Result<BotClaims, TokenError> {
    let data = decode::<BotClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserClaims {
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_external_id: Option<String>,
}

/// Token a browser client presents to the notification inbox service.
pub fn issue_user_jwt(
    user_email: Option<&str>,
    user_external_id: Option<&str>,
    api_key: &str,
    secret: &str,
) -> Result<String, TokenError> {
    let user_email = user_email.filter(|s| !s.is_empty());
    let user_external_id = user_external_id.filter(|s| !s.is_empty());
    if user_email.is_none() && user_external_id.is_none() {
        return Err(TokenError::MissingIdentifier);
    }

    let claims = UserClaims {
        api_key: api_key.to_string(),
        user_email: user_email.map(str::to_string),
        user_external_id: user_external_id.map(str::to_string),
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

/// Inputs of the bot checks, gathered by the route filter.
pub struct BotRequestContext<'a> {
    pub client_ip: &'a str,
    pub timestamp_ms: i64,
    pub authorization: Option<&'a str>,
}

pub struct BotPolicy<'a> {
    pub allowed_prefix: &'a str,
    pub require_jwt: bool,
    pub jwt_secret: &'a str,
}

/// IP prefix, then timestamp window, then (when required) the bearer token.
pub fn check_bot_request(
    request: &BotRequestContext<'_>,
    policy: &BotPolicy<'_>,
    now_ms: i64,
) -> Result<(), BotRejection> {
    if !validate_ip_prefix(request.client_ip, policy.allowed_prefix) {
        warn!("Unauthorized IP attempt: {}", request.client_ip);
        return Err(BotRejection::UnauthorizedIp);
    }

    if !validate_timestamp(request.timestamp_ms, now_ms) {
        warn!("Invalid timestamp: {}", request.timestamp_ms);
        return Err(BotRejection::InvalidTimestamp);
    }

    if policy.require_jwt {
        let token = bearer_token(request.authorization).ok_or(BotRejection::InvalidToken)?;
        if let Err(e) = validate_bot_jwt(token, policy.jwt_secret) {
            warn!("Rejected bot token: {}", e);
            return Err(BotRejection::InvalidToken);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_737_302_400_000;

    #[test]
    fn ip_prefix_matches() {
        assert!(validate_ip_prefix("192.168.12.100", "192.168.12."));
        assert!(!validate_ip_prefix("192.168.13.100", "192.168.12."));
        assert!(!validate_ip_prefix("", "192.168.12."));
        assert!(!validate_ip_prefix("192.168.12.100", ""));
        assert!(!validate_ip_prefix("", ""));
    }

    #[test]
    fn ip_prefix_is_not_cidr_aware() {
        assert!(validate_ip_prefix("10.0.0.15", "10.0.0.1"));
        assert!(!validate_ip_prefix("10.0.1.1", "10.0.0.0"));
    }

    #[test]
    fn timestamp_window() {
        assert!(validate_timestamp(NOW, NOW));
        assert!(validate_timestamp(NOW - TIMESTAMP_WINDOW_MS + 1, NOW));
        assert!(validate_timestamp(NOW + TIMESTAMP_WINDOW_MS - 1, NOW));
        assert!(!validate_timestamp(NOW - TIMESTAMP_WINDOW_MS, NOW));
        assert!(!validate_timestamp(NOW + TIMESTAMP_WINDOW_MS, NOW));
        assert!(!validate_timestamp(NOW - 10 * 60 * 1000, NOW));
        assert!(!validate_timestamp(NOW + 10 * 60 * 1000, NOW));
    }

    #[test]
    fn malformed_timestamps_fail_closed() {
        assert!(!validate_timestamp(-1, NOW));
        assert!(!validate_timestamp(i64::MIN, NOW));
        assert!(!validate_timestamp(i64::MAX, NOW));
        assert!(!validate_timestamp(0, NOW));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let remote: SocketAddr = "10.1.1.1:4000".parse().unwrap();
        assert_eq!(client_ip(Some("192.168.12.5, 10.0.0.1"), Some(remote)), "192.168.12.5");
        assert_eq!(client_ip(Some("  "), Some(remote)), "10.1.1.1");
        assert_eq!(client_ip(None, Some(remote)), "10.1.1.1");
        assert_eq!(client_ip(None, None), "");
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[test]
    fn bot_jwt_validates_with_same_secret_only() {
        let token = issue_bot_jwt("bot_001", "bot-secret").unwrap();
        let claims = validate_bot_jwt(&token, "bot-secret").unwrap();
        assert_eq!(claims.bot_id, "bot_001");
        assert_eq!(claims.exp - claims.iat, BOT_TOKEN_LIFETIME_SECS);
        assert!(validate_bot_jwt(&token, "other-secret").is_err());
        assert!(validate_bot_jwt("not-a-token", "bot-secret").is_err());
    }

    #[test]
    fn user_jwt_requires_an_identifier() {
        assert!(matches!(
            issue_user_jwt(None, None, "key", "secret"),
            Err(TokenError::MissingIdentifier)
        ));
        assert!(matches!(
            issue_user_jwt(Some(""), Some(""), "key", "secret"),
            Err(TokenError::MissingIdentifier)
        ));
        assert!(!issue_user_jwt(Some("test@example.com"), None, "key", "secret").unwrap().is_empty());
        assert!(!issue_user_jwt(None, Some("usr_test123"), "key", "secret").unwrap().is_empty());
    }

    #[test]
    fn user_jwt_carries_identifiers() {
        let token = issue_user_jwt(Some("test@example.com"), Some("usr_test123"), "key", "secret").unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let claims = decode::<UserClaims>(&token, &DecodingKey::from_secret(b"secret"), &validation)
            .unwrap()
            .claims;
        assert_eq!(claims.api_key, "key");
        assert_eq!(claims.user_email.as_deref(), Some("test@example.com"));
        assert_eq!(claims.user_external_id.as_deref(), Some("usr_test123"));
    }

    #[test]
    fn bot_checks_run_in_order() {
        let policy = BotPolicy { allowed_prefix: "192.168.12.", require_jwt: false, jwt_secret: "s" };

        let bad_ip = BotRequestContext { client_ip: "10.0.0.1", timestamp_ms: 0, authorization: None };
        assert_eq!(check_bot_request(&bad_ip, &policy, NOW), Err(BotRejection::UnauthorizedIp));

        let stale = BotRequestContext { client_ip: "192.168.12.7", timestamp_ms: 0, authorization: None };
        assert_eq!(check_bot_request(&stale, &policy, NOW), Err(BotRejection::InvalidTimestamp));

        let fresh = BotRequestContext { client_ip: "192.168.12.7", timestamp_ms: NOW, authorization: None };
        assert_eq!(check_bot_request(&fresh, &policy, NOW), Ok(()));
    }

    #[test]
    fn bot_token_checked_only_when_required() {
        let policy = BotPolicy { allowed_prefix: "192.168.12.", require_jwt: true, jwt_secret: "s" };
        let now = now_millis();

        let missing = BotRequestContext { client_ip: "192.168.12.7", timestamp_ms: now, authorization: None };
        assert_eq!(check_bot_request(&missing, &policy, now), Err(BotRejection::InvalidToken));

        let header = format!("Bearer {}", issue_bot_jwt("bot_001", "s").unwrap());
        let valid = BotRequestContext { client_ip: "192.168.12.7", timestamp_ms: now, authorization: Some(&header) };
        assert_eq!(check_bot_request(&valid, &policy, now), Ok(()));
    }
}
