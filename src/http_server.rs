use warp::{Filter, Reply, Rejection};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use log::{info, debug};
use serde::{Deserialize, Deserializer};

use crate::auth::{
    check_bot_request, client_ip, issue_user_jwt, now_millis, BotPolicy, BotRejection,
    BotRequestContext, TokenError,
};
use crate::config::Settings;
use crate::errors::{ApiRejection, ErrorKind};
use crate::notifications::{Dispatcher, SendOutcome};
use crate::subscription::{PushSubscription, SubscriptionStore};

pub struct PushContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn SubscriptionStore>,
    pub dispatcher: Dispatcher,
}

#[derive(Debug, Deserialize)]
pub struct BotNotificationRequest {
    pub bot_id: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "timestamp", alias = "timestamp_ms", deserialize_with = "deserialize_timestamp")]
    pub timestamp_ms: i64,
    #[serde(default)]
    pub recipient_external_id: Option<String>,
}

/// Integer or float milliseconds; floats are truncated.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = serde_json::Number::deserialize(deserializer)
        .map_err(|_| serde::de::Error::custom("timestamp must be an integer or float"))?;
    if let Some(ms) = number.as_i64() {
        Ok(ms)
    } else if let Some(ms) = number.as_f64() {
        Ok(ms as i64)
    } else {
        Err(serde::de::Error::custom("timestamp must be an integer or float"))
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    subscription: Option<serde_json::Value>,
    #[serde(default)]
    user_external_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestNotificationRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    user_external_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwtQuery {
    user_email: Option<String>,
    user_external_id: Option<String>,
}

fn with_ctx(ctx: Arc<PushContext>) -> impl Filter<Extract = (Arc<PushContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Parses the bot request and runs the bot checks against it.
fn bot_guard(ctx: Arc<PushContext>) -> impl Filter<Extract = (BotNotificationRequest,), Error = Rejection> + Clone {
    warp::body::json::<BotNotificationRequest>()
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_ctx(ctx))
        .and_then(|request: BotNotificationRequest,
                   forwarded_for: Option<String>,
                   remote: Option<SocketAddr>,
                   authorization: Option<String>,
                   ctx: Arc<PushContext>| async move {
            let ip = client_ip(forwarded_for.as_deref(), remote);
            let policy = BotPolicy {
                allowed_prefix: &ctx.settings.allowed_bot_ips,
                require_jwt: ctx.settings.require_bot_jwt,
                jwt_secret: &ctx.settings.bot_jwt_secret,
            };
            let context = BotRequestContext {
                client_ip: &ip,
                timestamp_ms: request.timestamp_ms,
                authorization: authorization.as_deref(),
            };

            match check_bot_request(&context, &policy, now_millis()) {
                Ok(()) => Ok(request),
                Err(rejection @ BotRejection::InvalidToken) => {
                    Err(ApiRejection::unauthenticated(rejection.message()))
                }
                Err(rejection) => Err(ApiRejection::forbidden(rejection.message())),
            }
        })
}

pub fn routes(ctx: Arc<PushContext>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let config = warp::path!("api" / "config")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_config);

    let send_notification = warp::path!("api" / "send-notification")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(bot_guard(ctx.clone()))
        .and_then(handle_send_notification);

    let register = warp::path!("api" / "register-push-subscription")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(warp::body::json())
        .and_then(handle_register_subscription);

    let test_notification = warp::path!("api" / "test-notification")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(warp::body::json())
        .and_then(handle_test_notification);

    let health = warp::path!("api" / "health")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_health);

    let jwt = warp::path!("api" / "jwt")
        .and(warp::get())
        .and(with_ctx(ctx))
        .and(warp::query::<JwtQuery>())
        .and_then(handle_jwt);

    config
        .or(send_notification)
        .or(register)
        .or(test_notification)
        .or(health)
        .or(jwt)
        .recover(crate::errors::handle_rejection)
}

pub async fn run_http_server(
    ctx: Arc<PushContext>,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let host = ctx.settings.hostname.clone();
    let port = ctx.settings.push_port;
    serve_routes("Push relay", routes(ctx), &host, port, &["GET", "POST", "OPTIONS"], shutdown_flag).await
}

/// Binds `routes` with the access log and CORS, and serves until the flag is set.
pub(crate) async fn serve_routes<F, R>(
    name: &'static str,
    routes: F,
    hostname: &str,
    port: u16,
    methods: &[&'static str],
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Filter<Extract = (R,), Error = Infallible> + Clone + Send + Sync + 'static,
    R: Reply + 'static,
{
    let host: IpAddr = hostname.parse()?;
    info!("Starting {} on port {}", name, port);

    let log = warp::log::custom(|info| {
        info!("{} {} {} {}ms - {}",
            info.method(),
            info.path(),
            info.status(),
            info.elapsed().as_millis(),
            info.remote_addr()
                .map_or("unknown".to_string(), |addr| addr.ip().to_string())
        );
    });

    let routes = routes
        .with(log)
        .with(warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["content-type", "authorization"])
            .allow_methods(methods.iter().copied()));

    let (addr, server) = warp::serve(routes)
        .bind_with_graceful_shutdown(
            (host, port),
            shutdown_signal(shutdown_flag)
        );

    info!("{} running on http://{}", name, addr);
    server.await;
    info!("{} shutdown complete", name);

    Ok(())
}

async fn handle_config(ctx: Arc<PushContext>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "success": true,
        "vapid_public_key": ctx.settings.vapid_public_key,
    })))
}

/// Sends to one recipient when given, otherwise broadcasts.
async fn dispatch(
    ctx: &PushContext,
    recipient: Option<&str>,
    title: &str,
    content: &str,
) -> Result<warp::reply::Json, Rejection> {
    match recipient.filter(|id| !id.is_empty()) {
        Some(recipient) => {
            let outcome = ctx.dispatcher
                .send(recipient, title, content)
                .await
                .map_err(ApiRejection::upstream)?;

            match outcome {
                SendOutcome::Delivered => Ok(warp::reply::json(&serde_json::json!({
                    "success": true,
                    "message": "Notification sent successfully",
                }))),
                SendOutcome::NotFound => Err(ApiRejection::not_found(format!(
                    "No subscription found for user: {}", recipient
                ))),
                SendOutcome::Failed => Err(ApiRejection::new(
                    ErrorKind::Upstream,
                    "Failed to send notification",
                )),
            }
        }
        None => {
            let report = ctx.dispatcher
                .broadcast(title, content)
                .await
                .map_err(ApiRejection::upstream)?;

            Ok(warp::reply::json(&serde_json::json!({
                "success": true,
                "message": "Notification sent successfully",
                "attempted": report.attempted,
                "delivered": report.delivered,
            })))
        }
    }
}

async fn handle_send_notification(
    ctx: Arc<PushContext>,
    request: BotNotificationRequest,
) -> Result<impl Reply, Rejection> {
    debug!("Bot {} requested notification: {}", request.bot_id, request.title);

    let reply = dispatch(
        &ctx,
        request.recipient_external_id.as_deref(),
        &request.title,
        &request.content,
    ).await?;

    info!(
        "Notification from bot {} to {}: {}",
        request.bot_id,
        request.recipient_external_id.as_deref().unwrap_or("all users"),
        request.title
    );
    Ok(reply)
}

async fn handle_register_subscription(
    ctx: Arc<PushContext>,
    request: RegisterRequest,
) -> Result<impl Reply, Rejection> {
    let (Some(subscription), Some(external_id)) = (
        request.subscription.filter(|s| !s.is_null()),
        request.user_external_id.filter(|id| !id.is_empty()),
    ) else {
        return Err(ApiRejection::validation("Missing subscription or user_external_id"));
    };

    let subscription: PushSubscription = serde_json::from_value(subscription)
        .map_err(|e| ApiRejection::validation(format!("Invalid subscription: {}", e)))?;
    if !subscription.is_complete() {
        return Err(ApiRejection::validation("Invalid subscription: endpoint and keys are required"));
    }

    ctx.store
        .register(&external_id, &subscription)
        .map_err(ApiRejection::upstream)?;

    info!("Push subscription registered for {}", external_id);
    Ok(warp::reply::json(&serde_json::json!({
        "success": true,
        "message": "Subscription registered successfully",
    })))
}

async fn handle_test_notification(
    ctx: Arc<PushContext>,
    request: TestNotificationRequest,
) -> Result<impl Reply, Rejection> {
    let title = request.title.unwrap_or_else(|| "Test Notification".to_string());
    let content = request.content.unwrap_or_else(|| "This is a test notification".to_string());

    let reply = dispatch(&ctx, request.user_external_id.as_deref(), &title, &content).await?;
    info!("Test notification sent: {}", title);
    Ok(reply)
}

async fn handle_health(ctx: Arc<PushContext>) -> Result<impl Reply, Rejection> {
    let subscriptions = ctx.store
        .count()
        .map_err(|e| log::error!("Failed to count subscriptions: {}", e))
        .ok();

    Ok(warp::reply::json(&serde_json::json!({
        "status": "healthy",
        "service": "push-relay",
        "subscriptions": subscriptions,
    })))
}

async fn handle_jwt(ctx: Arc<PushContext>, query: JwtQuery) -> Result<impl Reply, Rejection> {
    let token = issue_user_jwt(
        query.user_email.as_deref(),
        query.user_external_id.as_deref(),
        &ctx.settings.jwt_api_key,
        &ctx.settings.jwt_secret,
    ).map_err(|e| match e {
        TokenError::MissingIdentifier => {
            log::error!("JWT generation error: {}", e);
            ApiRejection::validation(e.to_string())
        }
        other => ApiRejection::upstream(other),
    })?;

    Ok(warp::reply::json(&serde_json::json!({
        "success": true,
        "token": token,
        "api_key": ctx.settings.jwt_api_key,
        "vapid_public_key": ctx.settings.vapid_public_key,
    })))
}

async fn shutdown_signal(shutdown_flag: Arc<AtomicBool>) {
    while !shutdown_flag.load(Ordering::Relaxed) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
