use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use uuid::Uuid;
use warp::http::{header, Response, StatusCode};
use warp::hyper::body::Bytes;
use warp::hyper::Body;
use warp::{Filter, Rejection, Reply};

use crate::cms::backend::{AuthProvider, BackendError, ContentStore};
use crate::cms::bootstrap::bootstrap_user;
use crate::cms::models::{ContentItem, UserConfig};
use crate::cms::session::{
    expired_cookie, session_cookie, verifier_cookie, Session, PKCE_COOKIE, SESSION_COOKIE,
};
use crate::config::Settings;
use crate::errors::{clean_error_message, success, success_message, ApiRejection, ErrorKind};
use crate::http_server::serve_routes;

pub const LOGIN_PROVIDERS: [&str; 2] = ["google", "claremont"];

pub struct CmsContext {
    pub settings: Arc<Settings>,
    pub auth: Arc<dyn AuthProvider>,
    pub store: Arc<dyn ContentStore>,
}

#[derive(Debug, Deserialize, Default)]
struct ContentBody {
    #[serde(default)]
    content: Option<String>,
}

fn with_ctx(ctx: Arc<CmsContext>) -> impl Filter<Extract = (Arc<CmsContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Rejects with 401 unless the request carries a valid session cookie.
fn with_session(ctx: Arc<CmsContext>) -> impl Filter<Extract = (Session,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
        .and(with_ctx(ctx))
        .and_then(|cookie: Option<String>, ctx: Arc<CmsContext>| async move {
            let Some(token) = cookie.filter(|c| !c.is_empty()) else {
                return Err(ApiRejection::unauthenticated("Not authenticated"));
            };
            Session::decode(&token, &ctx.settings.secret_key).map_err(|e| {
                debug!("Rejected session cookie: {}", e);
                ApiRejection::unauthenticated("Session expired or invalid")
            })
        })
}

fn redirect(location: &str, cookies: &[String]) -> Result<Response<Body>, Rejection> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location);
    for cookie in cookies {
        builder = builder.header(header::SET_COOKIE, cookie.as_str());
    }
    builder.body(Body::empty()).map_err(ApiRejection::upstream)
}

/// A 401 from the hosted backend means the access token behind the session
/// has expired or been revoked.
fn upstream(e: BackendError) -> Rejection {
    match e {
        BackendError::Status { status: 401, body } => {
            info!("Hosted backend refused session token: {}", body);
            ApiRejection::unauthenticated("Session expired or invalid")
        }
        other => ApiRejection::upstream(other),
    }
}

/// Same envelope as the push relay, and drops the session cookie on 401.
async fn handle_cms_rejection(err: Rejection) -> Result<Box<dyn Reply>, Infallible> {
    let clear_session = matches!(
        err.find::<ApiRejection>(),
        Some(e) if e.kind == ErrorKind::Unauthenticated
    );
    let reply = crate::errors::handle_rejection(err).await?;

    if clear_session {
        Ok(Box::new(warp::reply::with_header(
            reply,
            header::SET_COOKIE,
            expired_cookie(SESSION_COOKIE, "/"),
        )))
    } else {
        Ok(Box::new(reply))
    }
}

pub fn routes(ctx: Arc<CmsContext>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let session = with_session(ctx.clone());

    let login = warp::path!("login")
        .and(warp::get())
        .and_then(handle_login_page);

    let login_google = warp::path!("login" / "google")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(warp::header::optional::<String>("host"))
        .and_then(handle_login_google);

    let login_claremont = warp::path!("login" / "claremont")
        .and(warp::get())
        .and_then(handle_login_claremont);

    let callback = warp::path!("auth" / "callback")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::cookie::optional::<String>(PKCE_COOKIE))
        .and_then(handle_callback);

    let logout = warp::path!("logout")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and_then(handle_logout);

    let dashboard = warp::path::end()
        .or(warp::path!("dashboard"))
        .unify()
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and_then(handle_dashboard);

    let list_content = warp::path!("api" / "content")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and_then(handle_list_content);

    let add_content = warp::path!("api" / "content")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and(warp::body::json())
        .and_then(handle_add_content);

    let update_content = warp::path!("api" / "content" / Uuid)
        .and(warp::put())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and(warp::body::json())
        .and_then(handle_update_content);

    let delete_content = warp::path!("api" / "content" / Uuid)
        .and(warp::delete())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and_then(handle_delete_content);

    let get_config = warp::path!("api" / "config")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and_then(handle_get_config);

    let dummy = warp::path!("api" / "dummy")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and(warp::body::bytes())
        .and_then(handle_dummy);

    let profile = warp::path!("profile")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and_then(handle_profile);

    let update_config = warp::path!("profile" / "config" / "update")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(session.clone())
        .and(warp::body::form::<HashMap<String, String>>())
        .and_then(handle_update_config);

    let link_account = warp::path!("profile" / "link-account")
        .and(warp::get())
        .and(session.clone())
        .and_then(handle_link_account);

    let link_manual = warp::path!("profile" / "link" / "manual")
        .and(warp::post())
        .and(session)
        .and(warp::body::form::<HashMap<String, String>>())
        .and_then(handle_link_manual);

    let auth_routes = login
        .or(login_google)
        .or(login_claremont)
        .or(callback)
        .or(logout);

    let api_routes = list_content
        .or(add_content)
        .or(update_content)
        .or(delete_content)
        .or(get_config)
        .or(dummy);

    let profile_routes = profile
        .or(update_config)
        .or(link_account)
        .or(link_manual);

    auth_routes
        .or(dashboard)
        .or(api_routes)
        .or(profile_routes)
        .recover(handle_cms_rejection)
}

pub async fn run_cms_server(
    ctx: Arc<CmsContext>,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let host = ctx.settings.hostname.clone();
    let port = ctx.settings.cms_port;
    serve_routes(
        "CMS service",
        routes(ctx),
        &host,
        port,
        &["GET", "POST", "PUT", "DELETE", "OPTIONS"],
        shutdown_flag,
    ).await
}

async fn handle_login_page() -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "success": true,
        "providers": LOGIN_PROVIDERS,
    })))
}

async fn handle_login_google(
    ctx: Arc<CmsContext>,
    host: Option<String>,
) -> Result<impl Reply, Rejection> {
    let base_url = if ctx.settings.public_base_url.is_empty() {
        let host = host.ok_or_else(|| ApiRejection::validation("Missing Host header"))?;
        format!("http://{}", host)
    } else {
        ctx.settings.public_base_url.trim_end_matches('/').to_string()
    };

    let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let authorize_url = ctx.auth
        .authorize_url("google", &format!("{}/auth/callback", base_url), &verifier)
        .map_err(upstream)?;

    redirect(&authorize_url, &[verifier_cookie(&verifier, ctx.settings.is_production())])
}

/// SSO is not wired up yet, so this falls through to manual account linking.
async fn handle_login_claremont() -> Result<impl Reply, Rejection> {
    redirect("/profile/link-account", &[])
}

async fn handle_callback(
    ctx: Arc<CmsContext>,
    query: HashMap<String, String>,
    verifier: Option<String>,
) -> Result<impl Reply, Rejection> {
    let Some(code) = query.get("code").filter(|c| !c.is_empty()) else {
        return Err(ApiRejection::validation("Authentication failed: No authorization code"));
    };
    let Some(verifier) = verifier.filter(|v| !v.is_empty()) else {
        return Err(ApiRejection::validation("Authentication failed: Missing login state"));
    };

    let user = ctx.auth.exchange_code(code, &verifier).await.map_err(|e| match e {
        BackendError::InvalidCode(reason) => {
            warn!("Authorization code rejected: {}", reason);
            ApiRejection::validation("Authentication failed: Invalid authorization code")
        }
        other => upstream(other),
    })?;

    let session = Session::from_user(user, ctx.settings.session_ttl_secs);
    bootstrap_user(ctx.store.as_ref(), &session.caller())
        .await
        .map_err(upstream)?;

    let token = session.encode(&ctx.settings.secret_key).map_err(ApiRejection::upstream)?;
    info!("User {} logged in", session.user_id);

    redirect("/dashboard", &[
        session_cookie(&token, session.max_age(), ctx.settings.is_production()),
        expired_cookie(PKCE_COOKIE, "/auth/callback"),
    ])
}

async fn handle_logout(
    ctx: Arc<CmsContext>,
    cookie: Option<String>,
) -> Result<impl Reply, Rejection> {
    if let Some(session) = cookie.and_then(|c| Session::decode(&c, &ctx.settings.secret_key).ok()) {
        if let Err(e) = ctx.auth.sign_out(&session.access_token).await {
            warn!("Logout error: {}", e);
        }
    }

    redirect("/login", &[expired_cookie(SESSION_COOKIE, "/")])
}

async fn handle_dashboard(ctx: Arc<CmsContext>, session: Session) -> Result<impl Reply, Rejection> {
    let caller = session.caller();
    let config = ctx.store.get_config(&caller).await.map_err(upstream)?.unwrap_or_default();
    let remote_data = ctx.store.list_content(&caller).await.map_err(upstream)?;

    Ok(success(serde_json::json!({
        "user": session.public_user(),
        "config": config,
        "remote_data": remote_data,
    })))
}

async fn handle_list_content(ctx: Arc<CmsContext>, session: Session) -> Result<impl Reply, Rejection> {
    let items = ctx.store.list_content(&session.caller()).await.map_err(upstream)?;
    Ok(success(items))
}

async fn handle_add_content(
    ctx: Arc<CmsContext>,
    session: Session,
    body: ContentBody,
) -> Result<impl Reply, Rejection> {
    let item = ContentItem::new(&session.user_id, body.content.unwrap_or_default(), Utc::now());
    let created = ctx.store.insert_content(&session.caller(), &item).await.map_err(upstream)?;
    Ok(success(created))
}

async fn handle_update_content(
    id: Uuid,
    ctx: Arc<CmsContext>,
    session: Session,
    body: ContentBody,
) -> Result<impl Reply, Rejection> {
    let content = body.content.ok_or_else(|| ApiRejection::validation("Content field is required"))?;
    let updated = ctx.store
        .update_content(&session.caller(), id, &content, Utc::now())
        .await
        .map_err(upstream)?;
    Ok(success(updated))
}

async fn handle_delete_content(
    id: Uuid,
    ctx: Arc<CmsContext>,
    session: Session,
) -> Result<impl Reply, Rejection> {
    ctx.store.delete_content(&session.caller(), id).await.map_err(upstream)?;
    Ok(success_message("Content deleted successfully"))
}

async fn handle_get_config(ctx: Arc<CmsContext>, session: Session) -> Result<impl Reply, Rejection> {
    match ctx.store.get_config(&session.caller()).await.map_err(upstream)? {
        Some(config) => Ok(warp::reply::json(&serde_json::json!({
            "success": true,
            "config": config,
        }))),
        None => Err(ApiRejection::not_found("Config not found")),
    }
}

async fn handle_dummy(
    ctx: Arc<CmsContext>,
    session: Session,
    body: Bytes,
) -> Result<impl Reply, Rejection> {
    let body: ContentBody = if body.iter().all(|b| b.is_ascii_whitespace()) {
        ContentBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiRejection::validation(clean_error_message(&e.to_string())))?
    };

    let now = Utc::now();
    let content = body.content.unwrap_or_else(|| format!(
        "# Auto-generated Content\n\nThis is dummy content generated at {} UTC.\n\nYou can customize this via the form or API.",
        now.format("%Y-%m-%d %H:%M:%S")
    ));

    let item = ContentItem::new(&session.user_id, content, now);
    let created = ctx.store.insert_content(&session.caller(), &item).await.map_err(upstream)?;
    Ok(success(created))
}

async fn handle_profile(ctx: Arc<CmsContext>, session: Session) -> Result<impl Reply, Rejection> {
    let config = ctx.store.get_config(&session.caller()).await.map_err(upstream)?;

    Ok(success(serde_json::json!({
        "user": session.public_user(),
        "identities": session.identities,
        "config": config,
    })))
}

fn parse_config(raw: &str) -> Result<UserConfig, String> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| format!("Invalid JSON format: {}", clean_error_message(&e.to_string())))?;
    let config: UserConfig = serde_json::from_value(value)
        .map_err(|e| format!("Invalid configuration: {}", clean_error_message(&e.to_string())))?;
    config.validate().map_err(|e| format!("Invalid configuration: {}", e))?;
    Ok(config)
}

async fn handle_update_config(
    ctx: Arc<CmsContext>,
    session: Session,
    form: HashMap<String, String>,
) -> Result<impl Reply, Rejection> {
    let raw = form.get("config").ok_or_else(|| ApiRejection::validation("Missing config field"))?;
    let config = parse_config(raw).map_err(ApiRejection::validation)?;

    ctx.store.update_config(&session.caller(), &config).await.map_err(upstream)?;
    Ok(success_message("Configuration updated successfully! Changes will apply on next page refresh."))
}

async fn handle_link_account(session: Session) -> Result<impl Reply, Rejection> {
    Ok(success(serde_json::json!({
        "user": session.public_user(),
        "identities": session.identities,
    })))
}

// TODO: verify ownership of the secondary email and move content/config rows
// over to the primary user id.
async fn handle_link_manual(
    _session: Session,
    form: HashMap<String, String>,
) -> Result<impl Reply, Rejection> {
    let email = form.get("email").map(String::as_str).unwrap_or_default();
    Err::<warp::reply::Json, _>(ApiRejection::new(
        ErrorKind::NotImplemented,
        format!("Manual linking for {} is not yet implemented", email),
    ))
}
