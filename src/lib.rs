pub mod auth;
pub mod cms;
pub mod config;
pub mod db;
pub mod errors;
pub mod http_server;
pub mod notifications;
pub mod subscription;
pub mod vapid;
pub mod web_push;
