use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use log::{debug, error, info};
use tokio::signal;
use tokio::task::JoinHandle;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use push_cms_server::cms::routes::{run_cms_server, CmsContext};
use push_cms_server::cms::supabase::SupabaseClient;
use push_cms_server::config::Settings;
use push_cms_server::db::DbHandler;
use push_cms_server::http_server::{run_http_server, PushContext};
use push_cms_server::notifications::Dispatcher;
use push_cms_server::subscription::{import_subscriptions, to_subscription_file, SubscriptionStore};
use push_cms_server::vapid;
use push_cms_server::web_push::WebPushSender;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the push relay and the CMS together
    Serve,
    /// Run the push relay only
    Push,
    /// Run the CMS only
    Cms,
    /// Load subscriptions from a JSON file keyed by external id
    ImportSubscriptions {
        #[arg(short, long)]
        file: String,
    },
    /// Write all stored subscriptions to a JSON file
    ExportSubscriptions {
        #[arg(short, long)]
        file: String,
    },
    /// Create the VAPID key files if missing and print the public key
    GenerateVapidKeys,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    info!("Starting push-cms-server");
    debug!("Debug logging enabled");

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_services(true, true).await,
        Commands::Push => run_services(true, false).await,
        Commands::Cms => run_services(false, true).await,
        Commands::ImportSubscriptions { file } => run_import(&file),
        Commands::ExportSubscriptions { file } => run_export(&file),
        Commands::GenerateVapidKeys => {
            let (_, public_key) = vapid::ensure_vapid_keys().map_err(|e| e.to_string())?;
            println!("VAPID public key: {}", public_key);
            Ok(())
        }
    }
}

fn open_store(settings: &Settings) -> Result<Arc<DbHandler>, BoxError> {
    fs::create_dir_all(&settings.db_path).map_err(|e| {
        error!("Failed to create database directory: {:?}", e);
        e
    })?;

    info!("Initializing database...");
    let db_handler = Arc::new(DbHandler::new(settings)?);
    info!("Database initialized successfully");
    Ok(db_handler)
}

async fn run_services(push: bool, cms: bool) -> Result<(), BoxError> {
    let settings = Arc::new(Settings::new()?);
    debug!("Settings loaded");

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if push {
        let store: Arc<dyn SubscriptionStore> = open_store(&settings)?;
        let sender = Arc::new(WebPushSender::new(&settings)?);
        let ctx = Arc::new(PushContext {
            settings: Arc::clone(&settings),
            store: Arc::clone(&store),
            dispatcher: Dispatcher::new(store, sender),
        });
        let shutdown_flag_push = Arc::clone(&shutdown_flag);

        debug!("Spawning push relay");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_http_server(ctx, shutdown_flag_push).await {
                error!("Push relay error: {}", e);
            }
        }));
    }

    if cms {
        let backend = Arc::new(SupabaseClient::new(&settings)?);
        let ctx = Arc::new(CmsContext {
            settings: Arc::clone(&settings),
            auth: backend.clone(),
            store: backend,
        });
        let shutdown_flag_cms = Arc::clone(&shutdown_flag);

        debug!("Spawning CMS server");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_cms_server(ctx, shutdown_flag_cms).await {
                error!("CMS server error: {}", e);
            }
        }));
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown_flag.store(true, Ordering::Relaxed);
    });

    debug!("Waiting for tasks to complete");
    for task in tasks {
        task.await?;
    }

    debug!("Main function ending");
    Ok(())
}

fn run_import(file_path: &str) -> Result<(), BoxError> {
    let settings = Settings::new()?;
    println!("Loading subscriptions from {}", file_path);

    let store = open_store(&settings)?;
    let contents = fs::read_to_string(file_path)?;

    let before_count = store.count()?;
    let (imported, skipped) = import_subscriptions(store.as_ref(), &contents)?;
    let after_count = store.count()?;

    println!("\nImport complete:");
    println!("  Subscriptions before: {}", before_count);
    println!("  Subscriptions imported: {}", imported);
    println!("  Entries skipped: {}", skipped);
    println!("  Total subscriptions now: {}", after_count);
    Ok(())
}

fn run_export(file_path: &str) -> Result<(), BoxError> {
    let settings = Settings::new()?;
    let store = open_store(&settings)?;

    let entries = store.all()?;
    let count = entries.len();
    fs::write(file_path, to_subscription_file(entries)?)?;

    println!("Exported {} subscriptions to {}", count, file_path);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("Ctrl+C received, shutting down...");
        }
        _ = sigterm.recv() => {
            println!("SIGTERM received, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    println!("Ctrl+C received, shutting down...");
}
