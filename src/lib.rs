//! Order Sheet sync core.
//!
//! Staff record daily order quantities, stock and prep per vendor/item for
//! a store. In-memory state is updated optimistically, written to the hosted
//! database after a short debounce, and kept current by a realtime channel.
//! Master data and settings are cached in a local SQLite store.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod debounce;
pub mod diagnostics;
pub mod edits;
pub mod error;
pub mod models;
pub mod orders;
pub mod realtime;
pub mod remote;
pub mod status;
pub mod storage;
pub mod summary;
pub mod supabase;

use crate::config::{AppPaths, RemoteConfig};
use crate::context::AppContext;
use crate::edits::OrderEditor;
use crate::orders::OrderSyncClient;
use crate::realtime::RealtimeSubscriber;
use crate::remote::RemoteStore;
use crate::supabase::SupabaseClient;

/// Upper bound for sending pending edits at shutdown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// App entry point
// ============================================================================

pub fn run() {
    let paths = AppPaths::from_env();

    let guard = match diagnostics::init_logging(&paths.log_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("File logging unavailable ({}): {e}", paths.log_dir.display());
            None
        }
    };

    info!(
        "Starting Order Sheet v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );
    info!(about = %diagnostics::get_about_info(), "build info");

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")
        .and_then(|runtime| runtime.block_on(start(paths)));

    if let Err(e) = result {
        error!("Startup failed: {e:#}");
        // Flush the file writer before exiting.
        drop(guard);
        std::process::exit(1);
    }
    info!("Order Sheet stopped");
}

async fn start(paths: AppPaths) -> anyhow::Result<()> {
    let remote_config = RemoteConfig::from_env().context("remote service configuration")?;
    let db = Arc::new(db::init(&paths.data_dir).context("opening local store")?);
    debug!(path = %db.db_path.display(), "local store ready");
    let remote: Arc<dyn RemoteStore> =
        Arc::new(SupabaseClient::new(&remote_config).context("creating remote client")?);

    let ctx = AppContext::init(db, remote).await;
    info!(
        store_id = %ctx.store_id(),
        date = %ctx.current_date(),
        vendor = %ctx.current_vendor(),
        "state container ready"
    );

    let sync = Arc::new(OrderSyncClient::new(Arc::clone(&ctx)));
    sync.refresh_current_date().await;

    let shutdown = CancellationToken::new();
    let refresher = Arc::clone(&sync).spawn_scope_refresher(shutdown.child_token());
    let realtime = RealtimeSubscriber::spawn(Arc::clone(&ctx), &remote_config, shutdown.child_token());
    let status_log = spawn_status_log(&ctx, shutdown.child_token());
    let editor = OrderEditor::new(Arc::clone(&ctx), Arc::clone(&sync));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, editor.flush())
        .await
        .is_err()
    {
        warn!("pending edits not flushed before timeout");
        editor.shutdown();
    }
    shutdown.cancel();
    realtime.join().await;
    for task in [refresher, status_log] {
        if let Err(e) = task.await {
            warn!(error = %e, "background task failed");
        }
    }
    Ok(())
}

/// Log every sync status transition.
fn spawn_status_log(
    ctx: &AppContext,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut status_rx = ctx.status().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    info!(status = status.as_str(), label = status.label(), "sync status");
                }
            }
        }
    })
}
