//! Order sync client.
//!
//! CRUD bridge between the in-memory orders and the remote `orders` table,
//! scoped by the configured store. Every failure is turned into a sync
//! status and an empty/false result; nothing here returns an error to the
//! caller and nothing retries on its own.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::models::{Order, SyncStatus};
use crate::remote::OrderRow;
use crate::storage;

pub struct OrderSyncClient {
    ctx: Arc<AppContext>,
}

/// Result of pushing the legacy local order blob to the remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyImport {
    pub pushed: usize,
    pub failed: usize,
}

impl OrderSyncClient {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// All rows for (date, configured store), vendor then item order.
    /// Empty on any failure.
    pub async fn get_orders_by_date(&self, date: &str) -> Vec<Order> {
        let status = self.ctx.status();
        let store_id = self.ctx.store_id();
        status.set(SyncStatus::Syncing);

        match self.ctx.remote().select_orders(date, &store_id).await {
            Ok(orders) => {
                debug!(date, %store_id, count = orders.len(), "orders fetched");
                status.set(SyncStatus::Ready);
                orders
            }
            Err(e) => {
                warn!(date, %store_id, error = %e, "Error fetching orders");
                status.set(SyncStatus::Offline);
                Vec::new()
            }
        }
    }

    /// Upsert one row on (date, vendor, item, store). Missing optional
    /// fields take their defaults and the active staff member.
    pub async fn upsert_order(&self, order: &Order) -> bool {
        let status = self.ctx.status();
        let row = OrderRow::from_order(order, &self.ctx.current_staff(), &self.ctx.store_id());
        status.set(SyncStatus::Syncing);

        match self.ctx.remote().upsert_order(&row).await {
            Ok(()) => {
                debug!(date = %row.date, vendor = %row.vendor, item = %row.item, qty = row.qty, "order saved");
                status.mark_saved();
                true
            }
            Err(e) => {
                warn!(date = %row.date, vendor = %row.vendor, item = %row.item, error = %e, "Error upserting order");
                status.set(e.status());
                false
            }
        }
    }

    pub async fn delete_order(&self, id: &str) -> bool {
        let status = self.ctx.status();
        status.set(SyncStatus::Syncing);

        match self.ctx.remote().delete_order(id).await {
            Ok(()) => {
                debug!(id, "order deleted");
                status.mark_saved();
                true
            }
            Err(e) => {
                warn!(id, error = %e, "Error deleting order");
                status.set(e.status());
                false
            }
        }
    }

    /// Fetch the current scope and replace the in-memory list. A result
    /// whose scope is no longer current is discarded.
    pub async fn refresh_current_date(&self) -> bool {
        let scope = self.ctx.scope();
        let orders = self.get_orders_by_date(&scope.date).await;
        if self.ctx.scope() != scope {
            debug!(date = %scope.date, "scope moved during fetch, result discarded");
            return false;
        }
        self.ctx.set_orders(orders);
        true
    }

    /// Refresh whenever the date or store changes, until `shutdown`.
    pub fn spawn_scope_refresher(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut scope_rx = self.ctx.watch_scope();
        scope_rx.borrow_and_update();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = scope_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let scope = scope_rx.borrow_and_update().clone();
                        info!(date = %scope.date, store_id = %scope.store_id, "scope changed, refreshing orders");
                        self.refresh_current_date().await;
                    }
                }
            }
            debug!("scope refresher stopped");
        })
    }

    /// Push the migrated legacy order blob to the remote table for the
    /// configured store.
    pub async fn import_legacy_orders(&self) -> LegacyImport {
        let store_id = self.ctx.store_id();
        let orders = storage::load_legacy_orders(self.ctx.db(), &store_id);
        let mut outcome = LegacyImport::default();
        for order in &orders {
            if self.upsert_order(order).await {
                outcome.pushed += 1;
            } else {
                outcome.failed += 1;
            }
        }
        info!(%store_id, pushed = outcome.pushed, failed = outcome.failed, "legacy orders imported");
        outcome
    }
}
