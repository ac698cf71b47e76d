//! Remote data service seam.
//!
//! The sync client and the state container only talk to [`RemoteStore`];
//! `supabase.rs` implements it over the hosted PostgREST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::models::{Config, Master, Order};

/// Row written to the `orders` table. Optional order fields are already
/// resolved to their defaults; `id` is assigned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub date: String,
    pub vendor: String,
    pub item: String,
    pub qty: i64,
    pub stock: i64,
    pub prep: i64,
    pub prep_checked: bool,
    pub updated_at: i64,
    pub updated_by: String,
    pub store_id: String,
}

impl OrderRow {
    /// Resolve defaults: `prep` → 0, `prep_checked` → false, `updated_by` →
    /// `staff`, `store_id` → the configured store.
    pub fn from_order(order: &Order, staff: &str, store_id: &str) -> Self {
        let store_id = match order.store_id.as_deref() {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => crate::models::store_id_or_default(Some(store_id)).to_string(),
        };
        Self {
            date: order.date.clone(),
            vendor: order.vendor.clone(),
            item: order.item.clone(),
            qty: order.qty,
            stock: order.stock,
            prep: order.prep.unwrap_or(0),
            prep_checked: order.prep_checked.unwrap_or(false),
            updated_at: order.updated_at,
            updated_by: order
                .updated_by
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| staff.to_string()),
            store_id,
        }
    }
}

/// Row of the `store_data` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDataRow {
    pub store_id: String,
    pub master: Value,
    pub config: Value,
    pub updated_at: i64,
}

impl StoreDataRow {
    pub fn new(store_id: &str, master: &Master, config: &Config, updated_at: i64) -> Self {
        Self {
            store_id: store_id.to_string(),
            master: serde_json::to_value(master).unwrap_or(Value::Null),
            config: serde_json::to_value(config).unwrap_or(Value::Null),
            updated_at,
        }
    }

    /// Normalised master and config, or `None` when either is unusable.
    pub fn decode(&self) -> Option<(Master, Config)> {
        let master = Master::normalize(&self.master)?;
        let config = Config::normalize(&self.config)?;
        Some((master, config))
    }
}

/// Request/response access to the hosted store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All order rows for (date, store), ordered by vendor then item.
    async fn select_orders(&self, date: &str, store_id: &str) -> Result<Vec<Order>, SyncError>;

    /// Upsert on (date, vendor, item, store_id).
    async fn upsert_order(&self, row: &OrderRow) -> Result<(), SyncError>;

    async fn delete_order(&self, id: &str) -> Result<(), SyncError>;

    async fn fetch_store_data(&self, store_id: &str) -> Result<Option<StoreDataRow>, SyncError>;

    /// Upsert on `store_id`.
    async fn upsert_store_data(&self, row: &StoreDataRow) -> Result<(), SyncError>;
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-process [`RemoteStore`] used by tests across the crate.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use crate::models::OrderKey;

    #[derive(Default)]
    pub struct MemoryRemote {
        orders: Mutex<BTreeMap<OrderKey, Order>>,
        store_data: Mutex<BTreeMap<String, StoreDataRow>>,
        pub upserts: Mutex<Vec<OrderRow>>,
        pub store_data_upserts: Mutex<Vec<StoreDataRow>>,
        next_id: AtomicU64,
        pub offline: AtomicBool,
        pub reject_writes: AtomicBool,
        pub reject_reads: AtomicBool,
    }

    impl MemoryRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn set_reject_writes(&self, reject: bool) {
            self.reject_writes.store(reject, Ordering::SeqCst);
        }

        pub fn set_reject_reads(&self, reject: bool) {
            self.reject_reads.store(reject, Ordering::SeqCst);
        }

        pub fn upsert_count(&self) -> usize {
            self.upserts.lock().unwrap().len()
        }

        pub fn last_upsert(&self) -> Option<OrderRow> {
            self.upserts.lock().unwrap().last().cloned()
        }

        pub fn seed_store_data(&self, row: StoreDataRow) {
            self.store_data
                .lock()
                .unwrap()
                .insert(row.store_id.clone(), row);
        }

        pub fn store_data(&self, store_id: &str) -> Option<StoreDataRow> {
            self.store_data.lock().unwrap().get(store_id).cloned()
        }

        fn check_online(&self) -> Result<(), SyncError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::Network("connection refused".into()));
            }
            Ok(())
        }

        fn check_readable(&self) -> Result<(), SyncError> {
            self.check_online()?;
            if self.reject_reads.load(Ordering::SeqCst) {
                return Err(SyncError::Rejected {
                    status: 403,
                    message: "permission denied for table store_data".into(),
                });
            }
            Ok(())
        }

        fn check_writable(&self) -> Result<(), SyncError> {
            self.check_online()?;
            if self.reject_writes.load(Ordering::SeqCst) {
                return Err(SyncError::Rejected {
                    status: 409,
                    message: "duplicate key value violates unique constraint".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn select_orders(&self, date: &str, store_id: &str) -> Result<Vec<Order>, SyncError> {
            self.check_online()?;
            Ok(self
                .orders
                .lock()
                .unwrap()
                .values()
                .filter(|o| o.date == date && o.store_id() == store_id)
                .cloned()
                .collect())
        }

        async fn upsert_order(&self, row: &OrderRow) -> Result<(), SyncError> {
            self.check_writable()?;
            self.upserts.lock().unwrap().push(row.clone());
            let key = OrderKey::new(&row.date, &row.vendor, &row.item, &row.store_id);
            let mut orders = self.orders.lock().unwrap();
            let id = orders
                .get(&key)
                .and_then(|o| o.id.clone())
                .unwrap_or_else(|| format!("row-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
            orders.insert(
                key,
                Order {
                    id: Some(id),
                    date: row.date.clone(),
                    vendor: row.vendor.clone(),
                    item: row.item.clone(),
                    qty: row.qty,
                    stock: row.stock,
                    prep: Some(row.prep),
                    prep_checked: Some(row.prep_checked),
                    updated_at: row.updated_at,
                    updated_by: Some(row.updated_by.clone()),
                    store_id: Some(row.store_id.clone()),
                },
            );
            Ok(())
        }

        async fn delete_order(&self, id: &str) -> Result<(), SyncError> {
            self.check_writable()?;
            self.orders
                .lock()
                .unwrap()
                .retain(|_, o| o.id.as_deref() != Some(id));
            Ok(())
        }

        async fn fetch_store_data(&self, store_id: &str) -> Result<Option<StoreDataRow>, SyncError> {
            self.check_readable()?;
            Ok(self.store_data(store_id))
        }

        async fn upsert_store_data(&self, row: &StoreDataRow) -> Result<(), SyncError> {
            self.check_writable()?;
            self.store_data_upserts.lock().unwrap().push(row.clone());
            self.seed_store_data(row.clone());
            Ok(())
        }
    }
}
