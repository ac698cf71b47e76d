//! Application state container.
//!
//! [`AppContext`] is created once at startup and shared as `Arc<AppContext>`
//! by the sync client, the editor and the realtime subscriber. It owns the
//! in-memory orders, master, config, selection and sync status, and is the
//! only place that writes master/config to the two persistence paths.
//!
//! Locks are never held across an `.await`.

use chrono::{Days, Local, NaiveDate, Utc};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::db::LocalDb;
use crate::error::{SyncError, ValidationError};
use crate::models::{Config, Master, Order, OrderKey, SyncStatus, ALL_VENDORS_KEY};
use crate::remote::{RemoteStore, StoreDataRow};
use crate::status::SyncStatusHandle;
use crate::storage;

const EVENT_CAPACITY: usize = 256;
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Change notifications for observers (a front end, logs).
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    OrdersReplaced { date: String, count: usize },
    OrderUpdated(Order),
    OrderRemoved { id: String },
    MasterChanged,
    ConfigChanged,
    VendorSelected(String),
    DateChanged(String),
    StaffSelected(String),
}

/// The (date, store) pair that order fetches and the realtime channel are
/// bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub date: String,
    pub store_id: String,
}

#[derive(Debug, Clone, Default)]
struct Selection {
    vendor: String,
    date: String,
    staff: Option<String>,
}

/// Where master/config came from during startup hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hydration {
    /// Remote row adopted and cached locally.
    Remote,
    /// No usable remote row; local copy pushed to establish it.
    PushedLocal,
    /// Remote unreachable; local copy kept, nothing pushed.
    LocalOnly,
}

pub struct AppContext {
    db: Arc<LocalDb>,
    remote: Arc<dyn RemoteStore>,
    orders: RwLock<Vec<Order>>,
    master: RwLock<Master>,
    config: RwLock<Config>,
    selection: RwLock<Selection>,
    scope_tx: watch::Sender<Scope>,
    status: SyncStatusHandle,
    events: broadcast::Sender<AppEvent>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub fn today() -> String {
    Local::now().format(DATE_FORMAT).to_string()
}

/// Validate a `YYYY-MM-DD` date.
pub fn parse_date(date: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(date.trim(), DATE_FORMAT)
        .map_err(|_| ValidationError::InvalidDate(date.to_string()))
}

impl AppContext {
    /// Build the container from the local store only. Runs the one-time
    /// local migration first.
    pub fn new(db: Arc<LocalDb>, remote: Arc<dyn RemoteStore>) -> Arc<Self> {
        let migration = storage::migrate_v4_to_v5(&db);
        debug!(?migration, "local store migration checked");

        let master = storage::load_master(&db);
        let config = storage::load_config(&db);
        let date = today();
        let scope = Scope {
            date: date.clone(),
            store_id: config.store_id().to_string(),
        };
        let (scope_tx, _) = watch::channel(scope);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let ctx = Arc::new(Self {
            db,
            remote,
            orders: RwLock::new(Vec::new()),
            master: RwLock::new(master),
            config: RwLock::new(config),
            selection: RwLock::new(Selection {
                date,
                ..Selection::default()
            }),
            scope_tx,
            status: SyncStatusHandle::new(),
            events,
        });
        ctx.ensure_vendor_selected();
        ctx
    }

    /// [`AppContext::new`] followed by [`AppContext::hydrate_from_remote`].
    pub async fn init(db: Arc<LocalDb>, remote: Arc<dyn RemoteStore>) -> Arc<Self> {
        let ctx = Self::new(db, remote);
        let source = ctx.hydrate_from_remote().await;
        info!(?source, store_id = %ctx.store_id(), "store data hydrated");
        ctx
    }

    /// Adopt the remote master/config for the configured store, or push the
    /// local copy when the remote has none. Only an unreachable service skips
    /// the push.
    pub async fn hydrate_from_remote(&self) -> Hydration {
        let store_id = self.store_id();
        match self.remote.fetch_store_data(&store_id).await {
            Ok(Some(row)) => {
                if let Some((master, config)) = row.decode() {
                    self.adopt_store_data(master, config);
                    return Hydration::Remote;
                }
                warn!(%store_id, "remote store data unusable, replacing with local copy");
            }
            Ok(None) => debug!(%store_id, "no remote store data yet"),
            Err(SyncError::Network(e)) => {
                warn!(%store_id, error = %e, "store data unreachable, using local copy");
                return Hydration::LocalOnly;
            }
            Err(e) => warn!(%store_id, error = %e, "store data fetch failed, replacing with local copy"),
        }

        let row = self.store_data_row(&store_id);
        if let Err(e) = self.remote.upsert_store_data(&row).await {
            warn!(%store_id, error = %e, "failed to establish remote store data");
        }
        Hydration::PushedLocal
    }

    fn adopt_store_data(&self, master: Master, config: Config) {
        if let Err(e) = storage::persist_master(&self.db, &master) {
            warn!(error = %e, "failed to cache master");
        }
        if let Err(e) = storage::persist_config(&self.db, &config) {
            warn!(error = %e, "failed to cache config");
        }
        *write(&self.master) = master;
        *write(&self.config) = config;
        self.emit(AppEvent::MasterChanged);
        self.emit(AppEvent::ConfigChanged);
        self.sync_scope();
        self.ensure_vendor_selected();
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    pub fn orders(&self) -> Vec<Order> {
        read(&self.orders).clone()
    }

    /// Orders of the current (date, store).
    pub fn scoped_orders(&self) -> Vec<Order> {
        let scope = self.scope();
        read(&self.orders)
            .iter()
            .filter(|o| o.date == scope.date && o.store_id() == scope.store_id)
            .cloned()
            .collect()
    }

    pub fn find_order(&self, key: &OrderKey) -> Option<Order> {
        read(&self.orders).iter().find(|o| &o.key() == key).cloned()
    }

    pub fn set_orders(&self, orders: Vec<Order>) {
        let count = orders.len();
        *write(&self.orders) = orders;
        self.emit(AppEvent::OrdersReplaced {
            date: self.current_date(),
            count,
        });
    }

    /// Insert or replace by (date, vendor, item, store). Last call wins.
    pub fn update_order(&self, order: Order) {
        let key = order.key();
        {
            let mut orders = write(&self.orders);
            match orders.iter_mut().find(|o| o.key() == key) {
                Some(existing) => *existing = order.clone(),
                None => orders.push(order.clone()),
            }
        }
        self.emit(AppEvent::OrderUpdated(order));
    }

    /// Remove by row id. Returns whether anything was removed.
    pub fn remove_order(&self, id: &str) -> bool {
        let removed = {
            let mut orders = write(&self.orders);
            let before = orders.len();
            orders.retain(|o| o.id.as_deref() != Some(id));
            orders.len() != before
        };
        if removed {
            self.emit(AppEvent::OrderRemoved { id: id.to_string() });
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Master / config
    // -----------------------------------------------------------------------

    pub fn master(&self) -> Master {
        read(&self.master).clone()
    }

    pub fn config(&self) -> Config {
        read(&self.config).clone()
    }

    pub fn store_id(&self) -> String {
        read(&self.config).store_id().to_string()
    }

    /// Replace the master, cache it and push it to the remote in the
    /// background.
    pub fn set_master(&self, master: Master) {
        if let Err(e) = storage::persist_master(&self.db, &master) {
            warn!(error = %e, "failed to cache master");
        }
        *write(&self.master) = master;
        self.emit(AppEvent::MasterChanged);
        self.ensure_vendor_selected();
        self.spawn_store_data_push();
    }

    /// Replace the config, cache it and push it to the remote in the
    /// background. A store id change moves the scope.
    pub fn set_config(&self, config: Config) {
        if let Err(e) = storage::persist_config(&self.db, &config) {
            warn!(error = %e, "failed to cache config");
        }
        *write(&self.config) = config;
        self.emit(AppEvent::ConfigChanged);
        self.sync_scope();
        self.spawn_store_data_push();
    }

    fn store_data_row(&self, store_id: &str) -> StoreDataRow {
        StoreDataRow::new(
            store_id,
            &read(&self.master),
            &read(&self.config),
            Utc::now().timestamp_millis(),
        )
    }

    fn spawn_store_data_push(&self) {
        let store_id = self.store_id();
        let row = self.store_data_row(&store_id);
        let remote = Arc::clone(&self.remote);
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(%store_id, "no async runtime, store data not pushed");
            return;
        };
        rt.spawn(async move {
            match remote.upsert_store_data(&row).await {
                Ok(()) => debug!(store_id = %row.store_id, "store data pushed"),
                Err(e) => warn!(store_id = %row.store_id, error = %e, "store data push failed"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    pub fn current_vendor(&self) -> String {
        read(&self.selection).vendor.clone()
    }

    /// Select a vendor by name, or [`ALL_VENDORS_KEY`].
    pub fn set_current_vendor(&self, vendor: &str) {
        write(&self.selection).vendor = vendor.to_string();
        self.emit(AppEvent::VendorSelected(vendor.to_string()));
    }

    /// Select the first vendor when nothing valid is selected.
    pub fn ensure_vendor_selected(&self) {
        let current = self.current_vendor();
        if current == ALL_VENDORS_KEY {
            return;
        }
        let first = {
            let master = read(&self.master);
            if !current.is_empty() && master.vendor(&current).is_some() {
                return;
            }
            master.vendors.first().map(|v| v.name.clone())
        };
        if let Some(name) = first {
            self.set_current_vendor(&name);
        }
    }

    pub fn current_date(&self) -> String {
        read(&self.selection).date.clone()
    }

    pub fn set_current_date(&self, date: &str) -> Result<(), ValidationError> {
        let date = parse_date(date)?.format(DATE_FORMAT).to_string();
        {
            let mut selection = write(&self.selection);
            if selection.date == date {
                return Ok(());
            }
            selection.date = date.clone();
        }
        self.emit(AppEvent::DateChanged(date));
        self.sync_scope();
        Ok(())
    }

    pub fn prev_day(&self) -> Result<String, ValidationError> {
        self.shift_day(-1)
    }

    pub fn next_day(&self) -> Result<String, ValidationError> {
        self.shift_day(1)
    }

    fn shift_day(&self, delta: i64) -> Result<String, ValidationError> {
        let current = self.current_date();
        let date = parse_date(&current)?;
        let shifted = if delta < 0 {
            date.checked_sub_days(Days::new(delta.unsigned_abs()))
        } else {
            date.checked_add_days(Days::new(delta.unsigned_abs()))
        }
        .ok_or_else(|| ValidationError::InvalidDate(current.clone()))?;
        let shifted = shifted.format(DATE_FORMAT).to_string();
        self.set_current_date(&shifted)?;
        Ok(shifted)
    }

    /// Active staff member: the selection if still listed, else the first
    /// configured name.
    pub fn current_staff(&self) -> String {
        let staff = read(&self.config).staff_list();
        let selected = read(&self.selection).staff.clone();
        match selected {
            Some(name) if staff.contains(&name) => name,
            _ => staff.into_iter().next().unwrap_or_default(),
        }
    }

    pub fn set_current_staff(&self, name: &str) -> Result<(), ValidationError> {
        let name = name.trim();
        if !read(&self.config).staff_list().iter().any(|s| s == name) {
            return Err(ValidationError::UnknownStaff(name.to_string()));
        }
        write(&self.selection).staff = Some(name.to_string());
        self.emit(AppEvent::StaffSelected(name.to_string()));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scope, status, events
    // -----------------------------------------------------------------------

    pub fn scope(&self) -> Scope {
        self.scope_tx.borrow().clone()
    }

    pub fn watch_scope(&self) -> watch::Receiver<Scope> {
        self.scope_tx.subscribe()
    }

    fn sync_scope(&self) {
        let scope = Scope {
            date: self.current_date(),
            store_id: self.store_id(),
        };
        self.scope_tx.send_if_modified(|current| {
            if *current == scope {
                false
            } else {
                debug!(date = %scope.date, store_id = %scope.store_id, "scope changed");
                *current = scope;
                true
            }
        });
    }

    pub fn status(&self) -> &SyncStatusHandle {
        &self.status
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AppEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn db(&self) -> &LocalDb {
        &self.db
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::models::{Item, Vendor};
    use crate::remote::memory::MemoryRemote;

    #[test]
    fn test_update_order_keeps_one_entry_per_key() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        ctx.update_order(order("2026-01-05", "高瀬", "キャベツ", 1));
        ctx.update_order(order("2026-01-05", "高瀬", "レタス", 2));
        ctx.update_order(order("2026-01-05", "高瀬", "キャベツ", 5));

        let mut with_blank_store = order("2026-01-05", "高瀬", "レタス", 9);
        with_blank_store.store_id = None;
        ctx.update_order(with_blank_store);

        let orders = ctx.orders();
        assert_eq!(orders.len(), 2);
        let qty = |item: &str| orders.iter().find(|o| o.item == item).map(|o| o.qty);
        assert_eq!(qty("キャベツ"), Some(5));
        assert_eq!(qty("レタス"), Some(9));
    }

    #[test]
    fn test_remove_order_by_id() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        let mut held = order("2026-01-05", "大光", "牛乳", 2);
        held.id = Some("row-7".into());
        ctx.update_order(held);
        ctx.update_order(order("2026-01-05", "大光", "バター", 1));

        assert!(!ctx.remove_order("row-8"));
        assert!(ctx.remove_order("row-7"));
        assert_eq!(ctx.orders().len(), 1);
    }

    #[test]
    fn test_first_vendor_selected_automatically() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        assert_eq!(ctx.current_vendor(), "大光");

        ctx.set_current_vendor(ALL_VENDORS_KEY);
        ctx.ensure_vendor_selected();
        assert_eq!(ctx.current_vendor(), ALL_VENDORS_KEY);
    }

    #[test]
    fn test_date_navigation_moves_scope() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        let mut scope_rx = ctx.watch_scope();
        scope_rx.borrow_and_update();

        ctx.set_current_date("2026-03-01").unwrap();
        assert!(scope_rx.has_changed().unwrap());
        assert_eq!(ctx.prev_day().unwrap(), "2026-02-28");
        assert_eq!(ctx.next_day().unwrap(), "2026-03-01");
        assert_eq!(ctx.scope().date, "2026-03-01");

        assert_eq!(
            ctx.set_current_date("03/01/2026"),
            Err(ValidationError::InvalidDate("03/01/2026".into()))
        );
    }

    #[test]
    fn test_current_staff_follows_config() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        assert_eq!(ctx.current_staff(), crate::models::UNASSIGNED_STAFF);

        *write(&ctx.config) = Config {
            staff: "田中, 佐藤".into(),
            store_id: "default".into(),
        };
        assert_eq!(ctx.current_staff(), "田中");
        ctx.set_current_staff("佐藤").unwrap();
        assert_eq!(ctx.current_staff(), "佐藤");
        assert!(ctx.set_current_staff("鈴木").is_err());
    }

    #[tokio::test]
    async fn test_hydrate_adopts_remote_store_data() {
        let remote = Arc::new(MemoryRemote::new());
        let master = Master {
            vendors: vec![Vendor {
                name: "丸正".into(),
                items: vec![Item::new("豆腐", "丁", 80.0)],
            }],
            categories: None,
            category_colors: None,
        };
        let config = Config {
            staff: "田中".into(),
            store_id: "default".into(),
        };
        remote.seed_store_data(StoreDataRow::new("default", &master, &config, 1));

        let ctx = context_with(Arc::clone(&remote));
        assert_eq!(ctx.hydrate_from_remote().await, Hydration::Remote);
        assert_eq!(ctx.master().vendors[0].name, "丸正");
        assert_eq!(ctx.current_vendor(), "丸正");
        assert_eq!(storage::load_config(ctx.db()).staff, "田中");
        assert!(remote.store_data_upserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hydrate_keeps_remote_master_with_loose_fields() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_store_data(StoreDataRow {
            store_id: "default".into(),
            master: serde_json::json!({
                "vendors": [{
                    "name": "丸正",
                    "items": [{
                        "name": "豆腐", "unit": "丁", "price": 80,
                        "recipe": {
                            "ingredients": ["豆腐"], "steps": [],
                            "points": null, "estimatedMinutes": 7.5
                        }
                    }]
                }]
            }),
            config: serde_json::json!({ "staff": "田中", "storeId": "default" }),
            updated_at: 1,
        });

        let ctx = context_with(Arc::clone(&remote));
        assert_eq!(ctx.hydrate_from_remote().await, Hydration::Remote);
        assert_eq!(ctx.master().vendors[0].name, "丸正");
        assert!(remote.store_data_upserts.lock().unwrap().is_empty());
        let kept = remote.store_data("default").unwrap();
        assert_eq!(kept.master["vendors"][0]["name"], "丸正");
    }

    #[tokio::test]
    async fn test_hydrate_pushes_local_when_fetch_rejected() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_reject_reads(true);
        let ctx = context_with(Arc::clone(&remote));
        assert_eq!(ctx.hydrate_from_remote().await, Hydration::PushedLocal);
        assert_eq!(remote.store_data_upserts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hydrate_pushes_local_when_remote_empty() {
        let remote = Arc::new(MemoryRemote::new());
        let ctx = context_with(Arc::clone(&remote));
        assert_eq!(ctx.hydrate_from_remote().await, Hydration::PushedLocal);
        let pushed = remote.store_data("default").expect("row established");
        assert_eq!(pushed.decode().unwrap().0, Master::default());
    }

    #[tokio::test]
    async fn test_hydrate_offline_keeps_local() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_offline(true);
        let ctx = context_with(Arc::clone(&remote));
        assert_eq!(ctx.hydrate_from_remote().await, Hydration::LocalOnly);
        assert_eq!(ctx.master(), Master::default());
    }

    #[tokio::test]
    async fn test_set_config_persists_and_pushes() {
        let remote = Arc::new(MemoryRemote::new());
        let ctx = context_with(Arc::clone(&remote));
        let mut events = ctx.subscribe();

        ctx.set_config(Config {
            staff: "田中".into(),
            store_id: "ebisu".into(),
        });
        assert_eq!(storage::load_config(ctx.db()).store_id, "ebisu");
        assert_eq!(ctx.scope().store_id, "ebisu");
        assert_eq!(events.recv().await.unwrap(), AppEvent::ConfigChanged);

        for _ in 0..10 {
            if remote.store_data("ebisu").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(remote.store_data("ebisu").is_some());
    }

    #[tokio::test]
    async fn test_set_master_push_failure_is_swallowed() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_offline(true);
        let ctx = context_with(Arc::clone(&remote));
        let mut master = Master::default();
        master.vendors.remove(0);
        ctx.set_master(master.clone());
        tokio::task::yield_now().await;

        assert_eq!(ctx.master(), master);
        assert_eq!(storage::load_master(ctx.db()), master);
        assert_eq!(ctx.current_vendor(), "高瀬");
    }
}
