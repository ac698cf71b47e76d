//! Typed access to the local persistent store.
//!
//! Master, config and the order-history list are cached as JSON under
//! versioned keys. Reads never fail: a missing or malformed value falls back
//! to defaults. Order rows are not kept here long-term; the only order data
//! is the legacy blob that the one-time v4 → v5 migration produces.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::db::{self, LocalDb};
use crate::error::SyncError;
use crate::models::{Config, Master, Order, OrderHistoryEntry, DEFAULT_STORE_ID, UNASSIGNED_STAFF};

pub const KEY_MASTER: &str = "orderMaster_v5";
pub const KEY_CONFIG: &str = "orderConfig_v5";
pub const KEY_ORDER_HISTORY: &str = "order_history_v5";
/// Nested legacy orders (`date → vendor → item → entry`); also the
/// migration guard.
pub const KEY_ORDERS: &str = "orders_v5";

const LEGACY_KEY_ORDERS: &str = "orders_v4";
const LEGACY_KEY_CONFIG: &str = "orderConfig_v4";

const CONFIRMATION_PREFIX: &str = "order_confirmed_";

// ---------------------------------------------------------------------------
// Raw JSON helpers
// ---------------------------------------------------------------------------

fn read_json(db: &LocalDb, key: &str) -> Option<Value> {
    let raw = {
        let conn = db.conn.lock().ok()?;
        db::get_value(&conn, key)?
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(key, error = %e, "discarding malformed cached value");
            None
        }
    }
}

fn write_json(db: &LocalDb, key: &str, value: &Value) -> Result<(), SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::LocalStore(e.to_string()))?;
    db::set_value(&conn, key, &value.to_string())
}

fn has_key(db: &LocalDb, key: &str) -> bool {
    db.conn
        .lock()
        .map(|conn| db::has_value(&conn, key))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Master / config
// ---------------------------------------------------------------------------

/// Cached master, or the built-in default when absent or unusable.
pub fn load_master(db: &LocalDb) -> Master {
    read_json(db, KEY_MASTER)
        .and_then(|raw| Master::normalize(&raw))
        .unwrap_or_default()
}

pub fn persist_master(db: &LocalDb, master: &Master) -> Result<(), SyncError> {
    write_json(db, KEY_MASTER, &serde_json::to_value(master)?)
}

pub fn load_config(db: &LocalDb) -> Config {
    read_json(db, KEY_CONFIG)
        .and_then(|raw| Config::normalize(&raw))
        .unwrap_or_default()
}

pub fn persist_config(db: &LocalDb, config: &Config) -> Result<(), SyncError> {
    write_json(db, KEY_CONFIG, &serde_json::to_value(config)?)
}

// ---------------------------------------------------------------------------
// Order history
// ---------------------------------------------------------------------------

/// Newest first.
pub fn load_order_history(db: &LocalDb) -> Vec<OrderHistoryEntry> {
    read_json(db, KEY_ORDER_HISTORY)
        .and_then(|raw| serde_json::from_value::<Vec<OrderHistoryEntry>>(raw).ok())
        .unwrap_or_default()
}

pub fn save_order_history_entry(db: &LocalDb, entry: OrderHistoryEntry) -> Result<(), SyncError> {
    let mut list = load_order_history(db);
    list.insert(0, entry);
    write_json(db, KEY_ORDER_HISTORY, &serde_json::to_value(&list)?)
}

// ---------------------------------------------------------------------------
// Confirmation marks
// ---------------------------------------------------------------------------

fn confirmation_key(date: &str, store_id: &str) -> String {
    format!("{CONFIRMATION_PREFIX}{date}_{store_id}")
}

/// RFC 3339 timestamp of the confirmation for (date, store), if confirmed.
pub fn get_confirmation(db: &LocalDb, date: &str, store_id: &str) -> Option<String> {
    let conn = db.conn.lock().ok()?;
    db::get_value(&conn, &confirmation_key(date, store_id))
}

pub fn set_confirmation(
    db: &LocalDb,
    date: &str,
    store_id: &str,
    confirmed_at: &str,
) -> Result<(), SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::LocalStore(e.to_string()))?;
    db::set_value(&conn, &confirmation_key(date, store_id), confirmed_at)
}

// ---------------------------------------------------------------------------
// v4 → v5 migration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Current-version data already present.
    AlreadyCurrent,
    /// No legacy data found.
    NothingToMigrate,
    Migrated { orders: bool, config: bool },
}

/// One-time conversion of the v4 layout into v5 keys.
///
/// Guarded by the presence of [`KEY_ORDERS`], which is always written once
/// the migration has looked at legacy data, so a second call is a no-op.
/// Malformed legacy values are skipped silently.
pub fn migrate_v4_to_v5(db: &LocalDb) -> MigrationOutcome {
    if has_key(db, KEY_ORDERS) {
        return MigrationOutcome::AlreadyCurrent;
    }

    let raw_orders = read_raw(db, LEGACY_KEY_ORDERS);
    let raw_config = read_raw(db, LEGACY_KEY_CONFIG);
    if raw_orders.is_none() && raw_config.is_none() {
        return MigrationOutcome::NothingToMigrate;
    }

    let now = Utc::now().timestamp_millis();
    let migrated_orders = raw_orders
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .map(|legacy| convert_legacy_orders(&legacy, now));
    let orders_done = migrated_orders.is_some();

    let guard = migrated_orders.unwrap_or_else(|| Value::Object(Map::new()));
    if let Err(e) = write_json(db, KEY_ORDERS, &guard) {
        warn!(error = %e, "v4 migration: failed to write orders");
        return MigrationOutcome::NothingToMigrate;
    }

    let mut config_done = false;
    if !has_key(db, KEY_CONFIG) {
        if let Some(legacy) = raw_config.and_then(|raw| serde_json::from_str::<Value>(&raw).ok()) {
            let staff = legacy
                .get("staff")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(UNASSIGNED_STAFF);
            let config = Config {
                staff: staff.to_string(),
                store_id: DEFAULT_STORE_ID.to_string(),
            };
            config_done = persist_config(db, &config).is_ok();
        }
    }

    info!(
        orders = orders_done,
        config = config_done,
        "Migrated local store from v4 to v5"
    );
    MigrationOutcome::Migrated {
        orders: orders_done,
        config: config_done,
    }
}

fn read_raw(db: &LocalDb, key: &str) -> Option<String> {
    let conn = db.conn.lock().ok()?;
    db::get_value(&conn, key)
}

/// v4 stored either a bare quantity or an object per item.
fn convert_legacy_orders(legacy: &Value, now: i64) -> Value {
    let mut dates = Map::new();
    for (date, vendors) in legacy.as_object().into_iter().flatten() {
        let mut vendor_map = Map::new();
        for (vendor, items) in vendors.as_object().into_iter().flatten() {
            let mut item_map = Map::new();
            for (item, entry) in items.as_object().into_iter().flatten() {
                item_map.insert(item.clone(), convert_legacy_entry(entry, now));
            }
            vendor_map.insert(vendor.clone(), Value::Object(item_map));
        }
        dates.insert(date.clone(), Value::Object(vendor_map));
    }
    Value::Object(dates)
}

fn convert_legacy_entry(entry: &Value, now: i64) -> Value {
    let number = |v: Option<&Value>| v.map(crate::models::coerce_f64).unwrap_or(0.0) as i64;
    let qty = match entry {
        Value::Object(obj) if obj.contains_key("qty") => number(obj.get("qty")),
        other => number(Some(other)),
    };
    let stock = number(entry.get("stock"));
    let updated_at = entry
        .get("updatedAt")
        .and_then(Value::as_i64)
        .filter(|t| *t != 0)
        .unwrap_or(now);
    let updated_by = entry
        .get("updatedBy")
        .and_then(Value::as_str)
        .unwrap_or_default();
    serde_json::json!({
        "qty": qty,
        "stock": stock,
        "updatedAt": updated_at,
        "updatedBy": updated_by,
    })
}

/// Flatten the v5 legacy blob into order rows for `store_id`.
pub fn load_legacy_orders(db: &LocalDb, store_id: &str) -> Vec<Order> {
    let Some(blob) = read_json(db, KEY_ORDERS) else {
        return Vec::new();
    };
    let mut orders = Vec::new();
    for (date, vendors) in blob.as_object().into_iter().flatten() {
        for (vendor, items) in vendors.as_object().into_iter().flatten() {
            for (item, entry) in items.as_object().into_iter().flatten() {
                let updated_by = entry
                    .get("updatedBy")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(String::from);
                orders.push(Order {
                    id: None,
                    date: date.clone(),
                    vendor: vendor.clone(),
                    item: item.clone(),
                    qty: entry.get("qty").and_then(Value::as_i64).unwrap_or(0),
                    stock: entry.get("stock").and_then(Value::as_i64).unwrap_or(0),
                    prep: None,
                    prep_checked: None,
                    updated_at: entry.get("updatedAt").and_then(Value::as_i64).unwrap_or(0),
                    updated_by,
                    store_id: Some(store_id.to_string()),
                });
            }
        }
    }
    orders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::Item;
    use serde_json::json;

    fn put(db: &LocalDb, key: &str, raw: &str) {
        let conn = db.conn.lock().unwrap();
        db::set_value(&conn, key, raw).unwrap();
    }

    fn raw(db: &LocalDb, key: &str) -> Option<String> {
        read_raw(db, key)
    }

    #[test]
    fn test_load_master_falls_back_to_default() {
        let db = open_in_memory().unwrap();
        assert_eq!(load_master(&db), Master::default());

        put(&db, KEY_MASTER, "{not json");
        assert_eq!(load_master(&db), Master::default());

        put(&db, KEY_MASTER, r#"{"vendors":[]}"#);
        assert_eq!(load_master(&db), Master::default());
    }

    #[test]
    fn test_master_persist_and_reload() {
        let db = open_in_memory().unwrap();
        let mut master = Master::default();
        master.vendors[1].items[0] = Item::new("キャベツ", "玉", 150.0);
        persist_master(&db, &master).unwrap();
        assert_eq!(load_master(&db), master);
    }

    #[test]
    fn test_load_config_defaults() {
        let db = open_in_memory().unwrap();
        assert_eq!(load_config(&db), Config::default());

        put(&db, KEY_CONFIG, r#"{"staff":"","storeId":"ebisu"}"#);
        let config = load_config(&db);
        assert_eq!(config.staff, UNASSIGNED_STAFF);
        assert_eq!(config.store_id, "ebisu");
    }

    #[test]
    fn test_order_history_is_newest_first() {
        let db = open_in_memory().unwrap();
        for (i, vendor) in ["大光", "高瀬"].iter().enumerate() {
            save_order_history_entry(
                &db,
                OrderHistoryEntry {
                    date: "2026-01-05".into(),
                    vendor: vendor.to_string(),
                    timestamp: i as i64,
                },
            )
            .unwrap();
        }
        let history = load_order_history(&db);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].vendor, "高瀬");
    }

    #[test]
    fn test_confirmation_is_scoped_by_store() {
        let db = open_in_memory().unwrap();
        set_confirmation(&db, "2026-01-05", "default", "2026-01-05T09:00:00Z").unwrap();
        assert!(get_confirmation(&db, "2026-01-05", "default").is_some());
        assert!(get_confirmation(&db, "2026-01-05", "ebisu").is_none());
    }

    #[test]
    fn test_migration_converts_legacy_orders_and_config() {
        let db = open_in_memory().unwrap();
        put(
            &db,
            LEGACY_KEY_ORDERS,
            &json!({
                "2025-12-01": {
                    "高瀬": {
                        "キャベツ": 3,
                        "レタス": { "qty": 2, "stock": "1", "updatedAt": 42, "updatedBy": "田中" }
                    }
                }
            })
            .to_string(),
        );
        put(&db, LEGACY_KEY_CONFIG, r#"{"staff":"田中,佐藤","gasUrl":"x"}"#);

        let outcome = migrate_v4_to_v5(&db);
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                orders: true,
                config: true
            }
        );

        let blob: Value = serde_json::from_str(&raw(&db, KEY_ORDERS).unwrap()).unwrap();
        let cabbage = &blob["2025-12-01"]["高瀬"]["キャベツ"];
        assert_eq!(cabbage["qty"], 3);
        assert_eq!(cabbage["stock"], 0);
        assert_eq!(cabbage["updatedBy"], "");
        let lettuce = &blob["2025-12-01"]["高瀬"]["レタス"];
        assert_eq!(lettuce["stock"], 1);
        assert_eq!(lettuce["updatedAt"], 42);

        let config = load_config(&db);
        assert_eq!(config.staff, "田中,佐藤");
        assert_eq!(config.store_id, DEFAULT_STORE_ID);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let db = open_in_memory().unwrap();
        put(&db, LEGACY_KEY_ORDERS, r#"{"2025-12-01":{"大光":{"牛乳":5}}}"#);
        put(&db, LEGACY_KEY_CONFIG, r#"{"staff":"田中"}"#);

        migrate_v4_to_v5(&db);
        let orders_once = raw(&db, KEY_ORDERS);
        let config_once = raw(&db, KEY_CONFIG);

        // Staff edits made after the first run must survive a second call.
        assert_eq!(migrate_v4_to_v5(&db), MigrationOutcome::AlreadyCurrent);
        assert_eq!(raw(&db, KEY_ORDERS), orders_once);
        assert_eq!(raw(&db, KEY_CONFIG), config_once);
    }

    #[test]
    fn test_migration_config_only_still_sets_guard() {
        let db = open_in_memory().unwrap();
        put(&db, LEGACY_KEY_CONFIG, r#"{"staff":"佐藤"}"#);
        assert_eq!(
            migrate_v4_to_v5(&db),
            MigrationOutcome::Migrated {
                orders: false,
                config: true
            }
        );
        assert_eq!(raw(&db, KEY_ORDERS).as_deref(), Some("{}"));

        persist_config(
            &db,
            &Config {
                staff: "鈴木".into(),
                store_id: "default".into(),
            },
        )
        .unwrap();
        assert_eq!(migrate_v4_to_v5(&db), MigrationOutcome::AlreadyCurrent);
        assert_eq!(load_config(&db).staff, "鈴木");
    }

    #[test]
    fn test_migration_swallows_malformed_legacy_data() {
        let db = open_in_memory().unwrap();
        put(&db, LEGACY_KEY_ORDERS, "{{{");
        assert_eq!(
            migrate_v4_to_v5(&db),
            MigrationOutcome::Migrated {
                orders: false,
                config: false
            }
        );
        assert!(load_legacy_orders(&db, "default").is_empty());
    }

    #[test]
    fn test_migration_without_legacy_data() {
        let db = open_in_memory().unwrap();
        assert_eq!(migrate_v4_to_v5(&db), MigrationOutcome::NothingToMigrate);
        assert!(raw(&db, KEY_ORDERS).is_none());
    }

    #[test]
    fn test_load_legacy_orders_flattens_blob() {
        let db = open_in_memory().unwrap();
        put(&db, LEGACY_KEY_ORDERS, r#"{"2025-12-01":{"大光":{"牛乳":5,"バター":{"qty":1,"updatedBy":"田中"}}}}"#);
        migrate_v4_to_v5(&db);

        let mut orders = load_legacy_orders(&db, "ebisu");
        orders.sort_by(|a, b| a.item.cmp(&b.item));
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].item, "バター");
        assert_eq!(orders[0].updated_by.as_deref(), Some("田中"));
        assert_eq!(orders[1].qty, 5);
        assert!(orders.iter().all(|o| o.store_id() == "ebisu"));
    }
}
