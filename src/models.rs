//! Domain types shared by the local store, the remote service and the state
//! container.
//!
//! Field names follow the hosted `orders` table (snake_case) and the JSON
//! shape the browser build kept in local storage (camelCase for master and
//! config), so rows and cached blobs deserialize without a translation layer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Store identifier used whenever a row or config carries none.
pub const DEFAULT_STORE_ID: &str = "default";

/// Placeholder staff name used until someone configures the staff list.
pub const UNASSIGNED_STAFF: &str = "担当者未設定";

/// Vendor selection value meaning "show every vendor".
pub const ALL_VENDORS_KEY: &str = "__all__";

/// Category label for items without a category.
pub const UNCATEGORIZED: &str = "未設定";

pub const DEFAULT_CATEGORIES: [&str; 6] = ["野菜", "果物", "乳製品", "肉・魚", "調味料", "その他"];

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// One (date, vendor, item, store) quantity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    pub date: String,
    pub vendor: String,
    pub item: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub qty: i64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep_checked: Option<bool>,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
}

/// Uniqueness key of an order. Mirrors the remote upsert conflict target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    pub date: String,
    pub vendor: String,
    pub item: String,
    pub store_id: String,
}

impl OrderKey {
    pub fn new(date: &str, vendor: &str, item: &str, store_id: &str) -> Self {
        Self {
            date: date.to_string(),
            vendor: vendor.to_string(),
            item: item.to_string(),
            store_id: store_id_or_default(Some(store_id)).to_string(),
        }
    }
}

impl Order {
    /// Empty order for a key, used when an item is edited for the first time.
    pub fn blank(key: &OrderKey) -> Self {
        Self {
            id: None,
            date: key.date.clone(),
            vendor: key.vendor.clone(),
            item: key.item.clone(),
            qty: 0,
            stock: 0,
            prep: None,
            prep_checked: None,
            updated_at: 0,
            updated_by: None,
            store_id: Some(key.store_id.clone()),
        }
    }

    pub fn key(&self) -> OrderKey {
        OrderKey::new(&self.date, &self.vendor, &self.item, self.store_id())
    }

    pub fn store_id(&self) -> &str {
        store_id_or_default(self.store_id.as_deref())
    }

    pub fn prep_or_zero(&self) -> i64 {
        self.prep.unwrap_or(0)
    }

    pub fn is_prep_checked(&self) -> bool {
        self.prep_checked.unwrap_or(false)
    }
}

/// Blank and missing store ids collapse to [`DEFAULT_STORE_ID`].
pub fn store_id_or_default(store_id: Option<&str>) -> &str {
    match store_id {
        Some(s) if !s.trim().is_empty() => s,
        _ => DEFAULT_STORE_ID,
    }
}

// ---------------------------------------------------------------------------
// Master data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub ingredients: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub steps: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub points: String,
    #[serde(
        default,
        rename = "estimatedMinutes",
        deserialize_with = "lenient_minutes",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub unit: String,
    #[serde(default, deserialize_with = "lenient_price")]
    pub price: f64,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_recipe",
        skip_serializing_if = "Option::is_none"
    )]
    pub recipe: Option<Recipe>,
}

impl Item {
    pub fn new(name: &str, unit: &str, price: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            price,
            category: None,
            recipe: None,
        }
    }

    /// Category label, [`UNCATEGORIZED`] when unset or blank.
    pub fn category_label(&self) -> &str {
        match self.category.as_deref() {
            Some(c) if !c.trim().is_empty() => c,
            _ => UNCATEGORIZED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_list")]
    pub items: Vec<Item>,
}

/// Vendor/item catalog of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Master {
    #[serde(deserialize_with = "lenient_list")]
    pub vendors: Vec<Vendor>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub categories: Option<Vec<String>>,
    #[serde(
        default,
        rename = "categoryColors",
        deserialize_with = "lenient_color_map",
        skip_serializing_if = "Option::is_none"
    )]
    pub category_colors: Option<BTreeMap<String, String>>,
}

impl Default for Master {
    fn default() -> Self {
        let vendor = |name: &str, items: &[(&str, &str)]| Vendor {
            name: name.to_string(),
            items: items
                .iter()
                .map(|(item, unit)| Item::new(item, unit, 0.0))
                .collect(),
        };
        Self {
            vendors: vec![
                vendor("大光", &[("バター", "kg"), ("牛乳", "本")]),
                vendor("高瀬", &[("キャベツ", "玉"), ("レタス", "玉")]),
                vendor("安田青果", &[("玉ねぎ", "kg")]),
            ],
            categories: Some(default_categories()),
            category_colors: None,
        }
    }
}

impl Master {
    pub fn vendor(&self, name: &str) -> Option<&Vendor> {
        self.vendors.iter().find(|v| v.name == name)
    }

    pub fn item(&self, vendor: &str, item: &str) -> Option<&Item> {
        self.vendor(vendor)?.items.iter().find(|i| i.name == item)
    }

    pub fn category_order(&self) -> Vec<String> {
        self.categories.clone().unwrap_or_else(default_categories)
    }

    /// Validate and repair a master blob from either persistence path.
    ///
    /// Returns `None` unless `vendors` is a non-empty array. Everything
    /// below that is coerced field by field: prices and minutes from numeric
    /// strings, wrong-typed text and lists to empty, non-object entries
    /// dropped. Missing categories get the defaults.
    pub fn normalize(raw: &Value) -> Option<Master> {
        let vendors = raw.get("vendors")?.as_array()?;
        if vendors.is_empty() {
            return None;
        }
        let mut master: Master = serde_json::from_value(raw.clone()).ok()?;
        if master.categories.is_none() {
            master.categories = Some(default_categories());
        }
        Some(master)
    }
}

pub fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Config, history, status
// ---------------------------------------------------------------------------

/// Per-store settings. `staff` is the comma-joined staff list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_staff")]
    pub staff: String,
    #[serde(default = "default_store_id", rename = "storeId")]
    pub store_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staff: default_staff(),
            store_id: default_store_id(),
        }
    }
}

impl Config {
    /// Lenient read: wrong-typed or blank fields fall back to defaults.
    pub fn normalize(raw: &Value) -> Option<Config> {
        let obj = raw.as_object()?;
        let field = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        Some(Config {
            staff: field("staff").unwrap_or_else(default_staff),
            store_id: field("storeId").unwrap_or_else(default_store_id),
        })
    }

    /// Staff names in configured order. Never empty.
    pub fn staff_list(&self) -> Vec<String> {
        let names: Vec<String> = self
            .staff
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            vec![UNASSIGNED_STAFF.to_string()]
        } else {
            names
        }
    }

    pub fn store_id(&self) -> &str {
        store_id_or_default(Some(&self.store_id))
    }
}

fn default_staff() -> String {
    UNASSIGNED_STAFF.to_string()
}

fn default_store_id() -> String {
    DEFAULT_STORE_ID.to_string()
}

/// A vendor's order sheet was sent (copied) on `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHistoryEntry {
    pub date: String,
    pub vendor: String,
    pub timestamp: i64,
}

/// Coarse indicator of remote reachability and write outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Ready,
    Syncing,
    Saved,
    Offline,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Ready => "ready",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Saved => "saved",
            SyncStatus::Offline => "offline",
            SyncStatus::Conflict => "conflict",
        }
    }

    /// Header badge text.
    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::Ready => "READY",
            SyncStatus::Syncing => "同期中...",
            SyncStatus::Saved => "保存済み",
            SyncStatus::Offline => "オフライン",
            SyncStatus::Conflict => "競合",
        }
    }
}

// ---------------------------------------------------------------------------
// Lenient numeric fields
// ---------------------------------------------------------------------------

/// Numbers stay numbers, numeric strings are parsed, anything else is 0.
pub(crate) fn coerce_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn lenient_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_f64(&value))
}

/// Row ids arrive as text or as bigint depending on the table definition.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_f64(&value).trunc() as i64)
}

// ---------------------------------------------------------------------------
// Lenient master fields
// ---------------------------------------------------------------------------

fn text_of(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_of(Value::deserialize(deserializer)?).unwrap_or_default())
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_of(Value::deserialize(deserializer)?))
}

fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string_list(deserializer)?.unwrap_or_default())
}

/// Arrays keep their text entries; anything else is `None`.
fn lenient_opt_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(values) => Some(values.into_iter().filter_map(text_of).collect()),
        _ => None,
    })
}

/// Whole minutes; fractions are truncated, negatives dropped.
fn lenient_minutes<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let minutes = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(minutes
        .filter(|m| m.is_finite() && *m >= 0.0)
        .map(|m| m.trunc().min(f64::from(u32::MAX)) as u32))
}

fn lenient_recipe<'de, D>(deserializer: D) -> Result<Option<Recipe>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

/// Entries that fail to decode are dropped instead of failing the list.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(values) => values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_color_map<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => Some(
            map.into_iter()
                .filter_map(|(label, key)| key.as_str().map(|k| (label, k.to_string())))
                .collect(),
        ),
        _ => None,
    })
}
