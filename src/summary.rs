//! Order sheet summary, clipboard text, confirmation and prep list.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::error::{SyncError, ValidationError};
use crate::models::{Master, Order, OrderHistoryEntry, Recipe};
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryLine {
    pub item: String,
    pub qty: i64,
    pub unit: String,
    pub price: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorSummary {
    pub vendor: String,
    pub lines: Vec<SummaryLine>,
    pub subtotal: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSummary {
    pub date: String,
    pub vendors: Vec<VendorSummary>,
    pub total: f64,
}

impl OrderSummary {
    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }

    pub fn vendor(&self, name: &str) -> Option<&VendorSummary> {
        self.vendors.iter().find(|v| v.vendor == name)
    }

    pub fn item_count(&self) -> usize {
        self.vendors.iter().map(|v| v.lines.len()).sum()
    }

    pub fn total_qty(&self) -> i64 {
        self.vendors
            .iter()
            .flat_map(|v| v.lines.iter())
            .map(|l| l.qty)
            .sum()
    }
}

pub fn line_amount(qty: i64, price: f64) -> f64 {
    qty as f64 * price
}

/// Orders with a positive quantity for (date, store), grouped by vendor in
/// first-seen order. Unit and price come from the master; unknown items
/// have no unit and price 0.
pub fn build_summary(orders: &[Order], master: &Master, date: &str, store_id: &str) -> OrderSummary {
    let mut vendors: Vec<VendorSummary> = Vec::new();

    for order in orders
        .iter()
        .filter(|o| o.date == date && o.store_id() == store_id && o.qty > 0)
    {
        let item = master.item(&order.vendor, &order.item);
        let price = item.map(|i| i.price).unwrap_or(0.0);
        let line = SummaryLine {
            item: order.item.clone(),
            qty: order.qty,
            unit: item.map(|i| i.unit.clone()).unwrap_or_default(),
            price,
            amount: line_amount(order.qty, price),
        };

        let idx = match vendors.iter().position(|v| v.vendor == order.vendor) {
            Some(idx) => idx,
            None => {
                vendors.push(VendorSummary {
                    vendor: order.vendor.clone(),
                    lines: Vec::new(),
                    subtotal: 0.0,
                });
                vendors.len() - 1
            }
        };
        vendors[idx].subtotal += line.amount;
        vendors[idx].lines.push(line);
    }

    let total = vendors.iter().map(|v| v.subtotal).sum();
    OrderSummary {
        date: date.to_string(),
        vendors,
        total,
    }
}

/// Plain-text order sheet for pasting into a message to the vendors.
pub fn clipboard_text(summary: &OrderSummary) -> String {
    let mut text = format!("【発注内容】{}\n\n", summary.date);
    for vendor in &summary.vendors {
        text.push_str(&format!("■ {}\n", vendor.vendor));
        for line in &vendor.lines {
            text.push_str(&format!("  {} {}{}\n", line.item, line.qty, line.unit));
        }
        text.push('\n');
    }
    text
}

/// Summary of the current scope.
pub fn current_summary(ctx: &AppContext) -> OrderSummary {
    let scope = ctx.scope();
    build_summary(&ctx.orders(), &ctx.master(), &scope.date, &scope.store_id)
}

/// Mark the current date's orders as confirmed. Returns the RFC 3339
/// confirmation time.
pub fn confirm_orders(ctx: &AppContext) -> Result<String, ValidationError> {
    let summary = current_summary(ctx);
    if summary.item_count() == 0 || summary.total_qty() == 0 {
        return Err(ValidationError::NothingToConfirm);
    }
    let scope = ctx.scope();
    let confirmed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    if let Err(e) = storage::set_confirmation(ctx.db(), &scope.date, &scope.store_id, &confirmed_at) {
        warn!(date = %scope.date, error = %e, "failed to store confirmation");
    }
    info!(
        date = %scope.date,
        vendors = summary.vendors.len(),
        items = summary.item_count(),
        qty = summary.total_qty(),
        "orders confirmed"
    );
    Ok(confirmed_at)
}

pub fn confirmation(ctx: &AppContext) -> Option<String> {
    let scope = ctx.scope();
    storage::get_confirmation(ctx.db(), &scope.date, &scope.store_id)
}

/// Record one history entry per vendor of a sent summary.
pub fn record_sent(ctx: &AppContext, summary: &OrderSummary) -> Result<usize, SyncError> {
    let timestamp = Utc::now().timestamp_millis();
    for vendor in &summary.vendors {
        storage::save_order_history_entry(
            ctx.db(),
            OrderHistoryEntry {
                date: summary.date.clone(),
                vendor: vendor.vendor.clone(),
                timestamp,
            },
        )?;
    }
    Ok(summary.vendors.len())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepEntry {
    pub order: Order,
    pub recipe: Option<Recipe>,
}

/// Orders with prep > 0 for (date, store), each with its item's recipe.
pub fn prep_list(orders: &[Order], master: &Master, date: &str, store_id: &str) -> Vec<PrepEntry> {
    orders
        .iter()
        .filter(|o| o.date == date && o.store_id() == store_id && o.prep_or_zero() > 0)
        .map(|o| PrepEntry {
            order: o.clone(),
            recipe: master.item(&o.vendor, &o.item).and_then(|i| i.recipe.clone()),
        })
        .collect()
}

pub fn current_prep_list(ctx: &AppContext) -> Vec<PrepEntry> {
    let scope = ctx.scope();
    prep_list(&ctx.orders(), &ctx.master(), &scope.date, &scope.store_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{context_with, order};
    use crate::models::{Item, Vendor};
    use crate::realtime::{apply_change, ChangeEvent};
    use crate::remote::memory::MemoryRemote;
    use std::sync::Arc;

    fn priced_master() -> Master {
        let mut master = Master::default();
        master.vendors[1].items[0] = Item::new("キャベツ", "玉", 150.0);
        master.vendors[1].items[1] = Item::new("レタス", "玉", 200.0);
        master.vendors[0].items[0].recipe = Some(Recipe {
            ingredients: vec!["バター 10g".into()],
            ..Recipe::default()
        });
        master
    }

    #[test]
    fn test_line_amount_and_vendor_subtotal() {
        let orders = vec![
            order("2026-01-05", "高瀬", "キャベツ", 4),
            order("2026-01-05", "高瀬", "レタス", 1),
            order("2026-01-05", "大光", "牛乳", 2),
        ];
        let summary = build_summary(&orders, &priced_master(), "2026-01-05", "default");

        let takase = summary.vendor("高瀬").unwrap();
        assert_eq!(takase.lines[0].amount, 600.0);
        assert_eq!(takase.subtotal, 800.0);
        assert_eq!(summary.vendors[0].vendor, "高瀬");
        assert_eq!(summary.total, 800.0);
        assert_eq!(summary.item_count(), 3);
        assert_eq!(summary.total_qty(), 7);
    }

    #[test]
    fn test_summary_skips_zero_qty_other_dates_and_stores() {
        let mut elsewhere = order("2026-01-05", "高瀬", "キャベツ", 3);
        elsewhere.store_id = Some("ebisu".into());
        let orders = vec![
            order("2026-01-05", "高瀬", "キャベツ", 0),
            order("2026-01-06", "高瀬", "キャベツ", 5),
            elsewhere,
        ];
        let summary = build_summary(&orders, &priced_master(), "2026-01-05", "default");
        assert!(summary.is_empty());
    }

    #[test]
    fn test_unknown_item_has_no_price() {
        let orders = vec![order("2026-01-05", "丸正", "豆腐", 2)];
        let summary = build_summary(&orders, &priced_master(), "2026-01-05", "default");
        let line = &summary.vendors[0].lines[0];
        assert_eq!(line.unit, "");
        assert_eq!(line.amount, 0.0);
    }

    #[test]
    fn test_clipboard_text_format() {
        let orders = vec![
            order("2026-01-05", "高瀬", "キャベツ", 4),
            order("2026-01-05", "大光", "牛乳", 2),
        ];
        let summary = build_summary(&orders, &priced_master(), "2026-01-05", "default");
        assert_eq!(
            clipboard_text(&summary),
            "【発注内容】2026-01-05\n\n■ 高瀬\n  キャベツ 4玉\n\n■ 大光\n  牛乳 2本\n\n"
        );
    }

    #[test]
    fn test_realtime_delete_removes_line_from_summary() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        ctx.set_current_date("2026-01-05").unwrap();
        ctx.set_master(priced_master());
        let mut cabbage = order("2026-01-05", "高瀬", "キャベツ", 4);
        cabbage.id = Some("row-1".into());
        ctx.update_order(cabbage);
        ctx.update_order(order("2026-01-05", "高瀬", "レタス", 1));
        assert_eq!(current_summary(&ctx).total, 800.0);

        let scope = ctx.scope();
        assert!(apply_change(&ctx, &scope, ChangeEvent::Delete { id: "row-1".into(), store_id: None }));
        let summary = current_summary(&ctx);
        assert_eq!(summary.item_count(), 1);
        assert_eq!(summary.total, 200.0);
    }

    #[test]
    fn test_confirm_requires_orders() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        ctx.set_current_date("2026-01-05").unwrap();
        assert_eq!(confirm_orders(&ctx), Err(ValidationError::NothingToConfirm));
        assert!(confirmation(&ctx).is_none());

        ctx.update_order(order("2026-01-05", "大光", "牛乳", 2));
        let confirmed_at = confirm_orders(&ctx).unwrap();
        assert_eq!(confirmation(&ctx), Some(confirmed_at));
    }

    #[test]
    fn test_record_sent_adds_history_per_vendor() {
        let ctx = context_with(Arc::new(MemoryRemote::new()));
        let orders = vec![
            order("2026-01-05", "高瀬", "キャベツ", 4),
            order("2026-01-05", "大光", "牛乳", 2),
        ];
        let summary = build_summary(&orders, &ctx.master(), "2026-01-05", "default");
        assert_eq!(record_sent(&ctx, &summary).unwrap(), 2);
        let history = storage::load_order_history(ctx.db());
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].vendor, "大光");
    }

    #[test]
    fn test_prep_list_pairs_recipe() {
        let mut butter = order("2026-01-05", "大光", "バター", 0);
        butter.prep = Some(2);
        let mut milk = order("2026-01-05", "大光", "牛乳", 1);
        milk.prep = Some(0);
        let master = priced_master();
        let list = prep_list(&[butter, milk], &master, "2026-01-05", "default");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].order.item, "バター");
        assert_eq!(list[0].recipe.as_ref().unwrap().ingredients, vec!["バター 10g"]);

        let bare_master = Master {
            vendors: vec![Vendor {
                name: "大光".into(),
                items: vec![],
            }],
            categories: None,
            category_colors: None,
        };
        let orders = vec![list[0].order.clone()];
        let bare = prep_list(&orders, &bare_master, "2026-01-05", "default");
        assert!(bare[0].recipe.is_none());
    }
}
