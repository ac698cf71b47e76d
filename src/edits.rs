//! Quantity, stock and prep edits from the item cards and the prep list.
//!
//! Every edit lands in memory at once. The remote write for an order key is
//! debounced by [`EDIT_DEBOUNCE`], so rapid taps collapse into one upsert
//! that carries the latest in-memory values.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::context::AppContext;
use crate::debounce::Debouncer;
use crate::models::{Order, OrderKey};
use crate::orders::OrderSyncClient;

pub const EDIT_DEBOUNCE: Duration = Duration::from_millis(600);

pub struct OrderEditor {
    ctx: Arc<AppContext>,
    sync: Arc<OrderSyncClient>,
    debouncer: Debouncer<OrderKey>,
}

/// Parse a number field the way the input boxes do: leading integer digits,
/// anything unparsable is 0, negatives clamp to 0.
pub fn parse_count_input(input: &str) -> i64 {
    let s = input.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    let value = digits[..end].parse::<i64>().unwrap_or(0);
    if negative {
        0
    } else {
        value
    }
}

impl OrderEditor {
    pub fn new(ctx: Arc<AppContext>, sync: Arc<OrderSyncClient>) -> Self {
        Self {
            ctx,
            sync,
            debouncer: Debouncer::new(EDIT_DEBOUNCE),
        }
    }

    fn key_for(&self, vendor: &str, item: &str) -> OrderKey {
        let scope = self.ctx.scope();
        OrderKey::new(&scope.date, vendor, item, &scope.store_id)
    }

    fn current(&self, key: &OrderKey) -> Order {
        self.ctx.find_order(key).unwrap_or_else(|| Order::blank(key))
    }

    /// `+`/`-` buttons. Returns the new quantity.
    pub fn adjust_qty(&self, vendor: &str, item: &str, delta: i64) -> i64 {
        let key = self.key_for(vendor, item);
        let mut order = self.current(&key);
        order.qty = (order.qty + delta).max(0);
        let qty = order.qty;
        self.save(key, order);
        qty
    }

    pub fn set_qty(&self, vendor: &str, item: &str, input: &str) -> i64 {
        let key = self.key_for(vendor, item);
        let mut order = self.current(&key);
        order.qty = parse_count_input(input);
        let qty = order.qty;
        self.save(key, order);
        qty
    }

    pub fn set_stock(&self, vendor: &str, item: &str, input: &str) -> i64 {
        let key = self.key_for(vendor, item);
        let mut order = self.current(&key);
        order.stock = parse_count_input(input);
        let stock = order.stock;
        self.save(key, order);
        stock
    }

    pub fn set_prep(&self, vendor: &str, item: &str, input: &str) -> i64 {
        let key = self.key_for(vendor, item);
        let mut order = self.current(&key);
        let prep = parse_count_input(input);
        order.prep = Some(prep);
        self.save(key, order);
        prep
    }

    /// Prep-list checkbox. Written immediately, no debounce. `None` when no
    /// order exists for the item.
    pub async fn toggle_prep_checked(&self, vendor: &str, item: &str) -> Option<bool> {
        let key = self.key_for(vendor, item);
        let mut order = self.ctx.find_order(&key)?;
        let checked = !order.is_prep_checked();
        order.prep_checked = Some(checked);
        self.stamp(&mut order);
        self.ctx.update_order(order.clone());
        self.sync.upsert_order(&order).await;
        Some(checked)
    }

    fn stamp(&self, order: &mut Order) {
        order.updated_at = Utc::now().timestamp_millis();
        order.updated_by = Some(self.ctx.current_staff());
        order.store_id = Some(self.ctx.store_id());
    }

    fn save(&self, key: OrderKey, mut order: Order) {
        order.prep.get_or_insert(0);
        order.prep_checked.get_or_insert(false);
        self.stamp(&mut order);
        self.ctx.update_order(order.clone());

        let ctx = Arc::clone(&self.ctx);
        let sync = Arc::clone(&self.sync);
        let task_key = key.clone();
        self.debouncer.schedule(key, move || async move {
            // Latest in-memory state wins; the snapshot covers a list that
            // was replaced in the meantime.
            let latest = ctx.find_order(&task_key).unwrap_or(order);
            debug!(vendor = %latest.vendor, item = %latest.item, qty = latest.qty, "debounced write");
            sync.upsert_order(&latest).await;
        });
    }

    pub fn pending_writes(&self) -> usize {
        self.debouncer.pending_count()
    }

    /// Send every pending write now.
    pub async fn flush(&self) {
        self.debouncer.flush().await;
    }

    /// Drop pending writes without sending them.
    pub fn shutdown(&self) {
        self.debouncer.cancel_all();
    }
}
