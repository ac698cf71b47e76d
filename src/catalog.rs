//! Master editing helpers: bulk item entry, vendor JSON import, item
//! listing for the vendor selection and category colour keys.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::models::{Item, Master, Vendor, ALL_VENDORS_KEY, UNCATEGORIZED};

/// Colour keys offered for categories. Categories without an explicit colour
/// take the key at their position in the category order.
pub const CATEGORY_COLOR_KEYS: [&str; 11] = [
    "green", "blue", "amber", "violet", "rose", "sky", "emerald", "orange", "teal", "fuchsia",
    "gray",
];

pub const DEFAULT_COLOR_KEY: &str = "gray";

/// One item per line: `name unit price`. Missing unit is blank, an
/// unparsable price is 0, blank lines are skipped.
pub fn parse_bulk_items(text: &str) -> Vec<Item> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let unit = parts.next().unwrap_or_default();
            let price = parts.next().map(parse_leading_f64).unwrap_or(0.0);
            Item::new(name, unit, price)
        })
        .collect()
}

/// Leading decimal number of `s` (`"150円"` → 150), 0 when there is none.
fn parse_leading_f64(s: &str) -> f64 {
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in s.char_indices() {
        let ok = c.is_ascii_digit()
            || (c == '.' && !seen_dot)
            || (i == 0 && (c == '-' || c == '+'));
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        end = i + c.len_utf8();
    }
    s[..end]
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .unwrap_or(0.0)
}

/// Append bulk-entered items to `vendor`. Returns how many were added, or
/// `None` when the vendor does not exist.
pub fn add_bulk_items(master: &mut Master, vendor: &str, text: &str) -> Option<usize> {
    let target = master.vendors.iter_mut().find(|v| v.name == vendor)?;
    let items = parse_bulk_items(text);
    let added = items.len();
    target.items.extend(items);
    Some(added)
}

/// Parse an exported vendor list: `[{name, items:[{name, unit, price}]}]`.
/// Only numeric prices are kept.
pub fn import_vendors_json(text: &str) -> Result<Vec<Vendor>, ValidationError> {
    let json: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    let list = json.as_array().ok_or(ValidationError::NotAVendorArray)?;

    let str_field = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(list
        .iter()
        .map(|v| Vendor {
            name: str_field(v, "name"),
            items: v
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|it| Item {
                            name: str_field(it, "name"),
                            unit: str_field(it, "unit"),
                            price: it.get("price").and_then(Value::as_f64).unwrap_or(0.0),
                            category: None,
                            recipe: None,
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect())
}

/// Replace the vendor list, keeping category order and colours.
pub fn apply_vendor_import(master: &Master, vendors: Vec<Vendor>) -> Master {
    Master {
        vendors,
        ..master.clone()
    }
}

/// Items shown for a vendor selection, paired with their vendor name.
/// [`ALL_VENDORS_KEY`] lists every vendor's items in master order.
pub fn items_for_selection<'a>(master: &'a Master, selection: &str) -> Vec<(&'a str, &'a Item)> {
    master
        .vendors
        .iter()
        .filter(|v| selection == ALL_VENDORS_KEY || v.name == selection)
        .flat_map(|v| v.items.iter().map(move |item| (v.name.as_str(), item)))
        .collect()
}

/// Colour key for a category label.
pub fn category_color_key(
    label: &str,
    category_order: &[String],
    category_colors: Option<&BTreeMap<String, String>>,
) -> &'static str {
    if label.is_empty() || label == UNCATEGORIZED {
        return DEFAULT_COLOR_KEY;
    }
    if let Some(explicit) = category_colors
        .and_then(|colors| colors.get(label))
        .and_then(|wanted| {
            CATEGORY_COLOR_KEYS
                .iter()
                .copied()
                .find(|k| *k == wanted.as_str())
        })
    {
        return explicit;
    }
    category_order
        .iter()
        .position(|c| c == label)
        .map(|idx| CATEGORY_COLOR_KEYS[idx % CATEGORY_COLOR_KEYS.len()])
        .unwrap_or(DEFAULT_COLOR_KEY)
}

/// [`category_color_key`] for an item of `master`.
pub fn item_color_key(master: &Master, item: &Item) -> &'static str {
    category_color_key(
        item.category_label(),
        &master.category_order(),
        master.category_colors.as_ref(),
    )
}
