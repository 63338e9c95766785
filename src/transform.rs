use serde_json::Value;

use crate::models::{
    InnoCigsAddress, InnoCigsItem, InnoCigsOrder, ShopifyAddress, ShopifyLineItem, ShopifyOrder,
};

pub const DEFAULT_COUNTRY_CODE: &str = "DE";

/// Maps a Shopify order onto an InnoCigs order request.
///
/// Never fails: absent fields become empty strings, an absent country code
/// becomes [`DEFAULT_COUNTRY_CODE`] and unreadable quantities become 0.
pub fn to_innocigs_order(order: &ShopifyOrder) -> InnoCigsOrder {
    let shipping = order.shipping_address.as_ref();

    let phone = shipping
        .and_then(|a| non_empty(&a.phone))
        .or_else(|| non_empty(&order.phone))
        .unwrap_or_default();

    InnoCigsOrder {
        order_id: text(&order.id),
        email: text(&order.email),
        phone: phone.clone(),
        shipping_address: shipping
            .map(|a| address(a, &phone))
            .unwrap_or_else(|| InnoCigsAddress {
                country_code: DEFAULT_COUNTRY_CODE.to_string(),
                phone,
                ..InnoCigsAddress::default()
            }),
        items: order.line_items.iter().map(item).collect(),
    }
}

fn address(source: &ShopifyAddress, phone: &str) -> InnoCigsAddress {
    let parts = (non_empty(&source.first_name), non_empty(&source.last_name));
    let (first_name, last_name) = match parts {
        (None, None) => split_name(source.name.as_deref().unwrap_or_default()),
        (first, last) => (first.unwrap_or_default(), last.unwrap_or_default()),
    };

    InnoCigsAddress {
        first_name,
        last_name,
        company: text(&source.company),
        street: text(&source.address1),
        street2: text(&source.address2),
        zip: text(&source.zip),
        city: text(&source.city),
        country_code: non_empty(&source.country_code)
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_string()),
        phone: phone.to_string(),
    }
}

fn item(line: &ShopifyLineItem) -> InnoCigsItem {
    InnoCigsItem {
        article_id: text(&line.sku),
        quantity: line.quantity.as_ref().map_or(0, coerce_quantity),
    }
}

/// Integers and integer strings pass through; everything else is 0.
pub fn coerce_quantity(raw: &Value) -> u32 {
    match raw {
        Value::Number(n) => n.as_u64().and_then(|q| u32::try_from(q).ok()).unwrap_or(0),
        Value::String(s) => s.trim().parse::<u32>().unwrap_or(0),
        _ => 0,
    }
}

/// "Erika Mustermann-Gabler" -> ("Erika", "Mustermann-Gabler").
fn split_name(full: &str) -> (String, String) {
    let full = full.trim();
    match full.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (full.to_string(), String::new()),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn text(value: &Option<String>) -> String {
    non_empty(value).unwrap_or_default()
}
