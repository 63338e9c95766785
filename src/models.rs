use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Accepts strings, numbers and booleans as text; anything else is treated as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Reads an object; a value of any other shape, or one that fails to parse, is absent.
fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

/// Reads a list of objects, skipping entries that are not objects. Anything
/// other than a list is empty.
fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// Subset of a Shopify `orders/create` payload that the relay reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopifyOrder {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub shipping_address: Option<ShopifyAddress>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub line_items: Vec<ShopifyLineItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopifyAddress {
    #[serde(default, deserialize_with = "lenient_string")]
    pub first_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub address1: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub address2: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub zip: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub country_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopifyLineItem {
    #[serde(default, deserialize_with = "lenient_string")]
    pub sku: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    /// Kept raw; the transformer coerces it.
    #[serde(default)]
    pub quantity: Option<Value>,
}

/// Order request accepted by the InnoCigs intake API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnoCigsOrder {
    pub order_id: String,
    pub email: String,
    pub phone: String,
    pub shipping_address: InnoCigsAddress,
    pub items: Vec<InnoCigsItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnoCigsAddress {
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub street: String,
    pub street2: String,
    pub zip: String,
    pub city: String,
    pub country_code: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnoCigsItem {
    /// Shopify SKU, used as the InnoCigs article number without mapping.
    pub article_id: String,
    pub quantity: u32,
}

/// Headers Shopify sends with every webhook delivery.
#[derive(Debug, Clone, Default)]
pub struct WebhookMeta {
    pub hmac: Option<String>,
    pub content_type: Option<String>,
    pub topic: Option<String>,
    pub shop_domain: Option<String>,
    pub webhook_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallQuery {
    pub shop: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenExchangeRequest<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub code: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenExchangeResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
}
