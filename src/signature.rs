//! HMAC-SHA256 helpers for Shopify webhook bodies and OAuth callback queries.
//!
//! Webhooks carry a base64 digest of the raw request body in
//! `X-Shopify-Hmac-Sha256`. OAuth callbacks carry a hex digest of the other
//! query parameters in `hmac`. Both comparisons run in constant time.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Query parameters never included in the signed message.
pub const SIGNATURE_PARAMS: [&str; 2] = ["hmac", "signature"];

fn mac_for(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, so `new_from_slice` cannot fail here.
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any size"),
    }
}

/// Base64 HMAC-SHA256 of `body`, the format Shopify uses for webhooks.
pub fn compute_hmac_base64(body: &[u8], secret: &str) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Lowercase hex HMAC-SHA256 of `message`, the format of the OAuth `hmac` parameter.
pub fn compute_hmac_hex(message: &str, secret: &str) -> String {
    let mut mac = mac_for(secret);
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Checks a webhook signature against the exact bytes that were received.
///
/// `body` must be the unparsed request body. Re-serialized JSON will not
/// match what the sender signed.
pub fn verify_webhook_signature(body: &[u8], claimed: Option<&str>, secret: &str) -> bool {
    let Some(claimed) = claimed.map(str::trim).filter(|c| !c.is_empty()) else {
        return false;
    };
    let expected = compute_hmac_base64(body, secret);
    constant_time_eq(&expected, claimed)
}

/// Builds the message Shopify signs for OAuth redirects.
///
/// Parameters named in [`SIGNATURE_PARAMS`] or `excluded` are dropped, the
/// rest are sorted by key and joined as `key=value` with `&`. Repeated keys
/// (including `ids[]=1&ids[]=2`) are comma-joined in arrival order under
/// the bare key.
pub fn signable_message<'a, I>(params: I, excluded: &[&str]) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (key, value) in params {
        let key = key.strip_suffix("[]").unwrap_or(key);
        if SIGNATURE_PARAMS.contains(&key) || excluded.contains(&key) {
            continue;
        }
        grouped.entry(key).or_default().push(value);
    }

    grouped
        .into_iter()
        .map(|(key, values)| format!("{key}={}", values.join(",")))
        .collect::<Vec<_>>()
        .join("&")
}

/// Verifies the `hmac` parameter of an OAuth callback query.
pub fn verify_query_signature(params: &[(String, String)], secret: &str) -> bool {
    let Some((_, claimed)) = params.iter().find(|(k, _)| k == "hmac") else {
        return false;
    };
    let message = signable_message(params.iter().map(|(k, v)| (k.as_str(), v.as_str())), &[]);
    let expected = compute_hmac_hex(&message, secret);
    constant_time_eq(&expected, claimed)
}
