use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

type HmacSha256 = Hmac<Sha256>;

/// Checks a `sha256=<hex>` header value against the raw request body.
pub fn verify_signature(header_value: Option<&str>, body: &[u8], app_secret: &str) -> bool {
    let Some(provided) = header_value
        .map(str::trim)
        .and_then(|value| value.strip_prefix("sha256="))
    else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Header value the provider would send for `body`.
pub fn sign_payload(body: &[u8], app_secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
