use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::error::BillingError;

type HmacSha256 = Hmac<Sha256>;

/// The only event type that carries a credit to apply.
pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";

/// Maximum accepted age of a signed payload, matching the provider SDK
/// default.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub object: CheckoutSession,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    /// Amount in the currency's minor unit (cents for USD).
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

impl CheckoutSession {
    pub fn customer_email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|details| details.email.as_deref())
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}

pub fn minor_units_to_usd(minor_units: i64) -> Decimal {
    Decimal::new(minor_units, 2)
}

/// Verifies the `t=...,v1=...` signature header and decodes the event.
/// Signature problems and payload problems are distinct terminal failures so
/// the handler can answer with the matching message.
pub fn construct_event(
    payload: &str,
    signature_header: &str,
    secret: &str,
    tolerance_secs: u64,
    now_epoch: u64,
) -> Result<WebhookEvent, BillingError> {
    verify_signature(payload, signature_header, secret, tolerance_secs, now_epoch)?;
    serde_json::from_str(payload).map_err(|err| BillingError::InvalidPayload(err.to_string()))
}

pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    tolerance_secs: u64,
    now_epoch: u64,
) -> Result<(), BillingError> {
    let (timestamp, signatures) = parse_signature_header(signature_header)?;

    if tolerance_secs > 0 && now_epoch.abs_diff(timestamp) > tolerance_secs {
        return Err(BillingError::InvalidSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    let signed_payload = format!("{timestamp}.{payload}");
    for signature in &signatures {
        let mut mac = mac_for(secret)?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }
    Err(BillingError::InvalidSignature(
        "no matching v1 signature".to_string(),
    ))
}

/// Builds a header the verifier accepts. Test harnesses and local clients
/// use this to exercise the webhook surface.
pub fn signature_header(
    payload: &str,
    secret: &str,
    timestamp: u64,
) -> Result<String, BillingError> {
    let mut mac = mac_for(secret)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(format!("t={timestamp},v1={}", hex_encode(&digest)))
}

fn mac_for(secret: &str) -> Result<HmacSha256, BillingError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::InvalidSignature("unusable webhook secret".to_string()))
}

fn parse_signature_header(header: &str) -> Result<(u64, Vec<Vec<u8>>), BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.trim().parse::<u64>().ok(),
            "v1" => {
                if let Some(bytes) = hex_decode(value.trim()) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        BillingError::InvalidSignature("missing or unparsable timestamp".to_string())
    })?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidSignature(
            "missing v1 signature".to_string(),
        ));
    }
    Ok((timestamp, signatures))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    let digits = raw.as_bytes();
    let mut out = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let high = (pair[0] as char).to_digit(16)?;
        let low = (pair[1] as char).to_digit(16)?;
        out.push(((high << 4) | low) as u8);
    }
    Some(out)
}
