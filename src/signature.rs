//! HMAC-SHA256 signatures for gateway and payout callbacks.
//!
//! The signed message is the pipe-joined parts, e.g. `order_id|payment_id`.
//! Signatures are produced as lowercase hex; verification also accepts
//! standard base64, since gateways differ on the encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str, parts: &[&str]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(parts.join("|").as_bytes());
    mac
}

/// Hex signature over `parts`
pub fn sign(secret: &str, parts: &[&str]) -> String {
    hex::encode(mac_for(secret, parts).finalize().into_bytes())
}

/// Constant-time check of a hex or base64 signature over `parts`
pub fn verify(secret: &str, parts: &[&str], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let signature = signature.trim();
    let provided = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => match STANDARD.decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        },
    };
    mac_for(secret, parts).verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_signature_round_trips() {
        let sig = sign("secret", &["order_1", "pay_1"]);
        assert_eq!(sig.len(), 64);
        assert!(verify("secret", &["order_1", "pay_1"], &sig));
    }

    #[test]
    fn base64_encoding_is_accepted() {
        let hex_sig = sign("secret", &["order_1", "pay_1"]);
        let b64 = STANDARD.encode(hex::decode(&hex_sig).unwrap());
        assert!(verify("secret", &["order_1", "pay_1"], &b64));
    }

    #[test]
    fn tampering_any_part_fails() {
        let sig = sign("secret", &["order_1", "pay_1"]);
        assert!(!verify("secret", &["order_2", "pay_1"], &sig));
        assert!(!verify("secret", &["order_1", "pay_2"], &sig));
        assert!(!verify("other", &["order_1", "pay_1"], &sig));
        assert!(!verify("secret", &["order_1", "pay_1"], "not-a-signature"));
    }

    #[test]
    fn empty_secret_never_verifies() {
        let sig = sign("", &["order_1", "pay_1"]);
        assert!(!verify("", &["order_1", "pay_1"], &sig));
    }
}
