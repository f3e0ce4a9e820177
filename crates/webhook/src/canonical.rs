//! Canonical JSON and payload signing.
//!
//! Canonical form: object keys sorted lexicographically at every depth,
//! no insignificant whitespace. Signatures are HMAC-SHA256 over the
//! canonical bytes, rendered as `sha256=<hex>`.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Sign a canonical payload with a shared secret.
pub fn sign(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a received signature.
pub fn verify(payload: &str, signature: &str, secret: &str) -> bool {
    let Some(received_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(received) = hex::decode(received_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&received).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_depth() {
        let value = json!({
            "zulu": 1,
            "alpha": { "delta": [1, 2], "bravo": "x" },
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"bravo":"x","delta":[1,2]},"zulu":1}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let value = json!({ "a": [1, {"b": 2}], "c": "d e" });
        let canonical = canonical_json(&value);
        assert!(!canonical.contains(": "));
        assert!(!canonical.contains(", "));
        assert!(canonical.contains("d e"));
    }

    #[test]
    fn sign_verify_round_trip() {
        let payload = canonical_json(&json!({"event": "session_ended", "data": {}}));
        let sig = sign(&payload, "secret");
        assert!(sig.starts_with("sha256="));
        assert!(verify(&payload, &sig, "secret"));
        assert!(!verify(&payload, &sig, "other-secret"));
    }

    #[test]
    fn any_mutated_byte_invalidates_the_signature() {
        let payload = canonical_json(&json!({"event": "session_ended", "n": 42}));
        let sig = sign(&payload, "secret");

        let mut tampered = payload.clone().into_bytes();
        tampered[10] ^= 0x01;
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(!verify(&tampered, &sig, "secret"));
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        assert!(!verify("payload", "md5=abcd", "secret"));
        assert!(!verify("payload", "sha256=nothex", "secret"));
    }
}
