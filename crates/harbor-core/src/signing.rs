//! # Request Signing
//!
//! Deterministic canonical serialization plus HMAC-SHA256 for outbound
//! device requests.
//!
//! ## Signature Construction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  payload (JSON) ──► canonical_json ──► {"a":1,"b":[2,1],"c":{"x":0}}    │
//! │                      keys sorted, arrays in order, no whitespace        │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │  message = canonical || nonce                                           │
//! │                                   │                                     │
//! │  secret (hex) ──► bytes ──► HMAC-SHA256(message) ──► lowercase hex      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The backend recomputes the same signature from the received body, so the
//! canonical form must not depend on how the payload was built.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Serializes `value` with object keys sorted recursively and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (idx, (key, val)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Signs `payload || nonce` with the hex-encoded `secret`.
///
/// ## Example
/// ```rust
/// use harbor_core::signing::sign;
/// use serde_json::json;
///
/// let a = sign(&json!({"a": 1, "b": 2}), "n-1", "00ff").unwrap();
/// let b = sign(&json!({"b": 2, "a": 1}), "n-1", "00ff").unwrap();
/// assert_eq!(a, b);
/// ```
pub fn sign(payload: &Value, nonce: &str, secret: &str) -> CoreResult<String> {
    Ok(RequestSigner::from_hex(secret)?.sign(payload, nonce))
}

/// HMAC signer holding the decoded device secret.
#[derive(Clone)]
pub struct RequestSigner {
    mac: HmacSha256,
}

impl RequestSigner {
    /// Decodes the persisted hex secret.
    pub fn from_hex(secret: &str) -> CoreResult<Self> {
        let key = hex::decode(secret.trim())
            .map_err(|e| CoreError::InvalidSecret(e.to_string()))?;
        if key.is_empty() {
            return Err(CoreError::InvalidSecret("secret is empty".to_string()));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(&key)
            .map_err(|e| CoreError::InvalidSecret(e.to_string()))?;
        Ok(RequestSigner { mac })
    }

    /// Returns the lowercase hex HMAC of `canonical(payload) || nonce`.
    pub fn sign(&self, payload: &Value, nonce: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(canonical_json(payload).as_bytes());
        mac.update(nonce.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, payload: &Value, nonce: &str, signature_hex: &str) -> bool {
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(canonical_json(payload).as_bytes());
        mac.update(nonce.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "8f2a55c1d3e4b6a7980f1e2d3c4b5a69";

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({"b": {"z": 1, "a": [3, {"y": 2, "x": 1}]}, "a": "s"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"s","b":{"a":[3,{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_canonical_json_preserves_array_order() {
        assert_eq!(canonical_json(&json!([3, 1, 2])), "[3,1,2]");
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn test_sign_invariant_to_key_order() {
        let mut first = serde_json::Map::new();
        first.insert("a".into(), json!(1));
        first.insert("b".into(), json!(2));
        let mut second = serde_json::Map::new();
        second.insert("b".into(), json!(2));
        second.insert("a".into(), json!(1));

        let s1 = sign(&Value::Object(first), "nonce-1", SECRET).unwrap();
        let s2 = sign(&Value::Object(second), "nonce-1", SECRET).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_sign_is_deterministic_lowercase_hex() {
        let payload = json!({"device_id": "d-1", "since": "42"});
        let s1 = sign(&payload, "n", SECRET).unwrap();
        let s2 = sign(&payload, "n", SECRET).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), 64);
        assert!(s1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sign_depends_on_nonce_and_secret() {
        let payload = json!({"a": 1});
        let base = sign(&payload, "n1", SECRET).unwrap();
        assert_ne!(base, sign(&payload, "n2", SECRET).unwrap());
        assert_ne!(base, sign(&payload, "n1", "00112233").unwrap());
    }

    #[test]
    fn test_matches_manual_hmac() {
        let payload = json!({"b": 2, "a": 1});
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&hex::decode(SECRET).unwrap()).unwrap();
        mac.update(br#"{"a":1,"b":2}nonce"#);
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sign(&payload, "nonce", SECRET).unwrap(), expected);
    }

    #[test]
    fn test_malformed_secret_fails() {
        assert!(matches!(
            sign(&json!({}), "n", "not-hex"),
            Err(CoreError::InvalidSecret(_))
        ));
        assert!(matches!(
            sign(&json!({}), "n", "abc"),
            Err(CoreError::InvalidSecret(_))
        ));
        assert!(matches!(
            sign(&json!({}), "n", ""),
            Err(CoreError::InvalidSecret(_))
        ));
    }

    #[test]
    fn test_verify() {
        let signer = RequestSigner::from_hex(SECRET).unwrap();
        let payload = json!({"x": [1, 2]});
        let sig = signer.sign(&payload, "n");
        assert!(signer.verify(&payload, "n", &sig));
        assert!(!signer.verify(&payload, "other", &sig));
        assert!(!signer.verify(&payload, "n", "zz"));
    }
}
