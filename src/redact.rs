//! Secret redaction for structured log fields
//!
//! Any map-shaped payload must pass through here before reaching a
//! tracing event. Redaction is by key name, recursively, so a careless
//! caller cannot leak a secret through nesting.

use serde_json::Value;

/// Sentinel emitted in place of a redacted value.
pub const REDACTED: &str = "[redacted]";

/// A key is sensitive when its lowercased form contains any of these.
const DEFAULT_BLACKLIST: &[&str] = &[
    "password",
    "secret",
    "token",
    "authorization",
    "api_key",
    "apikey",
    "api key",
    "signature",
    "credential",
    "cookie",
    "private_key",
];

/// Key-substring redactor with a configurable blacklist.
#[derive(Debug, Clone)]
pub struct Redactor {
    needles: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            needles: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Redactor {
    pub fn with_needles(needles: Vec<String>) -> Self {
        Self {
            needles: needles.into_iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    pub fn key_is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.needles.iter().any(|needle| key.contains(needle))
    }

    /// Replace the value of every sensitive key in place, descending
    /// into nested objects and arrays.
    pub fn redact_in_place(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if self.key_is_sensitive(key) {
                        *entry = Value::String(REDACTED.to_string());
                    } else {
                        self.redact_in_place(entry);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_in_place(item);
                }
            }
            _ => {}
        }
    }
}

/// Redact with the default blacklist and return the sanitized value.
pub fn redacted(mut value: Value) -> Value {
    Redactor::default().redact_in_place(&mut value);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_keys() {
        let out = redacted(json!({
            "email": "a@x.test",
            "password": "Abcd1234!",
            "webhook_signature": "deadbeef",
        }));
        assert_eq!(out["email"], "a@x.test");
        assert_eq!(out["password"], REDACTED);
        assert_eq!(out["webhook_signature"], REDACTED);
    }

    #[test]
    fn test_nested_maps_and_arrays() {
        let out = redacted(json!({
            "request": {
                "headers": [
                    { "authorization": "Bearer abc" },
                    { "accept": "application/json" },
                ],
                "body": { "proxy_credential": "aabbcc" },
            },
        }));
        assert_eq!(out["request"]["headers"][0]["authorization"], REDACTED);
        assert_eq!(out["request"]["headers"][1]["accept"], "application/json");
        assert_eq!(out["request"]["body"]["proxy_credential"], REDACTED);
    }

    #[test]
    fn test_substring_match_is_case_insensitive() {
        let out = redacted(json!({
            "X-Api-Key": "k",
            "USER_TOKEN": "t",
            "SecretSauce": "s",
        }));
        assert_eq!(out["X-Api-Key"], REDACTED);
        assert_eq!(out["USER_TOKEN"], REDACTED);
        assert_eq!(out["SecretSauce"], REDACTED);
    }

    #[test]
    fn test_non_string_values_also_replaced() {
        let out = redacted(json!({ "token": { "value": "v", "expires": 12 } }));
        assert_eq!(out["token"], REDACTED);
    }

    #[test]
    fn test_no_blacklisted_value_survives() {
        let redactor = Redactor::default();
        let mut value = json!({
            "a": { "password": "p1" },
            "b": [ { "c": { "api_key": "p2" } } ],
            "token": "p3",
        });
        redactor.redact_in_place(&mut value);
        let rendered = value.to_string();
        assert!(!rendered.contains("p1"));
        assert!(!rendered.contains("p2"));
        assert!(!rendered.contains("p3"));
    }

    #[test]
    fn test_custom_needles() {
        let redactor = Redactor::with_needles(vec!["PIN".into()]);
        let mut value = json!({ "card_pin": "1234", "password": "left-alone" });
        redactor.redact_in_place(&mut value);
        assert_eq!(value["card_pin"], REDACTED);
        assert_eq!(value["password"], "left-alone");
    }
}
