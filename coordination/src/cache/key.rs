//! Content-addressed cache keys

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Deterministic key for `(owner, params, file_contents)`.
///
/// Object keys are sorted at every depth before hashing, so logically equal
/// inputs produce the same key regardless of how they were assembled.
pub fn compute_key(
    owner: &str,
    params: &Value,
    file_contents: &HashMap<String, String>,
) -> String {
    let files: Map<String, Value> = file_contents
        .iter()
        .map(|(path, content)| (path.clone(), Value::String(content.clone())))
        .collect();

    let mut input = Map::new();
    input.insert("owner".to_string(), Value::String(owner.to_string()));
    input.insert("params".to_string(), params.clone());
    input.insert("files".to_string(), Value::Object(files));

    let canonical = canonicalize(&Value::Object(input)).to_string();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// Rebuild `value` with object keys inserted in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn files(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_is_order_insensitive() {
        let a: Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": [1, {"q": 2, "p": 3}], "x": null}}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"a": {"x": null, "y": [1, {"p": 3, "q": 2}]}, "b": 1}"#)
                .unwrap();
        let fa = files(&[("src/a.rs", "fn a() {}"), ("src/b.rs", "fn b() {}")]);
        let fb = files(&[("src/b.rs", "fn b() {}"), ("src/a.rs", "fn a() {}")]);

        assert_eq!(compute_key("wf", &a, &fa), compute_key("wf", &b, &fb));
    }

    #[test]
    fn test_key_is_idempotent_hex() {
        let params = json!({"lang": "rust"});
        let k1 = compute_key("wf", &params, &HashMap::new());
        let k2 = compute_key("wf", &params, &HashMap::new());
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_distinguishes_inputs() {
        let params = json!({"lang": "rust"});
        let base = compute_key("wf", &params, &HashMap::new());
        assert_ne!(base, compute_key("other", &params, &HashMap::new()));
        assert_ne!(base, compute_key("wf", &json!({"lang": "go"}), &HashMap::new()));
        assert_ne!(
            base,
            compute_key("wf", &params, &files(&[("a.rs", "x")]))
        );
        // Array order is significant
        assert_ne!(
            compute_key("wf", &json!([1, 2]), &HashMap::new()),
            compute_key("wf", &json!([2, 1]), &HashMap::new())
        );
    }
}
