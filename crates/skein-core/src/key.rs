//! Structural keys used for deduplication.
//!
//! Both the server (batch dedup, cache keys) and the client (in-flight dedup) need
//! identical calls to map to identical keys, so object keys are always emitted in
//! sorted order regardless of how the `Value` was built.

use serde_json::Value;

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Key identifying a call by its resource and positional arguments.
pub fn structural_key(resource: &str, args: &[Value]) -> String {
    let mut key = String::with_capacity(resource.len() + 16);
    key.push_str(resource);
    key.push(':');
    key.push('[');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        write_canonical(arg, &mut key);
    }
    key.push(']');
    key
}

/// Hex BLAKE3 digest of arbitrary key material.
pub fn hash_key(material: &[u8]) -> String {
    blake3::hash(material).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_key_order_does_not_matter() {
        let mut a = serde_json::Map::new();
        a.insert("z".into(), json!(1));
        a.insert("a".into(), json!({"y": 2, "b": [3, {"d": 4, "c": 5}]}));
        let mut b = serde_json::Map::new();
        b.insert("a".into(), json!({"b": [3, {"c": 5, "d": 4}], "y": 2}));
        b.insert("z".into(), json!(1));

        assert_eq!(
            canonical_json(&Value::Object(a)),
            canonical_json(&Value::Object(b))
        );
    }

    #[test]
    fn canonical_form_is_valid_json() {
        let v = json!({"b": "quote\"d", "a": [null, true, 1.5, "x"]});
        let parsed: Value = serde_json::from_str(&canonical_json(&v)).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn structural_key_separates_resource_and_args() {
        assert_eq!(structural_key("math.add", &[json!(2), json!(3)]), "math.add:[2,3]");
        assert_ne!(
            structural_key("math.add", &[json!(2), json!(3)]),
            structural_key("math.add", &[json!(3), json!(2)])
        );
        assert_ne!(
            structural_key("math.add", &[json!("2")]),
            structural_key("math.add", &[json!(2)])
        );
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = hash_key(b"math.add:[2,3]");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_key(b"math.add:[2,3]"));
        assert_ne!(h, hash_key(b"math.add:[2,4]"));
    }
}
