//! Runtime-config merging.
//!
//! The override wins at every field it sets. Mappings are merged key by key,
//! recursively; scalars and sequences from the override replace the base
//! value wholesale. `null` in the override means "not set" and leaves the
//! base untouched. Keys present on only one side are kept.

use serde_json::{Map, Value};

use crate::constants::RUNTIME_CONFIG_FIELDS;
use crate::error::{BakeError, Result};

/// Merge `overlay` onto `base` and check the result still reads as an OCI
/// runtime config.
pub fn merge_runtime_config(base: Value, overlay: &Value) -> Result<Value> {
    let base = match base {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            return Err(BakeError::Merge(format!(
                "base runtime config is not a mapping: {}",
                other
            )))
        }
    };
    if !overlay.is_object() {
        return Err(BakeError::Merge(format!(
            "config override is not a mapping: {}",
            overlay
        )));
    }
    check_override_fields(overlay).map_err(BakeError::Merge)?;

    let merged = deep_merge(base, overlay);
    serde_json::from_value::<oci_spec::image::Config>(merged.clone())
        .map_err(|e| BakeError::Merge(e.to_string()))?;
    Ok(merged)
}

/// Reject top-level override keys that are not runtime config fields.
///
/// Field names are case sensitive (`env` is not `Env`). Only the override is
/// checked; base images keep whatever fields they were built with.
pub fn check_override_fields(overlay: &Value) -> std::result::Result<(), String> {
    let Some(map) = overlay.as_object() else {
        return Ok(());
    };
    for key in map.keys() {
        if RUNTIME_CONFIG_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let hint = RUNTIME_CONFIG_FIELDS
            .iter()
            .find(|field| field.eq_ignore_ascii_case(key))
            .map(|field| format!(" (did you mean {}?)", field))
            .unwrap_or_default();
        return Err(format!("unknown runtime config field {:?}{}", key, hint));
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (base, Value::Null) => base,
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => deep_merge(Value::Null, value),
                };
                if !merged.is_null() {
                    base.insert(key.clone(), merged);
                }
            }
            Value::Object(base)
        }
        (_, overlay @ Value::Object(_)) => deep_merge(Value::Object(Map::new()), overlay),
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_override_scalar_keeps_other_fields() {
        let base = json!({"Env": ["A=1"], "WorkingDir": "/old"});
        let merged = merge_runtime_config(base, &json!({"WorkingDir": "/new"})).unwrap();
        assert_eq!(merged, json!({"Env": ["A=1"], "WorkingDir": "/new"}));
    }

    #[test]
    fn test_sequences_are_replaced() {
        let base = json!({"Env": ["A=1", "B=2"], "Cmd": ["sh"]});
        let merged = merge_runtime_config(base, &json!({"Env": ["C=3"]})).unwrap();
        assert_eq!(merged["Env"], json!(["C=3"]));
        assert_eq!(merged["Cmd"], json!(["sh"]));
    }

    #[test]
    fn test_mappings_merge_by_key() {
        let base = json!({"Labels": {"a": "1", "b": "2"}, "ExposedPorts": {"80/tcp": {}}});
        let overlay = json!({"Labels": {"b": "two", "c": "3"}, "ExposedPorts": {"443/tcp": {}}});
        let merged = merge_runtime_config(base, &overlay).unwrap();
        assert_eq!(merged["Labels"], json!({"a": "1", "b": "two", "c": "3"}));
        assert_eq!(merged["ExposedPorts"], json!({"80/tcp": {}, "443/tcp": {}}));
    }

    #[test]
    fn test_null_override_is_ignored() {
        let base = json!({"User": "root"});
        let merged = merge_runtime_config(base, &json!({"User": null})).unwrap();
        assert_eq!(merged, json!({"User": "root"}));
    }

    #[test]
    fn test_empty_base() {
        let merged = merge_runtime_config(Value::Null, &json!({"Entrypoint": ["/app"]})).unwrap();
        assert_eq!(merged, json!({"Entrypoint": ["/app"]}));
    }

    #[test]
    fn test_invalid_result_is_merge_error() {
        let err = merge_runtime_config(json!({}), &json!({"Env": "A=1"})).unwrap_err();
        assert!(matches!(err, BakeError::Merge(_)));
    }

    #[test]
    fn test_misspelled_field_rejected() {
        let err = merge_runtime_config(json!({}), &json!({"Workingdir": "/srv"})).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, BakeError::Merge(_)));
        assert!(msg.contains("Workingdir"));
        assert!(msg.contains("did you mean WorkingDir"));
    }

    #[test]
    fn test_unknown_base_fields_survive() {
        let base = json!({"Hostname": "", "X-Vendor": "kept"});
        let merged = merge_runtime_config(base, &json!({"User": "app"})).unwrap();
        assert_eq!(merged["X-Vendor"], json!("kept"));
        assert_eq!(merged["User"], json!("app"));
    }

    #[test]
    fn test_check_override_fields() {
        assert!(check_override_fields(&json!({"Env": [], "Labels": {"x": "y"}})).is_ok());
        assert!(check_override_fields(&json!({"Labels": {"anything": "goes"}})).is_ok());
        let msg = check_override_fields(&json!({"env": ["A=1"]})).unwrap_err();
        assert!(msg.contains("did you mean Env"));
        let msg = check_override_fields(&json!({"Bogus": 1})).unwrap_err();
        assert!(!msg.contains("did you mean"));
    }

    #[test]
    fn test_non_mapping_override_rejected() {
        assert!(matches!(
            merge_runtime_config(json!({}), &json!(["x"])).unwrap_err(),
            BakeError::Merge(_)
        ));
    }
}
