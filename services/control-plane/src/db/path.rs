//! Dotted-path access into JSON documents (`k8s.deploymentMap.main`).

use serde_json::{Map, Value};

use super::StoreError;

/// Split a dotted path into its segments.
pub fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    if path.is_empty() {
        return Err(StoreError::InvalidDocument("empty path".to_string()));
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StoreError::InvalidDocument(format!("malformed path '{path}'")));
    }
    Ok(parts)
}

/// Read the value at `path`. Missing intermediate objects yield `None`.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Intermediate `null`s are replaced by objects; any other non-object
/// intermediate is an error.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let parts = segments(path)?;
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| StoreError::InvalidDocument("empty path".to_string()))?;

    let mut current = doc;
    for segment in parents {
        current = object_mut(current, path)?
            .entry((*segment).to_string())
            .or_insert(Value::Null);
    }
    object_mut(current, path)?.insert((*last).to_string(), value);
    Ok(())
}

/// Remove the value at `path`. Returns whether something was removed.
pub fn unset_path(doc: &mut Value, path: &str) -> bool {
    let (parents, last) = path.rsplit_once('.').unwrap_or(("", path));

    let parent = if parents.is_empty() {
        Some(doc)
    } else {
        parents
            .split('.')
            .try_fold(doc, |current, segment| current.as_object_mut()?.get_mut(segment))
    };

    parent
        .and_then(Value::as_object_mut)
        .and_then(|map| map.remove(last))
        .is_some()
}

fn object_mut<'a>(value: &'a mut Value, path: &str) -> Result<&'a mut Map<String, Value>, StoreError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidDocument(format!("path '{path}' crosses a non-object value")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested() {
        let doc = json!({"k8s": {"deploymentMap": {"main": {"name": "web"}}}});
        assert_eq!(
            get_path(&doc, "k8s.deploymentMap.main.name"),
            Some(&json!("web"))
        );
        assert_eq!(get_path(&doc, "k8s.serviceMap.main"), None);
        assert_eq!(get_path(&doc, "k8s.deploymentMap.main.name.x"), None);
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = json!({"id": "a", "k8s": null});
        set_path(&mut doc, "k8s.deploymentMap.main", json!({"name": "web"})).unwrap();
        assert_eq!(doc["k8s"]["deploymentMap"]["main"]["name"], "web");
    }

    #[test]
    fn test_set_rejects_scalar_intermediate() {
        let mut doc = json!({"name": "web"});
        let err = set_path(&mut doc, "name.first", json!(1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[test]
    fn test_set_rejects_malformed_path() {
        let mut doc = json!({});
        assert!(set_path(&mut doc, "a..b", json!(1)).is_err());
        assert!(set_path(&mut doc, "", json!(1)).is_err());
    }

    #[test]
    fn test_unset() {
        let mut doc = json!({"activities": {"updating": {}, "repairing": {}}, "top": 1});
        assert!(unset_path(&mut doc, "activities.updating"));
        assert!(!unset_path(&mut doc, "activities.updating"));
        assert!(unset_path(&mut doc, "top"));
        assert!(!unset_path(&mut doc, "missing.deep.path"));
        assert_eq!(doc, json!({"activities": {"repairing": {}}}));
    }
}
