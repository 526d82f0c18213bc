//! Typed reads from schema-less objects.
//!
//! Cluster resources that are not part of k8s-openapi (MultiClusterEngine,
//! ManagedCluster, ...) are handled as `DynamicObject`s. Their nested fields
//! are read through [`Document`], which reports a missing or mistyped field as
//! a [`FieldError`] instead of panicking.

use kube::api::DynamicObject;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("field `{0}` is missing")]
    Missing(String),

    #[error("field `{path}` is not a {expected}")]
    WrongType { path: String, expected: &'static str },
}

impl FieldError {
    pub fn is_missing(&self) -> bool {
        matches!(self, FieldError::Missing(_))
    }
}

/// Read-only view over an untyped JSON document
#[derive(Clone, Copy, Debug)]
pub struct Document<'a> {
    value: &'a Value,
}

impl<'a> Document<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    /// The data of a dynamic object (everything besides apiVersion, kind and metadata)
    pub fn of(obj: &'a DynamicObject) -> Self {
        Self::new(&obj.data)
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    /// Walk down a chain of object keys
    pub fn lookup(&self, path: &[&str]) -> Result<&'a Value, FieldError> {
        let mut current = self.value;
        for (depth, key) in path.iter().enumerate() {
            let next = match current {
                Value::Object(map) => map.get(*key),
                Value::Null => None,
                _ => {
                    return Err(FieldError::WrongType {
                        path: join(&path[..depth]),
                        expected: "object",
                    });
                }
            };
            current = match next {
                Some(Value::Null) | None => {
                    return Err(FieldError::Missing(join(&path[..=depth])));
                }
                Some(v) => v,
            };
        }
        Ok(current)
    }

    pub fn str(&self, path: &[&str]) -> Result<&'a str, FieldError> {
        self.lookup(path)?.as_str().ok_or_else(|| FieldError::WrongType {
            path: join(path),
            expected: "string",
        })
    }

    pub fn bool(&self, path: &[&str]) -> Result<bool, FieldError> {
        self.lookup(path)?.as_bool().ok_or_else(|| FieldError::WrongType {
            path: join(path),
            expected: "boolean",
        })
    }

    pub fn array(&self, path: &[&str]) -> Result<&'a Vec<Value>, FieldError> {
        self.lookup(path)?.as_array().ok_or_else(|| FieldError::WrongType {
            path: join(path),
            expected: "array",
        })
    }

    /// Like [`Document::lookup`] but a missing field is `Ok(None)`
    pub fn optional<T>(result: Result<T, FieldError>) -> Result<Option<T>, FieldError> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_missing() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn join(path: &[&str]) -> String {
    if path.is_empty() {
        ".".to_string()
    } else {
        path.join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> Value {
        json!({
            "spec": {
                "overrides": {
                    "components": [
                        {"name": "managedserviceaccount", "enabled": true},
                        {"name": "cluster-proxy-addon", "enabled": "yes"}
                    ]
                },
                "availabilityConfig": null
            }
        })
    }

    #[test]
    fn reads_nested_values() {
        let value = engine();
        let doc = Document::new(&value);
        let components = doc.array(&["spec", "overrides", "components"]).unwrap();
        assert_eq!(components.len(), 2);
        let first = Document::new(&components[0]);
        assert_eq!(first.str(&["name"]).unwrap(), "managedserviceaccount");
        assert!(first.bool(&["enabled"]).unwrap());
    }

    #[test]
    fn missing_fields_are_reported_not_panicked() {
        let value = engine();
        let doc = Document::new(&value);
        assert_eq!(
            doc.array(&["spec", "targetNamespace", "components"]),
            Err(FieldError::Missing("spec.targetNamespace".into()))
        );
        assert_eq!(
            doc.lookup(&["spec", "availabilityConfig"]),
            Err(FieldError::Missing("spec.availabilityConfig".into()))
        );
        assert_eq!(Document::optional(doc.str(&["status", "phase"])), Ok(None));
    }

    #[test]
    fn wrong_types_are_reported() {
        let value = engine();
        let doc = Document::new(&value);
        let components = doc.array(&["spec", "overrides", "components"]).unwrap();
        let second = Document::new(&components[1]);
        assert_eq!(
            second.bool(&["enabled"]),
            Err(FieldError::WrongType {
                path: "enabled".into(),
                expected: "boolean"
            })
        );
        assert!(matches!(
            doc.lookup(&["spec", "overrides", "components", "name"]),
            Err(FieldError::WrongType { .. })
        ));
    }
}
