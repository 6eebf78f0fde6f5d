//! Attributes and the resource descriptor shared by every signal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Resource key carrying the logical service name.
pub const SERVICE_NAME: &str = "service.name";
/// Resource key identifying one running instance of a service.
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";
/// Resource key carrying the service version.
pub const SERVICE_VERSION: &str = "service.version";
/// Resource key carrying the deployment environment.
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";
/// Service name reported when a producer did not set one.
pub const UNKNOWN_SERVICE: &str = "unknown_service";

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// String value.
    String(String),
}

impl AttributeValue {
    /// Returns the value as a string slice if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Rough heap footprint in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            _ => 0,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

/// An ordered set of attributes with unique keys.
///
/// Insertion order is preserved so that records leave the pipeline with their
/// attributes in the order the producer sent them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Vec<(String, AttributeValue)>);

impl Attributes {
    /// Creates an empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an attribute, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.upsert(key, value);
        self
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when there are no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up an attribute by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Looks up a string attribute by key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttributeValue::as_str)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Inserts the attribute only if the key is absent. Returns true if inserted.
    pub fn insert_if_absent(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.0.push((key, value.into()));
        true
    }

    /// Replaces the value of an existing key. Returns true if the key existed.
    pub fn update_existing(&mut self, key: &str, value: impl Into<AttributeValue>) -> bool {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => {
                *v = value.into();
                true
            }
            None => false,
        }
    }

    /// Inserts or replaces an attribute, keeping the original position on replace.
    pub fn upsert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let value = value.into();
        if !self.update_existing(&key, value.clone()) {
            self.0.push((key, value));
        }
    }

    /// Removes an attribute, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    /// Iterates over the attributes in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Rough heap footprint in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        self.0
            .iter()
            .map(|(k, v)| k.len() + v.estimated_size() + std::mem::size_of::<(String, AttributeValue)>())
            .sum()
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Self::new();
        for (k, v) in iter {
            attributes.upsert(k, v);
        }
        attributes
    }
}

/// Immutable description of the process that produced a signal.
///
/// One `Resource` is decoded per resource block of an export request and then
/// shared by reference between all of its records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    attributes: Attributes,
}

impl Resource {
    /// Creates a resource from an attribute set.
    #[must_use]
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }

    /// Creates a resource carrying only a service name.
    #[must_use]
    pub fn for_service(name: impl Into<String>) -> Self {
        Self::new(Attributes::new().with(SERVICE_NAME, name.into()))
    }

    /// Returns a copy with one extra attribute, builder style.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.upsert(key, value);
        self
    }

    /// Wraps the resource for sharing between records.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The resource attributes.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Consumes the resource, returning its attributes.
    #[must_use]
    pub fn into_attributes(self) -> Attributes {
        self.attributes
    }

    /// The service name used as the cross-signal join key.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.attributes
            .get_str(SERVICE_NAME)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SERVICE)
    }

    /// The service instance id, if set.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.attributes.get_str(SERVICE_INSTANCE_ID)
    }

    /// The service version, if set.
    #[must_use]
    pub fn service_version(&self) -> Option<&str> {
        self.attributes.get_str(SERVICE_VERSION)
    }

    /// The deployment environment, if set.
    #[must_use]
    pub fn environment(&self) -> Option<&str> {
        self.attributes.get_str(DEPLOYMENT_ENVIRONMENT)
    }

    /// Identity of the producer session: service name plus instance id.
    #[must_use]
    pub fn identity(&self) -> String {
        match self.instance_id() {
            Some(instance) => format!("{}/{instance}", self.service_name()),
            None => self.service_name().to_string(),
        }
    }

    /// Rough heap footprint in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        self.attributes.estimated_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_preserve_insertion_order() {
        let attrs = Attributes::new()
            .with("b", 1)
            .with("a", "x")
            .with("c", true);
        let keys: Vec<&str> = attrs.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_upsert_keeps_position() {
        let mut attrs = Attributes::new().with("a", 1).with("b", 2);
        attrs.upsert("a", 10);
        assert_eq!(attrs.iter().next(), Some(("a", &AttributeValue::Int(10))));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn test_insert_if_absent_does_not_overwrite() {
        let mut attrs = Attributes::new().with("env", "prod");
        assert!(!attrs.insert_if_absent("env", "lab"));
        assert!(attrs.insert_if_absent("region", "eu"));
        assert_eq!(attrs.get_str("env"), Some("prod"));
        assert_eq!(attrs.get_str("region"), Some("eu"));
    }

    #[test]
    fn test_update_existing_ignores_missing_key() {
        let mut attrs = Attributes::new();
        assert!(!attrs.update_existing("missing", "v"));
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut attrs = Attributes::new().with("a", 1).with("b", 2);
        assert_eq!(attrs.remove("a"), Some(AttributeValue::Int(1)));
        assert_eq!(attrs.remove("a"), None);
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_service_name_falls_back_to_unknown() {
        assert_eq!(Resource::default().service_name(), UNKNOWN_SERVICE);
        assert_eq!(Resource::for_service("").service_name(), UNKNOWN_SERVICE);
        assert_eq!(Resource::for_service("checkout").service_name(), "checkout");
    }

    #[test]
    fn test_identity_includes_instance() {
        let resource = Resource::for_service("api").with_attribute(SERVICE_INSTANCE_ID, "pod-1");
        assert_eq!(resource.identity(), "api/pod-1");
        assert_eq!(Resource::for_service("api").identity(), "api");
    }

    #[test]
    fn test_attribute_value_deserializes_scalars() {
        let values: Vec<AttributeValue> = serde_json::from_str(r#"["lab", 3, 1.5, true]"#).unwrap();
        assert_eq!(
            values,
            vec![
                AttributeValue::from("lab"),
                AttributeValue::Int(3),
                AttributeValue::Double(1.5),
                AttributeValue::Bool(true),
            ]
        );
    }
}
