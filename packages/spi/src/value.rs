//! Typed property values
//!
//! Values are carried verbatim: nothing in this crate or in the session layer
//! converts between types. Coercion is the caller's job and happens before an
//! operation is built.

use crate::ids::{ItemId, Name};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Property type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    String,
    Binary,
    Long,
    Double,
    Decimal,
    Date,
    Boolean,
    Name,
    Path,
    Reference,
    WeakReference,
    Uri,
    /// Matches any type in a definition; never the type of a stored property
    Undefined,
}

impl PropertyType {
    /// Whether a definition requiring `self` admits a property of type `actual`
    pub fn admits(self, actual: PropertyType) -> bool {
        self == PropertyType::Undefined || self == actual
    }

    pub fn is_reference(self) -> bool {
        matches!(self, PropertyType::Reference | PropertyType::WeakReference)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::String => "String",
            PropertyType::Binary => "Binary",
            PropertyType::Long => "Long",
            PropertyType::Double => "Double",
            PropertyType::Decimal => "Decimal",
            PropertyType::Date => "Date",
            PropertyType::Boolean => "Boolean",
            PropertyType::Name => "Name",
            PropertyType::Path => "Path",
            PropertyType::Reference => "Reference",
            PropertyType::WeakReference => "WeakReference",
            PropertyType::Uri => "URI",
            PropertyType::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// A single property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    String(String),
    Binary(Vec<u8>),
    Long(i64),
    Double(f64),
    /// Canonical decimal string
    Decimal(String),
    Date(DateTime<FixedOffset>),
    Boolean(bool),
    Name(Name),
    Path(String),
    Reference(ItemId),
    WeakReference(ItemId),
    Uri(String),
}

impl Value {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Value::String(_) => PropertyType::String,
            Value::Binary(_) => PropertyType::Binary,
            Value::Long(_) => PropertyType::Long,
            Value::Double(_) => PropertyType::Double,
            Value::Decimal(_) => PropertyType::Decimal,
            Value::Date(_) => PropertyType::Date,
            Value::Boolean(_) => PropertyType::Boolean,
            Value::Name(_) => PropertyType::Name,
            Value::Path(_) => PropertyType::Path,
            Value::Reference(_) => PropertyType::Reference,
            Value::WeakReference(_) => PropertyType::WeakReference,
            Value::Uri(_) => PropertyType::Uri,
        }
    }

    /// Target of a reference value
    pub fn referenced_id(&self) -> Option<&ItemId> {
        match self {
            Value::Reference(id) | Value::WeakReference(id) => Some(id),
            _ => None,
        }
    }

    /// Point a reference value at `new` if it currently targets `old`
    pub fn rebind_reference(&mut self, old: &ItemId, new: &ItemId) -> bool {
        match self {
            Value::Reference(id) | Value::WeakReference(id) if id == old => {
                *id = new.clone();
                true
            }
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_tags() {
        assert_eq!(Value::from("x").property_type(), PropertyType::String);
        assert_eq!(Value::from(3_i64).property_type(), PropertyType::Long);
        assert_eq!(Value::from(true).property_type(), PropertyType::Boolean);
        assert_eq!(
            Value::Reference(ItemId::new("item-1")).property_type(),
            PropertyType::Reference
        );
    }

    #[test]
    fn test_undefined_admits_everything() {
        assert!(PropertyType::Undefined.admits(PropertyType::Binary));
        assert!(PropertyType::Long.admits(PropertyType::Long));
        assert!(!PropertyType::Long.admits(PropertyType::String));
    }

    #[test]
    fn test_rebind_reference() {
        let old = ItemId::new("local-1");
        let new = ItemId::new("item-9");

        let mut value = Value::WeakReference(old.clone());
        assert!(value.rebind_reference(&old, &new));
        assert_eq!(value.referenced_id(), Some(&new));

        let mut text = Value::from("local-1");
        assert!(!text.rebind_reference(&old, &new));
    }

    #[test]
    fn test_date_value_serialization() {
        let date = DateTime::parse_from_rfc3339("2024-05-01T10:00:00+02:00").unwrap();
        let value = Value::Date(date);

        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value, back);
    }
}
