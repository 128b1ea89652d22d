//! Attribute values.

use crate::types::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Attribute values of one item, keyed by attribute id.
pub type AttrMap = BTreeMap<Arc<str>, Value>;

/// Scalar value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// `true` / `false`.
    Bool,
    /// Signed 64-bit integer.
    Long,
    /// UTF-8 text.
    Text,
    /// Reference to another item.
    Item,
}

impl ScalarType {
    /// Stable name used in the system schema.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Long => "long",
            Self::Text => "text",
            Self::Item => "item",
        }
    }

    /// Parses a name produced by [`ScalarType::name`].
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::Bool),
            "long" => Some(Self::Long),
            "text" => Some(Self::Text),
            "item" => Some(Self::Item),
            _ => None,
        }
    }
}

/// How values of an attribute are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Composition {
    /// A single scalar.
    Scalar,
    /// An ordered list of scalars.
    List,
    /// A set of distinct scalars.
    Set,
    /// A nested attribute map.
    Record,
}

impl Composition {
    /// Stable name used in the system schema.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::List => "list",
            Self::Set => "set",
            Self::Record => "record",
        }
    }
}

/// Scalar type and composition of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// A single scalar.
    Scalar(ScalarType),
    /// A list of scalars.
    List(ScalarType),
    /// A set of scalars.
    Set(ScalarType),
    /// A nested attribute map.
    Record,
}

impl ValueKind {
    /// The composition part.
    #[must_use]
    pub const fn composition(self) -> Composition {
        match self {
            Self::Scalar(_) => Composition::Scalar,
            Self::List(_) => Composition::List,
            Self::Set(_) => Composition::Set,
            Self::Record => Composition::Record,
        }
    }

    /// The scalar part. Records have none.
    #[must_use]
    pub const fn scalar_type(self) -> Option<ScalarType> {
        match self {
            Self::Scalar(t) | Self::List(t) | Self::Set(t) => Some(t),
            Self::Record => None,
        }
    }

    /// Rebuilds a kind from its schema names.
    #[must_use]
    pub fn parse(scalar: Option<&str>, composition: &str) -> Option<Self> {
        match composition {
            "record" => Some(Self::Record),
            "scalar" => scalar.and_then(ScalarType::parse).map(Self::Scalar),
            "list" => scalar.and_then(ScalarType::parse).map(Self::List),
            "set" => scalar.and_then(ScalarType::parse).map(Self::Set),
            _ => None,
        }
    }

    /// Returns true if `value` has this shape.
    #[must_use]
    pub fn admits(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Scalar(t), Value::Scalar(s)) => s.scalar_type() == t,
            (Self::List(t), Value::List(items)) => items.iter().all(|s| s.scalar_type() == t),
            (Self::Set(t), Value::Set(items)) => items.iter().all(|s| s.scalar_type() == t),
            (Self::Record, Value::Record(_)) => true,
            _ => false,
        }
    }
}

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scalar {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Long(i64),
    /// Text.
    Text(String),
    /// Item reference.
    Item(ItemId),
}

impl Scalar {
    /// The type of this scalar.
    #[must_use]
    pub const fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Long(_) => ScalarType::Long,
            Self::Text(_) => ScalarType::Text,
            Self::Item(_) => ScalarType::Item,
        }
    }

    /// The referenced item, if this is a reference.
    #[must_use]
    pub const fn as_item(&self) -> Option<ItemId> {
        match self {
            Self::Item(item) => Some(*item),
            _ => None,
        }
    }

    /// The text, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Item(v) => write!(f, "{v}"),
        }
    }
}

/// An attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// A single scalar.
    Scalar(Scalar),
    /// An ordered list.
    List(Vec<Scalar>),
    /// A set.
    Set(BTreeSet<Scalar>),
    /// A nested attribute map.
    Record(AttrMap),
}

impl Value {
    /// The composition of this value.
    #[must_use]
    pub const fn composition(&self) -> Composition {
        match self {
            Self::Scalar(_) => Composition::Scalar,
            Self::List(_) => Composition::List,
            Self::Set(_) => Composition::Set,
            Self::Record(_) => Composition::Record,
        }
    }

    /// The kind an attribute needs to hold this value. Empty lists and sets
    /// carry no scalar type and have none.
    #[must_use]
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Scalar(s) => Some(ValueKind::Scalar(s.scalar_type())),
            Self::List(items) => items.first().map(|s| ValueKind::List(s.scalar_type())),
            Self::Set(items) => items.first().map(|s| ValueKind::Set(s.scalar_type())),
            Self::Record(_) => Some(ValueKind::Record),
        }
    }

    /// Drops empty lists and sets. An absent value and an empty collection
    /// are the same thing to the store.
    #[must_use]
    pub fn normalized(self) -> Option<Self> {
        match &self {
            Self::List(items) if items.is_empty() => None,
            Self::Set(items) if items.is_empty() => None,
            _ => Some(self),
        }
    }

    /// Scalars held by this value. Records hold none.
    pub fn scalars(&self) -> Box<dyn Iterator<Item = &Scalar> + '_> {
        match self {
            Self::Scalar(s) => Box::new(std::iter::once(s)),
            Self::List(items) => Box::new(items.iter()),
            Self::Set(items) => Box::new(items.iter()),
            Self::Record(_) => Box::new(std::iter::empty()),
        }
    }

    /// Returns true if this value is `scalar` or holds it.
    #[must_use]
    pub fn contains(&self, scalar: &Scalar) -> bool {
        match self {
            Self::Scalar(s) => s == scalar,
            Self::List(items) => items.contains(scalar),
            Self::Set(items) => items.contains(scalar),
            Self::Record(_) => false,
        }
    }

    /// The nested map, if this is a record.
    #[must_use]
    pub fn as_record(&self) -> Option<&AttrMap> {
        match self {
            Self::Record(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<'a>(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = &'a Scalar>) -> fmt::Result {
            for (i, item) in items.enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::List(items) => {
                f.write_str("[")?;
                join(f, items.iter())?;
                f.write_str("]")
            }
            Self::Set(items) => {
                f.write_str("{")?;
                join(f, items.iter())?;
                f.write_str("}")
            }
            Self::Record(map) => write!(f, "<record of {} attributes>", map.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collections_normalize_away() {
        assert_eq!(Value::List(vec![]).normalized(), None);
        assert_eq!(Value::Set(BTreeSet::new()).normalized(), None);
        let v = Value::Scalar(Scalar::Long(0));
        assert_eq!(v.clone().normalized(), Some(v));
    }

    #[test]
    fn kind_admits_matching_shapes() {
        let tags = Value::Set([Scalar::Text("a".into())].into_iter().collect());
        assert!(ValueKind::Set(ScalarType::Text).admits(&tags));
        assert!(!ValueKind::Set(ScalarType::Long).admits(&tags));
        assert!(!ValueKind::List(ScalarType::Text).admits(&tags));
        assert!(ValueKind::Record.admits(&Value::Record(AttrMap::new())));
    }

    #[test]
    fn values_know_their_kind() {
        let tags = Value::Set([Scalar::Text("a".into())].into_iter().collect());
        assert_eq!(tags.kind(), Some(ValueKind::Set(ScalarType::Text)));
        assert_eq!(Value::Scalar(Scalar::Long(3)).kind(), Some(ValueKind::Scalar(ScalarType::Long)));
        assert_eq!(Value::List(vec![]).kind(), None);
        assert_eq!(Value::Record(AttrMap::new()).kind(), Some(ValueKind::Record));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ValueKind::Scalar(ScalarType::Bool),
            ValueKind::List(ScalarType::Item),
            ValueKind::Set(ScalarType::Long),
            ValueKind::Record,
        ] {
            let scalar = kind.scalar_type().map(ScalarType::name);
            assert_eq!(ValueKind::parse(scalar, kind.composition().name()), Some(kind));
        }
        assert_eq!(ValueKind::parse(Some("float"), "scalar"), None);
    }

    #[test]
    fn contains_looks_inside_collections() {
        let list = Value::List(vec![Scalar::Long(1), Scalar::Long(2)]);
        assert!(list.contains(&Scalar::Long(2)));
        assert!(!list.contains(&Scalar::Long(3)));
        assert_eq!(list.scalars().count(), 2);
        assert_eq!(list.to_string(), "[1, 2]");
    }
}
