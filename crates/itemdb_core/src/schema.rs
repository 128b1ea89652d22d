//! Attribute and object definitions, and the system schema.
//!
//! Attributes and item types are items themselves. An [`Attribute`] is a
//! typed handle the application holds; the store materializes its definition
//! the first time a value is written through it. A [`DbObject`] describes a
//! named item (a type, an attribute, a connection) that the store resolves
//! or creates on demand.

use crate::error::{DbError, DbResult};
use crate::types::ItemId;
use crate::value::{AttrMap, Scalar, ScalarType, Value, ValueKind};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Untyped attribute definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeKey {
    id: Arc<str>,
    kind: ValueKind,
    shadowable: bool,
}

impl AttributeKey {
    /// A shadowable attribute: part of an item's trunk and server versions.
    pub fn new(id: impl Into<Arc<str>>, kind: ValueKind) -> Self {
        Self {
            id: id.into(),
            kind,
            shadowable: true,
        }
    }

    /// A local attribute: bookkeeping that is never synchronized.
    pub fn local(id: impl Into<Arc<str>>, kind: ValueKind) -> Self {
        Self {
            id: id.into(),
            kind,
            shadowable: false,
        }
    }

    /// Globally unique attribute id.
    #[must_use]
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// Scalar type and composition.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Whether values take part in trunk/server versions.
    #[must_use]
    pub const fn is_shadowable(&self) -> bool {
        self.shadowable
    }

    /// Checks that `value` fits this attribute.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Schema`] on a shape mismatch.
    pub fn check(&self, value: &Value) -> DbResult<()> {
        if self.kind.admits(value) {
            Ok(())
        } else {
            Err(DbError::schema(
                self.id.as_ref(),
                format!("value {value} does not fit {:?}", self.kind),
            ))
        }
    }

    /// The object that materializes this definition.
    #[must_use]
    pub fn definition(&self) -> DbObject {
        let mut object = DbObject::new(&self.id, &sys::ATTRIBUTE_TYPE)
            .with_name(self.id.as_ref())
            .with_value(&*sys::COMPOSITION, self.kind.composition().name().to_string())
            .with_value(&*sys::SHADOWABLE, self.shadowable);
        if let Some(scalar) = self.kind.scalar_type() {
            object = object.with_value(&*sys::SCALAR_TYPE, scalar.name().to_string());
        }
        object
    }

    /// Rebuilds a definition from a materialized attribute item.
    #[must_use]
    pub fn from_definition(row: &AttrMap) -> Option<Self> {
        fn text<'r>(row: &'r AttrMap, attr: &Attribute<String>) -> Option<&'r str> {
            match row.get(attr.id()) {
                Some(Value::Scalar(Scalar::Text(text))) => Some(text.as_str()),
                _ => None,
            }
        }
        let id = text(row, &sys::ID)?;
        let kind = ValueKind::parse(text(row, &sys::SCALAR_TYPE), text(row, &sys::COMPOSITION)?)?;
        let shadowable = matches!(
            row.get(sys::SHADOWABLE.id()),
            Some(Value::Scalar(Scalar::Bool(true)))
        );
        Some(Self {
            id: Arc::from(id),
            kind,
            shadowable,
        })
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Rust types usable as a single scalar.
pub trait ScalarValue: Sized + Ord {
    /// The scalar type.
    const TYPE: ScalarType;
    /// Converts into a scalar.
    fn into_scalar(self) -> Scalar;
    /// Converts from a scalar of the right type.
    fn from_scalar(scalar: &Scalar) -> Option<Self>;
}

/// Rust types usable as attribute values.
pub trait AttrValue: Sized {
    /// Scalar type and composition.
    const KIND: ValueKind;
    /// Converts into a stored value.
    fn into_value(self) -> Value;
    /// Converts from a stored value of the right kind.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! scalar_value {
    ($ty:ty, $variant:ident, |$s:ident| $from:expr) => {
        impl ScalarValue for $ty {
            const TYPE: ScalarType = ScalarType::$variant;

            fn into_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }

            fn from_scalar(scalar: &Scalar) -> Option<Self> {
                match scalar {
                    Scalar::$variant($s) => Some($from),
                    _ => None,
                }
            }
        }

        impl AttrValue for $ty {
            const KIND: ValueKind = ValueKind::Scalar(ScalarType::$variant);

            fn into_value(self) -> Value {
                Value::Scalar(self.into_scalar())
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::Scalar(scalar) => Self::from_scalar(scalar),
                    _ => None,
                }
            }
        }
    };
}

scalar_value!(bool, Bool, |v| *v);
scalar_value!(i64, Long, |v| *v);
scalar_value!(String, Text, |v| v.clone());
scalar_value!(ItemId, Item, |v| *v);

impl<T: ScalarValue> AttrValue for Vec<T> {
    const KIND: ValueKind = ValueKind::List(T::TYPE);

    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(ScalarValue::into_scalar).collect())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::List(items) => items.iter().map(T::from_scalar).collect(),
            _ => None,
        }
    }
}

impl<T: ScalarValue> AttrValue for BTreeSet<T> {
    const KIND: ValueKind = ValueKind::Set(T::TYPE);

    fn into_value(self) -> Value {
        Value::Set(self.into_iter().map(ScalarValue::into_scalar).collect())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Set(items) => items.iter().map(T::from_scalar).collect(),
            _ => None,
        }
    }
}

impl AttrValue for AttrMap {
    const KIND: ValueKind = ValueKind::Record;

    fn into_value(self) -> Value {
        Value::Record(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_record().cloned()
    }
}

/// Typed handle to an attribute.
///
/// ```rust
/// use itemdb_core::Attribute;
/// use std::collections::BTreeSet;
///
/// let tags: Attribute<BTreeSet<String>> = Attribute::new("tracker:tags");
/// assert_eq!(tags.id(), "tracker:tags");
/// assert!(tags.key().is_shadowable());
/// ```
pub struct Attribute<T> {
    key: AttributeKey,
    _value: PhantomData<fn() -> T>,
}

impl<T: AttrValue> Attribute<T> {
    /// A shadowable attribute.
    pub fn new(id: &str) -> Self {
        Self {
            key: AttributeKey::new(id, T::KIND),
            _value: PhantomData,
        }
    }

    /// A local attribute.
    pub fn local(id: &str) -> Self {
        Self {
            key: AttributeKey::local(id, T::KIND),
            _value: PhantomData,
        }
    }
}

impl<T> Attribute<T> {
    /// The untyped definition.
    #[must_use]
    pub fn key(&self) -> &AttributeKey {
        &self.key
    }

    /// The attribute id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.key.id
    }
}

impl<T> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Attribute").field(&self.key).finish()
    }
}

/// A named item the store resolves by identity or creates on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct DbObject {
    id: Arc<str>,
    type_id: Arc<str>,
    name: Option<String>,
    values: Vec<(AttributeKey, Value)>,
}

impl DbObject {
    /// An object of the given type.
    pub fn new(id: &str, item_type: &DbObject) -> Self {
        Self {
            id: Arc::from(id),
            type_id: Arc::clone(&item_type.id),
            name: None,
            values: Vec::new(),
        }
    }

    /// An item type.
    pub fn item_type(id: &str) -> Self {
        Self {
            id: Arc::from(id),
            type_id: Arc::from(sys::TYPE_TYPE_ID),
            name: None,
            values: Vec::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an attribute value written when the object is created.
    #[must_use]
    pub fn with_value<T: AttrValue>(mut self, attribute: &Attribute<T>, value: T) -> Self {
        self.values.push((attribute.key().clone(), value.into_value()));
        self
    }

    /// Identity string.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identity of the object's type.
    #[must_use]
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Display name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Extra values written on creation.
    #[must_use]
    pub fn values(&self) -> &[(AttributeKey, Value)] {
        &self.values
    }
}

/// The system schema present from the genesis state.
pub mod sys {
    use super::{Attribute, DbObject};
    use crate::types::ItemId;
    use std::sync::LazyLock;

    /// Identity of the type of all types.
    pub const TYPE_TYPE_ID: &str = "sys:type:type";
    /// Identity of the type of all attributes.
    pub const ATTRIBUTE_TYPE_ID: &str = "sys:type:attribute";

    /// The type of all types.
    pub static TYPE_TYPE: LazyLock<DbObject> =
        LazyLock::new(|| DbObject::item_type(TYPE_TYPE_ID).with_name("Type"));
    /// The type of all attributes.
    pub static ATTRIBUTE_TYPE: LazyLock<DbObject> =
        LazyLock::new(|| DbObject::item_type(ATTRIBUTE_TYPE_ID).with_name("Attribute"));

    /// Identity string of a materialized object.
    pub static ID: LazyLock<Attribute<String>> = LazyLock::new(|| Attribute::local("sys:attr:id"));
    /// Type of an item.
    pub static TYPE: LazyLock<Attribute<ItemId>> =
        LazyLock::new(|| Attribute::local("sys:attr:type"));
    /// Display name of an object.
    pub static NAME: LazyLock<Attribute<String>> =
        LazyLock::new(|| Attribute::local("sys:attr:name"));
    /// Scalar type of an attribute definition.
    pub static SCALAR_TYPE: LazyLock<Attribute<String>> =
        LazyLock::new(|| Attribute::local("sys:attr:scalar-type"));
    /// Composition of an attribute definition.
    pub static COMPOSITION: LazyLock<Attribute<String>> =
        LazyLock::new(|| Attribute::local("sys:attr:composition"));
    /// Whether an attribute definition is shadowable.
    pub static SHADOWABLE: LazyLock<Attribute<bool>> =
        LazyLock::new(|| Attribute::local("sys:attr:shadowable"));
}

const fn reserved(raw: u64) -> ItemId {
    match ItemId::new(raw) {
        Some(item) => item,
        None => panic!("reserved item ids start at 1"),
    }
}

/// Item of [`sys::TYPE_TYPE`].
pub(crate) const TYPE_TYPE_ITEM: ItemId = reserved(1);
/// Item of [`sys::ATTRIBUTE_TYPE`].
pub(crate) const ATTRIBUTE_TYPE_ITEM: ItemId = reserved(2);

/// Rows of the genesis state, in item order.
pub(crate) fn genesis_rows() -> Vec<(ItemId, AttrMap)> {
    fn object_row(object: &DbObject, type_item: ItemId) -> AttrMap {
        let mut row = AttrMap::new();
        row.insert(Arc::clone(sys::ID.key().id()), object.id().to_string().into_value());
        row.insert(Arc::clone(sys::TYPE.key().id()), type_item.into_value());
        if let Some(name) = object.name() {
            row.insert(Arc::clone(sys::NAME.key().id()), name.to_string().into_value());
        }
        for (key, value) in object.values() {
            row.insert(Arc::clone(key.id()), value.clone());
        }
        row
    }

    let mut rows = vec![
        (TYPE_TYPE_ITEM, object_row(&sys::TYPE_TYPE, TYPE_TYPE_ITEM)),
        (ATTRIBUTE_TYPE_ITEM, object_row(&sys::ATTRIBUTE_TYPE, TYPE_TYPE_ITEM)),
    ];
    let attributes = [
        sys::ID.key(),
        sys::TYPE.key(),
        sys::NAME.key(),
        sys::SCALAR_TYPE.key(),
        sys::COMPOSITION.key(),
        sys::SHADOWABLE.key(),
    ];
    for (offset, key) in (3u64..).zip(attributes) {
        rows.push((
            reserved(offset),
            object_row(&key.definition(), ATTRIBUTE_TYPE_ITEM),
        ));
    }
    rows
}
