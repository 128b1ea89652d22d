//! Predicates and queries over a [`Reader`].
//!
//! A [`Predicate`] is a boolean expression over attribute values. It names
//! objects (types, referenced items) by identity; before evaluation it is
//! resolved against a reader into a [`ResolvedPredicate`] that only deals in
//! item ids, so evaluation against one snapshot is referentially transparent.

use crate::reader::Reader;
use crate::schema::{sys, AttrValue, Attribute, AttributeKey, DbObject, ScalarValue};
use crate::types::ItemId;
use crate::value::{AttrMap, Scalar, Value};
use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A boolean expression over item attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every item.
    True,
    /// Matches nothing.
    False,
    /// The attribute holds exactly this value.
    Equals {
        /// Compared attribute.
        attribute: AttributeKey,
        /// Expected value.
        value: Value,
    },
    /// The attribute has any value.
    HasValue(AttributeKey),
    /// The attribute holds at least one of these scalars.
    Intersects {
        /// Compared attribute.
        attribute: AttributeKey,
        /// Accepted scalars.
        values: BTreeSet<Scalar>,
    },
    /// The attribute refers to a materialized object.
    RefersTo {
        /// Reference attribute.
        attribute: AttributeKey,
        /// The referenced object.
        object: DbObject,
    },
    /// The item's type is this object.
    OfType(DbObject),
    /// The item is one of these.
    ItemIn(BTreeSet<ItemId>),
    /// All of these match.
    And(Vec<Predicate>),
    /// Any of these matches.
    Or(Vec<Predicate>),
    /// The inner predicate does not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `attribute == value`.
    pub fn equals<T: AttrValue>(attribute: &Attribute<T>, value: T) -> Self {
        Self::Equals {
            attribute: attribute.key().clone(),
            value: value.into_value(),
        }
    }

    /// The attribute is set.
    pub fn has_value<T>(attribute: &Attribute<T>) -> Self {
        Self::HasValue(attribute.key().clone())
    }

    /// The attribute shares a scalar with `values`.
    pub fn intersects<T, S: ScalarValue>(
        attribute: &Attribute<T>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::Intersects {
            attribute: attribute.key().clone(),
            values: values.into_iter().map(ScalarValue::into_scalar).collect(),
        }
    }

    /// The attribute refers to `object`.
    pub fn refers_to<T>(attribute: &Attribute<T>, object: &DbObject) -> Self {
        Self::RefersTo {
            attribute: attribute.key().clone(),
            object: object.clone(),
        }
    }

    /// Items of type `item_type`.
    pub fn of_type(item_type: &DbObject) -> Self {
        Self::OfType(item_type.clone())
    }

    /// Exactly these items.
    pub fn items(items: impl IntoIterator<Item = ItemId>) -> Self {
        Self::ItemIn(items.into_iter().collect())
    }

    /// Conjunction with `other`.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            Self::True => other,
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction with `other`.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            Self::False => other,
            first => Self::Or(vec![first, other]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// The type restriction of this predicate, if it is narrower than it.
    ///
    /// For `OfType(t) AND rest` this is `OfType(t)`. Commits touching items of
    /// that scope can matter to the predicate even when its result is
    /// unchanged.
    #[must_use]
    pub fn type_scope(&self) -> Option<Predicate> {
        let Self::And(parts) = self else { return None };
        let scope: Vec<Predicate> = parts
            .iter()
            .filter(|part| matches!(part, Self::OfType(_)))
            .cloned()
            .collect();
        if scope.is_empty() || scope.len() == parts.len() {
            None
        } else {
            Some(scope.into_iter().fold(Self::True, Self::and))
        }
    }

    /// Resolves object references against `reader`. Objects that are not
    /// materialized there match nothing.
    pub fn resolve<R: Reader + ?Sized>(&self, reader: &R) -> ResolvedPredicate {
        ResolvedPredicate(self.resolve_node(reader))
    }

    fn resolve_node<R: Reader + ?Sized>(&self, reader: &R) -> Node {
        match self {
            Self::True => Node::True,
            Self::False => Node::False,
            Self::Equals { attribute, value } => match value.clone().normalized() {
                Some(value) => Node::Equals(Arc::clone(attribute.id()), value),
                None => Node::Not(Box::new(Node::HasValue(Arc::clone(attribute.id())))),
            },
            Self::HasValue(attribute) => Node::HasValue(Arc::clone(attribute.id())),
            Self::Intersects { attribute, values } => {
                Node::Intersects(Arc::clone(attribute.id()), values.clone())
            }
            Self::RefersTo { attribute, object } => match reader.find_materialized(object) {
                Some(item) => Node::Intersects(
                    Arc::clone(attribute.id()),
                    BTreeSet::from([Scalar::Item(item)]),
                ),
                None => Node::False,
            },
            Self::OfType(object) => match reader.find_materialized(object) {
                Some(item) => Node::Equals(
                    Arc::clone(sys::TYPE.key().id()),
                    Value::Scalar(Scalar::Item(item)),
                ),
                None => Node::False,
            },
            Self::ItemIn(items) => Node::ItemIn(items.clone()),
            Self::And(parts) => Node::And(parts.iter().map(|p| p.resolve_node(reader)).collect()),
            Self::Or(parts) => Node::Or(parts.iter().map(|p| p.resolve_node(reader)).collect()),
            Self::Not(inner) => Node::Not(Box::new(inner.resolve_node(reader))),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    True,
    False,
    Equals(Arc<str>, Value),
    HasValue(Arc<str>),
    Intersects(Arc<str>, BTreeSet<Scalar>),
    ItemIn(BTreeSet<ItemId>),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

impl Node {
    fn matches(&self, item: ItemId, row: &AttrMap) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Equals(id, value) => row.get(id) == Some(value),
            Self::HasValue(id) => row.contains_key(id),
            Self::Intersects(id, values) => row
                .get(id)
                .is_some_and(|v| v.scalars().any(|s| values.contains(s))),
            Self::ItemIn(items) => items.contains(&item),
            Self::And(parts) => parts.iter().all(|p| p.matches(item, row)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(item, row)),
            Self::Not(inner) => !inner.matches(item, row),
        }
    }

    // Items outside the returned set can never match.
    fn candidates(&self) -> Option<BTreeSet<ItemId>> {
        match self {
            Self::False => Some(BTreeSet::new()),
            Self::ItemIn(items) => Some(items.clone()),
            Self::And(parts) => parts
                .iter()
                .filter_map(Node::candidates)
                .reduce(|a, b| a.intersection(&b).copied().collect()),
            Self::Or(parts) => parts.iter().map(Node::candidates).try_fold(
                BTreeSet::new(),
                |mut all, part| {
                    all.extend(part?);
                    Some(all)
                },
            ),
            _ => None,
        }
    }
}

/// A predicate bound to the object ids of one reader.
#[derive(Debug, Clone)]
pub struct ResolvedPredicate(Node);

impl ResolvedPredicate {
    /// Evaluates the predicate against one item's values.
    #[must_use]
    pub fn matches(&self, item: ItemId, row: &AttrMap) -> bool {
        self.0.matches(item, row)
    }

    /// Evaluates the predicate against an item in `reader`. Missing items
    /// never match.
    pub fn matches_in<R: Reader + ?Sized>(&self, reader: &R, item: ItemId) -> bool {
        reader.values(item).is_some_and(|row| self.matches(item, &row))
    }
}

/// The items of a reader matching a predicate.
///
/// The result is computed lazily on first access and cached; narrowing with
/// [`Query::filter`] only evaluates the narrower predicate over this result.
pub struct Query<'r, R: Reader + ?Sized> {
    reader: &'r R,
    predicate: Predicate,
    resolved: ResolvedPredicate,
    superset: Option<Arc<BTreeSet<ItemId>>>,
    items: OnceCell<Arc<BTreeSet<ItemId>>>,
}

impl<'r, R: Reader + ?Sized> Query<'r, R> {
    /// Starts a query.
    pub fn new(reader: &'r R, predicate: Predicate) -> Self {
        let resolved = predicate.resolve(reader);
        Self {
            reader,
            predicate,
            resolved,
            superset: None,
            items: OnceCell::new(),
        }
    }

    /// The full predicate of this query.
    #[must_use]
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Narrows the result. Only items of this query are examined.
    #[must_use]
    pub fn filter(&self, narrower: Predicate) -> Query<'r, R> {
        let resolved = narrower.resolve(self.reader);
        Query {
            reader: self.reader,
            predicate: self.predicate.clone().and(narrower),
            resolved,
            superset: Some(Arc::clone(self.item_set())),
            items: OnceCell::new(),
        }
    }

    fn item_set(&self) -> &Arc<BTreeSet<ItemId>> {
        self.items.get_or_init(|| Arc::new(self.evaluate()))
    }

    fn evaluate(&self) -> BTreeSet<ItemId> {
        let candidates = match &self.superset {
            Some(superset) => Some(superset.as_ref().clone()),
            None => self.resolved.0.candidates(),
        };
        match candidates {
            Some(candidates) => candidates
                .into_iter()
                .filter(|item| self.resolved.matches_in(self.reader, *item))
                .collect(),
            None => {
                let mut matched = BTreeSet::new();
                self.reader.for_each_item(&mut |item, row| {
                    if self.resolved.matches(item, row) {
                        matched.insert(item);
                    }
                });
                matched
            }
        }
    }

    /// Matching items, ascending. Re-evaluating the same predicate at the
    /// same ICN yields the same list.
    #[must_use]
    pub fn copy_items_sorted(&self) -> Vec<ItemId> {
        self.item_set().iter().copied().collect()
    }

    /// Matching items as a set.
    #[must_use]
    pub fn items(&self) -> BTreeSet<ItemId> {
        self.item_set().as_ref().clone()
    }

    /// Number of matching items.
    #[must_use]
    pub fn count(&self) -> usize {
        self.item_set().len()
    }

    /// Returns true if nothing matches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_set().is_empty()
    }

    /// Returns true if `item` matches.
    #[must_use]
    pub fn contains(&self, item: ItemId) -> bool {
        match self.items.get() {
            Some(items) => items.contains(&item),
            None => {
                self.superset.as_ref().map_or(true, |s| s.contains(&item))
                    && self.resolved.matches_in(self.reader, item)
            }
        }
    }

    /// The lowest matching item.
    #[must_use]
    pub fn first(&self) -> Option<ItemId> {
        self.item_set().first().copied()
    }

    /// The lowest matching item whose `attribute` equals `value`.
    pub fn item_by_key<T: AttrValue + PartialEq>(&self, attribute: &Attribute<T>, value: &T) -> Option<ItemId> {
        self.item_set()
            .iter()
            .copied()
            .find(|item| self.reader.get(*item, attribute).as_ref() == Some(value))
    }
}

impl<R: Reader + ?Sized> std::fmt::Debug for Query<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("predicate", &self.predicate)
            .field("evaluated", &self.items.get().is_some())
            .finish()
    }
}
