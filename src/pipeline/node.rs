//! Nested result structures built by the pipeline.

use crate::models::{Row, Value};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// A reshaped value: a scalar, a list, a record of named fields, or a keyed map.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(Value),
    List(Vec<Node>),
    Record(Record),
    Map(Collection),
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Value(_) => "value",
            Node::List(_) => "list",
            Node::Record(_) => "record",
            Node::Map(_) => "map",
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Node::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Collection> {
        match self {
            Node::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Field of a record node.
    pub fn get(&self, field: &str) -> Option<&Node> {
        self.as_record().and_then(|record| record.get(field))
    }

    /// First non-null scalar, searching depth-first.
    pub fn coalesce(&self) -> Value {
        match self {
            Node::Value(v) => v.clone(),
            Node::List(items) => first_non_null(items.iter()),
            Node::Record(record) => first_non_null(record.iter().map(|(_, node)| node)),
            Node::Map(map) => first_non_null(map.iter().map(|(_, node)| node)),
        }
    }

    /// Fold `other` into `self`.
    ///
    /// Lists are appended, records and maps are merged field by field, and
    /// for anything else the value already present wins.
    pub fn merge(&mut self, other: Node) {
        match (self, other) {
            (Node::List(items), Node::List(more)) => items.extend(more),
            (Node::Record(record), Node::Record(more)) => record.merge(more),
            (Node::Map(map), Node::Map(more)) => {
                for (key, node) in more {
                    map.insert_or_merge(key, node);
                }
            }
            _ => {}
        }
    }
}

fn first_non_null<'a>(nodes: impl Iterator<Item = &'a Node>) -> Value {
    nodes
        .map(Node::coalesce)
        .find(|v| !v.is_null())
        .unwrap_or(Value::Null)
}

impl From<Value> for Node {
    fn from(v: Value) -> Self {
        Node::Value(v)
    }
}

impl From<Record> for Node {
    fn from(v: Record) -> Self {
        Node::Record(v)
    }
}

impl From<Collection> for Node {
    fn from(v: Collection) -> Self {
        Node::Map(v)
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Node::Value(v) => v.serialize(serializer),
            Node::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Node::Record(record) => record.serialize(serializer),
            Node::Map(map) => map.serialize(serializer),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// Named fields in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Node)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, node)| node)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.fields
            .iter_mut()
            .find(|(field, _)| field == name)
            .map(|(_, node)| node)
    }

    /// Set a field, replacing it in place if it already exists.
    pub fn insert(&mut self, name: impl Into<String>, node: impl Into<Node>) {
        let name = name.into();
        let node = node.into();
        match self.get_mut(&name) {
            Some(existing) => *existing = node,
            None => self.fields.push((name, node)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        let pos = self.fields.iter().position(|(field, _)| field == name)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.fields.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// The only field of a one-field record.
    pub fn into_single(mut self) -> Result<(String, Node), Record> {
        if self.fields.len() == 1 {
            if let Some(field) = self.fields.pop() {
                return Ok(field);
            }
        }
        Err(self)
    }

    /// Equal apart from the field `except`.
    pub fn eq_except(&self, other: &Record, except: &str) -> bool {
        self.fields
            .iter()
            .filter(|(name, _)| name != except)
            .eq(other.fields.iter().filter(|(name, _)| name != except))
    }

    pub fn merge(&mut self, other: Record) {
        for (name, node) in other.fields {
            match self.get_mut(&name) {
                Some(existing) => existing.merge(node),
                None => self.fields.push((name, node)),
            }
        }
    }
}

impl From<Row> for Record {
    fn from(row: Row) -> Self {
        Self {
            fields: row
                .into_iter()
                .map(|(name, value)| (name, Node::Value(value)))
                .collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Node);
    type IntoIter = std::vec::IntoIter<(String, Node)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, node) in &self.fields {
            map.serialize_entry(name, node)?;
        }
        map.end()
    }
}

// =============================================================================
// Collection
// =============================================================================

/// Entries keyed by scalar value, in first-seen key order.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    entries: Vec<(Value, Node)>,
    index: HashMap<Value, usize>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Node> {
        self.index.get(key).map(|&pos| &self.entries[pos].1)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.index.contains_key(key)
    }

    /// Add an entry, merging into the existing one when the key was seen before.
    pub fn insert_or_merge(&mut self, key: Value, node: Node) {
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1.merge(node),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, node));
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter().map(|(_, node)| node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Node)> {
        self.entries.iter().map(|(key, node)| (key, node))
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(Value, Node)> for Collection {
    fn from_iter<I: IntoIterator<Item = (Value, Node)>>(iter: I) -> Self {
        let mut collection = Collection::new();
        for (key, node) in iter {
            collection.insert_or_merge(key, node);
        }
        collection
    }
}

impl IntoIterator for Collection {
    type Item = (Value, Node);
    type IntoIter = std::vec::IntoIter<(Value, Node)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, node) in &self.entries {
            map.serialize_entry(&key.to_string(), node)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Node {
        Node::Value(Value::Text(s.to_string()))
    }

    #[test]
    fn test_merge_appends_lists_and_keeps_first_scalar() {
        let mut a = Record::new();
        a.insert("name", text("Vladimir"));
        a.insert("addresses", Node::List(vec![text("Moskva")]));
        let mut b = Record::new();
        b.insert("name", text("Volodya"));
        b.insert("addresses", Node::List(vec![text("Vladivostok")]));

        let mut node = Node::Record(a);
        node.merge(Node::Record(b));

        assert_eq!(node.get("name"), Some(&text("Vladimir")));
        assert_eq!(
            node.get("addresses").and_then(Node::as_list).map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn test_merge_maps_by_key() {
        let first: Collection = vec![(Value::Integer(1), text("Vladimir"))].into_iter().collect();
        let second: Collection = vec![
            (Value::Integer(1), text("Volodya")),
            (Value::Integer(2), text("Olga")),
        ]
        .into_iter()
        .collect();

        let mut node = Node::Map(first);
        node.merge(Node::Map(second));

        let map = node.as_map().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get(&Value::Integer(1)).and_then(Node::as_value),
            Some(&Value::Text("Vladimir".into()))
        );
        assert_eq!(
            map.get(&Value::Integer(2)).and_then(Node::as_value),
            Some(&Value::Text("Olga".into()))
        );
        assert!(node.as_record().is_none());
    }

    #[test]
    fn test_collection_merges_repeated_keys() {
        let collection: Collection = vec![
            (Value::Integer(1), Node::List(vec![text("a")])),
            (Value::Integer(2), Node::List(vec![text("b")])),
            (Value::Integer(1), Node::List(vec![text("c")])),
        ]
        .into_iter()
        .collect();

        assert_eq!(collection.len(), 2);
        assert_eq!(collection.keys().collect::<Vec<_>>(), vec![&Value::Integer(1), &Value::Integer(2)]);
        assert_eq!(
            collection.get(&Value::Integer(1)),
            Some(&Node::List(vec![text("a"), text("c")]))
        );
    }

    #[test]
    fn test_coalesce_skips_nulls() {
        let mut record = Record::new();
        record.insert("a", Node::Value(Value::Null));
        record.insert("b", Node::List(vec![Node::Value(Value::Null), text("x")]));
        assert_eq!(Node::Record(record).coalesce(), Value::Text("x".into()));
        assert_eq!(Node::List(vec![]).coalesce(), Value::Null);
    }

    #[test]
    fn test_eq_except() {
        let mut a = Record::new();
        a.insert("id", Node::Value(Value::Integer(1)));
        a.insert("tags", Node::List(vec![text("x")]));
        let mut b = a.clone();
        b.insert("tags", Node::List(vec![text("y")]));
        assert!(a.eq_except(&b, "tags"));
        b.insert("id", Node::Value(Value::Integer(2)));
        assert!(!a.eq_except(&b, "tags"));
    }

    #[test]
    fn test_into_single() {
        let mut record = Record::new();
        record.insert("user", text("x"));
        assert_eq!(record.into_single().unwrap(), ("user".to_string(), text("x")));

        let mut record = Record::new();
        record.insert("a", text("x"));
        record.insert("b", text("y"));
        assert!(record.into_single().is_err());
    }

    #[test]
    fn test_collection_serializes_with_string_keys() {
        let mut inner = Record::new();
        inner.insert("name", text("Vladimir"));
        let collection: Collection = vec![(Value::Integer(1), Node::Record(inner))]
            .into_iter()
            .collect();
        assert_eq!(
            serde_json::to_string(&collection).unwrap(),
            r#"{"1":{"name":"Vladimir"}}"#
        );
    }
}
