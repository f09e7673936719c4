//! Row-stream pipeline.
//!
//! A [`Pipeline`] reshapes the rows of a procedure into keyed, nested
//! structures. Each row starts out as an entry `(key, record)`, where the key
//! is the value of the distinguishing column (the first one unless named) and
//! the record holds every column. Stages are declared left to right and run
//! lazily as rows are pulled:
//!
//! ```text
//! select_value("address").group_into("addresses")
//!     .select_fields(["name", "addresses"]).name("user")
//!     .map("id", "user").flatten()
//!     .collect_all()
//! ```
//!
//! turns a user/address join into `{1: {name, addresses: [..]}}`.
//!
//! Two terminals are available. [`Pipeline::collect_all`] reads everything
//! and merges entries that share a key. [`Pipeline::iterator`] returns a lazy
//! stream; calling it again runs the query again.

pub mod node;
pub mod stage;

pub use node::{Collection, Node, Record};
pub use stage::{Entry, EntryStream, Pick, Predicate, Stage, Target};

use crate::db::{BoundQuery, EngineConnection, Procedure};
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

/// Column whose value keys each entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyColumn {
    First,
    Named(String),
}

impl KeyColumn {
    pub fn entry(&self, row: Row) -> DbResult<Entry> {
        let key = match self {
            KeyColumn::First => row
                .first()
                .cloned()
                .ok_or_else(|| DbError::invalid_input("Row has no columns to key by"))?,
            KeyColumn::Named(name) => row.get(name).cloned().ok_or_else(|| {
                DbError::invalid_input(format!("Key column \"{}\" not found", name))
            })?,
        };
        Ok((key, Node::Record(Record::from(row))))
    }
}

/// How many distinct keys a collected result may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCardinality {
    One,
    Any,
}

impl KeyCardinality {
    pub fn check(self, found: usize) -> DbResult<()> {
        match self {
            KeyCardinality::One if found != 1 => Err(DbError::cardinality(found)),
            _ => Ok(()),
        }
    }
}

pub struct Pipeline<'s, E: EngineConnection> {
    procedure: Procedure<'s, E>,
    /// Query expanded on first run, reused when the iterator restarts.
    bound: Option<BoundQuery>,
    key: KeyColumn,
    cardinality: KeyCardinality,
    stages: Vec<Stage>,
}

impl<'s, E: EngineConnection> Pipeline<'s, E> {
    pub(crate) fn new(
        procedure: Procedure<'s, E>,
        key: KeyColumn,
        cardinality: KeyCardinality,
    ) -> Self {
        Self {
            procedure,
            bound: None,
            key,
            cardinality,
            stages: Vec::new(),
        }
    }

    fn push(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Take one column out of each record.
    pub fn select_value(self, column: impl Into<String>) -> Selection<'s, E> {
        Selection {
            pipeline: self,
            pick: Pick::Value(column.into()),
        }
    }

    /// Take several columns out of each record, as a sub-record.
    pub fn select_fields<I, S>(self, columns: I) -> Selection<'s, E>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection {
            pipeline: self,
            pick: Pick::Fields(columns.into_iter().map(Into::into).collect()),
        }
    }

    /// Re-key each record: `{key: record[value]}` under the same outer key.
    pub fn map(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(Stage::Map {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn flatten(self) -> Self {
        self.push(Stage::Flatten)
    }

    /// Keep only entries for which `predicate` holds.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&Value, &Node) -> bool + Send + Sync + 'static,
    {
        let predicate: Predicate = Arc::new(predicate);
        self.push(Stage::Filter(predicate))
    }

    /// Reduce every entry to its first non-null scalar.
    pub fn coalesce_all(self) -> Coalesced<'s, E> {
        Coalesced { pipeline: self }
    }

    /// Run the query and return its entries lazily.
    ///
    /// Each call executes the query again with the parameters bound before
    /// the first call. Fetch errors surface at the entry they interrupt.
    pub async fn iterator(&mut self) -> DbResult<EntryStream<'_>> {
        let bound = match self.bound.clone() {
            Some(bound) => bound,
            None => {
                let bound = self.procedure.expand()?;
                self.bound = Some(bound.clone());
                bound
            }
        };
        debug!(stages = self.stages.len(), sql = %bound.sql, "Running pipeline");

        let key = self.key.clone();
        let stages = self.stages.clone();
        let cursor = self.procedure.fetch_bound(bound).await?;
        let mut entries: EntryStream<'_> = cursor
            .map(move |row| row.and_then(|row| key.entry(row)))
            .boxed();
        for stage in stages {
            entries = stage::apply(stage, entries);
        }
        Ok(entries)
    }

    /// Read every entry, merging entries whose key was already seen.
    pub async fn collect_all(mut self) -> DbResult<Collection> {
        let cardinality = self.cardinality;
        let mut collection = Collection::new();
        let mut entries = self.iterator().await?;
        while let Some((key, node)) = entries.try_next().await? {
            collection.insert_or_merge(key, node);
        }
        cardinality.check(collection.len())?;
        Ok(collection)
    }
}

/// A pending `select_value` / `select_fields`, waiting for its target.
pub struct Selection<'s, E: EngineConnection> {
    pipeline: Pipeline<'s, E>,
    pick: Pick,
}

impl<'s, E: EngineConnection> Selection<'s, E> {
    fn finish(self, target: Target) -> Pipeline<'s, E> {
        let Selection { pipeline, pick } = self;
        pipeline.push(Stage::Select { pick, target })
    }

    /// Store the selection under `label`, keeping the rest of the record.
    pub fn name(self, label: impl Into<String>) -> Pipeline<'s, E> {
        self.finish(Target::Name(label.into()))
    }

    /// Accumulate the selection in a list under `label`.
    pub fn group_into(self, label: impl Into<String>) -> Pipeline<'s, E> {
        self.finish(Target::GroupInto(label.into()))
    }

    /// Keep only the selection.
    pub fn project(self) -> Pipeline<'s, E> {
        self.finish(Target::Project)
    }

    pub fn coalesce_all(self) -> Coalesced<'s, E> {
        self.project().coalesce_all()
    }

    pub async fn collect_all(self) -> DbResult<Collection> {
        self.project().collect_all().await
    }
}

/// A pipeline reduced to one scalar per key.
pub struct Coalesced<'s, E: EngineConnection> {
    pipeline: Pipeline<'s, E>,
}

impl<'s, E: EngineConnection> Coalesced<'s, E> {
    pub async fn iterator(&mut self) -> DbResult<BoxStream<'_, DbResult<(Value, Value)>>> {
        let entries = self.pipeline.iterator().await?;
        Ok(entries
            .map_ok(|(key, node)| {
                let value = node.coalesce();
                (key, value)
            })
            .boxed())
    }

    /// One scalar per distinct key, in first-seen order.
    pub async fn collect_all(self) -> DbResult<Vec<Value>> {
        let collection = self.pipeline.collect_all().await?;
        Ok(collection.values().map(Node::coalesce).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        [
            ("id", Value::Integer(7)),
            ("name", Value::Text("Vladimir".into())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_key_column_first() {
        let (key, node) = KeyColumn::First.entry(row()).unwrap();
        assert_eq!(key, Value::Integer(7));
        assert_eq!(node.get("name"), Some(&Node::Value(Value::Text("Vladimir".into()))));
        assert_eq!(node.get("id"), Some(&Node::Value(Value::Integer(7))));
    }

    #[test]
    fn test_key_column_named() {
        let (key, _) = KeyColumn::Named("name".into()).entry(row()).unwrap();
        assert_eq!(key, Value::Text("Vladimir".into()));

        let err = KeyColumn::Named("email".into()).entry(row()).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_key_column_empty_row() {
        assert!(KeyColumn::First.entry(Row::new()).is_err());
    }

    #[test]
    fn test_cardinality() {
        assert!(KeyCardinality::One.check(1).is_ok());
        assert!(matches!(
            KeyCardinality::One.check(2),
            Err(DbError::Cardinality { found: 2 })
        ));
        assert!(matches!(
            KeyCardinality::One.check(0),
            Err(DbError::Cardinality { found: 0 })
        ));
        assert!(KeyCardinality::Any.check(0).is_ok());
    }
}
