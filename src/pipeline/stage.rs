//! Pipeline stages.
//!
//! Every stage is a stream adapter over keyed entries. Stages never buffer more
//! than one entry, except [`Target::GroupInto`] which holds the run of adjacent
//! entries it is currently folding.

use super::node::{Collection, Node, Record};
use crate::error::{DbError, DbResult};
use crate::models::Value;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;

/// An outer key and the structure built for it so far.
pub type Entry = (Value, Node);

pub type EntryStream<'a> = BoxStream<'a, DbResult<Entry>>;

pub type Predicate = Arc<dyn Fn(&Value, &Node) -> bool + Send + Sync>;

/// What a selection takes out of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pick {
    Value(String),
    Fields(Vec<String>),
}

/// Where a selection puts what it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Replace the whole entry with the selection.
    Project,
    /// Store the selection under a label.
    Name(String),
    /// Store the selection in a list under a label, folding adjacent entries.
    GroupInto(String),
}

#[derive(Clone)]
pub enum Stage {
    Select { pick: Pick, target: Target },
    Map { key: String, value: String },
    Flatten,
    Filter(Predicate),
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Select { pick, target } => f
                .debug_struct("Select")
                .field("pick", pick)
                .field("target", target)
                .finish(),
            Stage::Map { key, value } => f
                .debug_struct("Map")
                .field("key", key)
                .field("value", value)
                .finish(),
            Stage::Flatten => f.write_str("Flatten"),
            Stage::Filter(_) => f.write_str("Filter(..)"),
        }
    }
}

/// Wrap `input` with the adapter for `stage`.
pub fn apply<'a>(stage: Stage, input: EntryStream<'a>) -> EntryStream<'a> {
    match stage {
        Stage::Select { pick, target } => {
            let label = match &target {
                Target::GroupInto(label) => Some(label.clone()),
                _ => None,
            };
            let selected = input
                .map(move |item| item.and_then(|(key, node)| select(&pick, &target, key, node)))
                .boxed();
            match label {
                Some(label) => group_adjacent(selected, label),
                None => selected,
            }
        }
        Stage::Map { key, value } => input
            .map(move |item| item.and_then(|(outer, node)| map_entry(&key, &value, outer, node)))
            .boxed(),
        Stage::Flatten => input
            .flat_map(|item| {
                let entries: Vec<DbResult<Entry>> = match item {
                    Ok((outer, node)) => flatten(outer, node).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(entries)
            })
            .boxed(),
        Stage::Filter(predicate) => input
            .filter(move |item| {
                let keep = match item {
                    Ok((key, node)) => predicate(key, node),
                    Err(_) => true,
                };
                futures_util::future::ready(keep)
            })
            .boxed(),
    }
}

fn into_record(node: Node, stage: &str) -> DbResult<Record> {
    match node {
        Node::Record(record) => Ok(record),
        other => Err(DbError::invalid_input(format!(
            "{} expects a record, found {}",
            stage,
            other.kind()
        ))),
    }
}

fn take_field(record: &mut Record, name: &str) -> DbResult<Node> {
    record
        .remove(name)
        .ok_or_else(|| DbError::invalid_input(format!("Column \"{}\" not found", name)))
}

fn select(pick: &Pick, target: &Target, key: Value, node: Node) -> DbResult<Entry> {
    let mut record = into_record(node, "select")?;
    let picked = match pick {
        Pick::Value(name) => take_field(&mut record, name)?,
        Pick::Fields(names) => {
            let mut fields = Record::new();
            for name in names {
                let field = take_field(&mut record, name)?;
                fields.insert(name.clone(), field);
            }
            Node::Record(fields)
        }
    };

    let node = match target {
        Target::Project => picked,
        Target::Name(label) => {
            record.insert(label.clone(), picked);
            Node::Record(record)
        }
        Target::GroupInto(label) => {
            record.insert(label.clone(), Node::List(vec![picked]));
            Node::Record(record)
        }
    };
    Ok((key, node))
}

fn map_entry(key: &str, value: &str, outer: Value, node: Node) -> DbResult<Entry> {
    let mut record = into_record(node, "map")?;
    let inner_key = match take_field(&mut record, key)? {
        Node::Value(v) => v,
        other => {
            return Err(DbError::invalid_input(format!(
                "map key \"{}\" must be a scalar, found {}",
                key,
                other.kind()
            )));
        }
    };
    let inner = take_field(&mut record, value)?;
    let mut map = Collection::new();
    map.insert_or_merge(inner_key, inner);
    Ok((outer, Node::Map(map)))
}

/// Remove one level of single-key nesting. Other shapes pass through.
fn flatten(outer: Value, node: Node) -> Vec<Entry> {
    match node {
        Node::Map(map) => map.into_iter().collect(),
        Node::Record(record) => match record.into_single() {
            Ok((_, inner)) => vec![(outer, inner)],
            Err(record) => vec![(outer, Node::Record(record))],
        },
        other => vec![(outer, other)],
    }
}

fn can_fold(pending: &Entry, next: &Entry, label: &str) -> bool {
    if pending.0 != next.0 {
        return false;
    }
    match (&pending.1, &next.1) {
        (Node::Record(a), Node::Record(b)) => a.eq_except(b, label),
        _ => false,
    }
}

struct GroupState<'a> {
    input: EntryStream<'a>,
    label: String,
    pending: Option<Entry>,
    deferred: Option<DbError>,
    exhausted: bool,
}

/// Fold runs of adjacent entries that differ only in `label`, appending their
/// `label` lists in row order.
fn group_adjacent<'a>(input: EntryStream<'a>, label: String) -> EntryStream<'a> {
    let state = GroupState {
        input,
        label,
        pending: None,
        deferred: None,
        exhausted: false,
    };

    stream::unfold(state, |mut st| async move {
        if let Some(e) = st.deferred.take() {
            return Some((Err(e), st));
        }
        while !st.exhausted {
            match st.input.next().await {
                Some(Ok(entry)) => match st.pending.take() {
                    None => st.pending = Some(entry),
                    Some(mut pending) if can_fold(&pending, &entry, &st.label) => {
                        pending.1.merge(entry.1);
                        st.pending = Some(pending);
                    }
                    Some(pending) => {
                        st.pending = Some(entry);
                        return Some((Ok(pending), st));
                    }
                },
                Some(Err(e)) => match st.pending.take() {
                    Some(pending) => {
                        st.deferred = Some(e);
                        return Some((Ok(pending), st));
                    }
                    None => return Some((Err(e), st)),
                },
                None => st.exhausted = true,
            }
        }
        let pending = st.pending.take()?;
        Some((Ok(pending), st))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    fn text(s: &str) -> Node {
        Node::Value(Value::Text(s.to_string()))
    }

    fn entry(id: i64, name: &str, address: &str) -> DbResult<Entry> {
        let mut record = Record::new();
        record.insert("id", Node::Value(Value::Integer(id)));
        record.insert("name", text(name));
        record.insert("address", text(address));
        Ok((Value::Integer(id), Node::Record(record)))
    }

    fn input(entries: Vec<DbResult<Entry>>) -> EntryStream<'static> {
        stream::iter(entries).boxed()
    }

    fn group_addresses() -> Stage {
        Stage::Select {
            pick: Pick::Value("address".into()),
            target: Target::GroupInto("addresses".into()),
        }
    }

    #[tokio::test]
    async fn test_group_into_folds_adjacent_rows() {
        let rows = input(vec![
            entry(1, "Vladimir", "Moskva"),
            entry(1, "Vladimir", "Vladivostok"),
            entry(2, "Olga", "Kazan"),
        ]);
        let out: Vec<Entry> = apply(group_addresses(), rows).try_collect().await.unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, Value::Integer(1));
        assert_eq!(
            out[0].1.get("addresses"),
            Some(&Node::List(vec![text("Moskva"), text("Vladivostok")]))
        );
        assert_eq!(out[0].1.get("address"), None);
        assert_eq!(
            out[1].1.get("addresses"),
            Some(&Node::List(vec![text("Kazan")]))
        );
    }

    #[tokio::test]
    async fn test_group_into_keeps_rows_with_different_fields_apart() {
        let rows = input(vec![
            entry(1, "Vladimir", "Moskva"),
            entry(1, "Volodya", "Vladivostok"),
        ]);
        let out: Vec<Entry> = apply(group_addresses(), rows).try_collect().await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_group_into_emits_pending_before_error() {
        let rows = input(vec![
            entry(1, "Vladimir", "Moskva"),
            Err(DbError::exec("disk I/O error", Some("10".into()))),
        ]);
        let mut out = apply(group_addresses(), rows);
        assert!(out.next().await.unwrap().is_ok());
        assert!(matches!(out.next().await, Some(Err(DbError::Exec { .. }))));
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_select_fields_name_map_flatten() {
        let rows = input(vec![entry(1, "Vladimir", "Moskva")]);
        let named = apply(
            Stage::Select {
                pick: Pick::Fields(vec!["name".into(), "address".into()]),
                target: Target::Name("user".into()),
            },
            rows,
        );
        let mapped = apply(
            Stage::Map {
                key: "id".into(),
                value: "user".into(),
            },
            named,
        );
        let out: Vec<Entry> = apply(Stage::Flatten, mapped).try_collect().await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Value::Integer(1));
        assert_eq!(out[0].1.get("name"), Some(&text("Vladimir")));
        assert_eq!(out[0].1.get("address"), Some(&text("Moskva")));
    }

    #[tokio::test]
    async fn test_select_value_project() {
        let rows = input(vec![entry(1, "Vladimir", "Moskva")]);
        let stage = Stage::Select {
            pick: Pick::Value("name".into()),
            target: Target::Project,
        };
        let out: Vec<Entry> = apply(stage, rows).try_collect().await.unwrap();
        assert_eq!(out, vec![(Value::Integer(1), text("Vladimir"))]);
    }

    #[tokio::test]
    async fn test_select_missing_column_is_an_error() {
        let rows = input(vec![entry(1, "Vladimir", "Moskva")]);
        let stage = Stage::Select {
            pick: Pick::Value("phone".into()),
            target: Target::Project,
        };
        let out: DbResult<Vec<Entry>> = apply(stage, rows).try_collect().await;
        assert!(matches!(out, Err(DbError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_filter() {
        let rows = input(vec![entry(1, "a", "x"), entry(2, "b", "y"), entry(3, "c", "z")]);
        let odd: Predicate = Arc::new(|key, _| key.as_i64().is_some_and(|id| id % 2 == 1));
        let out: Vec<Entry> = apply(Stage::Filter(odd), rows).try_collect().await.unwrap();
        let keys: Vec<Value> = out.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Value::Integer(1), Value::Integer(3)]);
    }
}
