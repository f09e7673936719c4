//! Prepared procedures.
//!
//! A [`Procedure`] is one statement text bound to a session's connection.
//! Callers queue typed parameters, then call a terminal method. Every terminal
//! expands the query against the queued parameters and clears them, so the
//! same procedure can be run again with fresh bindings.

use super::cursor::RowCursor;
use super::engine::{EngineConnection, ExecOutcome};
use super::expand::{self, BoundQuery};
use super::params::{Binding, TaggedValue};
use crate::error::DbResult;
use crate::models::{ParamType, Row, Value};
use crate::pipeline::{KeyCardinality, KeyColumn, Pipeline};
use futures_util::TryStreamExt;
use tracing::debug;

pub struct Procedure<'s, E: EngineConnection> {
    connection: &'s mut E,
    query: String,
    bindings: Vec<Binding>,
    /// Last expanded query handed to `fetch`, kept alive for the cursor.
    current: Option<BoundQuery>,
}

impl<'s, E: EngineConnection> Procedure<'s, E> {
    pub(crate) fn new(connection: &'s mut E, query: impl Into<String>) -> Self {
        Self {
            connection,
            query: query.into(),
            bindings: Vec::new(),
            current: None,
        }
    }

    /// Statement text as written, before expansion.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of bindings queued for the next terminal call.
    pub fn pending(&self) -> usize {
        self.bindings.len()
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Queue a raw binding.
    pub fn push_binding(&mut self, binding: Binding) -> &mut Self {
        self.bindings.push(binding);
        self
    }

    fn single(&mut self, kind: ParamType, value: Value) -> &mut Self {
        self.push_binding(Binding::Single(TaggedValue::typed(kind, value)))
    }

    fn list(&mut self, kind: ParamType, values: impl Iterator<Item = Value>) -> &mut Self {
        let items = values.map(|v| TaggedValue::typed(kind, v)).collect();
        self.push_binding(Binding::List(items))
    }

    pub fn bind_integer(&mut self, value: i64) -> &mut Self {
        self.single(ParamType::Integer, Value::Integer(value))
    }

    pub fn bind_float(&mut self, value: f64) -> &mut Self {
        self.single(ParamType::Float, Value::Float(value))
    }

    pub fn bind_string(&mut self, value: impl Into<String>) -> &mut Self {
        self.single(ParamType::Text, Value::Text(value.into()))
    }

    pub fn bind_blob(&mut self, value: impl Into<Vec<u8>>) -> &mut Self {
        self.single(ParamType::Blob, Value::Blob(value.into()))
    }

    pub fn bind_null(&mut self) -> &mut Self {
        self.single(ParamType::Text, Value::Null)
    }

    pub fn bind_nullable_integer(&mut self, value: Option<i64>) -> &mut Self {
        self.single(ParamType::Integer, value.into())
    }

    pub fn bind_nullable_float(&mut self, value: Option<f64>) -> &mut Self {
        self.single(ParamType::Float, value.into())
    }

    pub fn bind_nullable_string<S: Into<String>>(&mut self, value: Option<S>) -> &mut Self {
        self.single(
            ParamType::Text,
            value.map(|v| Value::Text(v.into())).unwrap_or(Value::Null),
        )
    }

    pub fn bind_nullable_blob<B: Into<Vec<u8>>>(&mut self, value: Option<B>) -> &mut Self {
        self.single(
            ParamType::Blob,
            value.map(|v| Value::Blob(v.into())).unwrap_or(Value::Null),
        )
    }

    /// Bind a list for a `?*` marker.
    pub fn bind_integer_list(&mut self, values: impl IntoIterator<Item = i64>) -> &mut Self {
        self.list(ParamType::Integer, values.into_iter().map(Value::Integer))
    }

    pub fn bind_float_list(&mut self, values: impl IntoIterator<Item = f64>) -> &mut Self {
        self.list(ParamType::Float, values.into_iter().map(Value::Float))
    }

    pub fn bind_string_list<S: Into<String>>(
        &mut self,
        values: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        self.list(
            ParamType::Text,
            values.into_iter().map(|v| Value::Text(v.into())),
        )
    }

    pub fn bind_blob_list<B: Into<Vec<u8>>>(
        &mut self,
        values: impl IntoIterator<Item = B>,
    ) -> &mut Self {
        self.list(
            ParamType::Blob,
            values.into_iter().map(|v| Value::Blob(v.into())),
        )
    }

    /// Bind a value under a single-character type code (`b`, `d`, `i`, `s`).
    ///
    /// The code is checked when the statement is bound, not here.
    pub fn bind_tagged(&mut self, tag: char, value: impl Into<Value>) -> &mut Self {
        self.push_binding(Binding::Single(TaggedValue::new(tag, value)))
    }

    pub fn bind_tagged_list<V: Into<Value>>(
        &mut self,
        tag: char,
        values: impl IntoIterator<Item = V>,
    ) -> &mut Self {
        let items = values
            .into_iter()
            .map(|v| TaggedValue::new(tag, v))
            .collect();
        self.push_binding(Binding::List(items))
    }

    /// Expand the query against the queued bindings, clearing them.
    pub fn expand(&mut self) -> DbResult<BoundQuery> {
        let bindings = std::mem::take(&mut self.bindings);
        let bound = expand::expand(&self.query, bindings)?;
        debug!(
            query = %self.query,
            sql = %bound.sql,
            params = bound.params.len(),
            "Expanded query"
        );
        Ok(bound)
    }

    // =========================================================================
    // Terminals
    // =========================================================================

    async fn run(&mut self) -> DbResult<ExecOutcome> {
        let bound = self.expand()?;
        self.connection.execute(&bound.sql, &bound.params).await
    }

    /// Run the statement, discarding any rows.
    pub async fn execute(&mut self) -> DbResult<()> {
        self.run().await.map(|_| ())
    }

    /// Run the statement and return the generated row id.
    pub async fn insert(&mut self) -> DbResult<i64> {
        self.run().await?;
        Ok(self.connection.last_insert_id())
    }

    /// Rows changed by the most recent execution on this connection.
    pub fn affected_rows(&self) -> u64 {
        self.connection.affected_rows()
    }

    /// Run the statement and read its rows lazily.
    pub async fn fetch(&mut self) -> DbResult<RowCursor<'_>> {
        let bound = self.expand()?;
        self.fetch_bound(bound).await
    }

    /// Run an already expanded query. Pipelines use this to run the same
    /// query again without re-binding.
    pub(crate) async fn fetch_bound(&mut self, bound: BoundQuery) -> DbResult<RowCursor<'_>> {
        let Self {
            connection,
            current,
            ..
        } = self;
        let bound = current.insert(bound);
        let rows = connection.fetch(&bound.sql, &bound.params).await?;
        Ok(RowCursor::new(rows))
    }

    /// First row, if any. The rest of the result is not read.
    pub async fn fetch_one(&mut self) -> DbResult<Option<Row>> {
        let mut cursor = self.fetch().await?;
        let row = cursor.next().await?;
        cursor.close();
        Ok(row)
    }

    pub async fn fetch_all(&mut self) -> DbResult<Vec<Row>> {
        self.fetch().await?.try_collect().await
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Reshape rows keyed by the first column, requiring exactly one key.
    pub fn process_one(self) -> Pipeline<'s, E> {
        Pipeline::new(self, KeyColumn::First, KeyCardinality::One)
    }

    /// Reshape rows keyed by the first column.
    pub fn process_all(self) -> Pipeline<'s, E> {
        Pipeline::new(self, KeyColumn::First, KeyCardinality::Any)
    }

    pub fn process_one_by(self, column: impl Into<String>) -> Pipeline<'s, E> {
        Pipeline::new(self, KeyColumn::Named(column.into()), KeyCardinality::One)
    }

    pub fn process_all_by(self, column: impl Into<String>) -> Pipeline<'s, E> {
        Pipeline::new(self, KeyColumn::Named(column.into()), KeyCardinality::Any)
    }

    /// Same pipeline as [`process_all`](Self::process_all), meant to be
    /// consumed through [`Pipeline::iterator`].
    pub fn stream(self) -> Pipeline<'s, E> {
        self.process_all()
    }
}
