//! Forward-only row cursor.

use super::engine::RowStream;
use crate::error::DbResult;
use crate::models::Row;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// Rows of one execution, produced as they are pulled.
///
/// The cursor is single-pass: rows already returned are never replayed. The
/// engine cursor is finalized when the last row has been read, when
/// [`RowCursor::close`] is called, or when the cursor is dropped. It borrows
/// the connection, so the connection cannot be released while it is open.
pub struct RowCursor<'c> {
    rows: Option<RowStream<'c>>,
    fetched: usize,
}

impl<'c> RowCursor<'c> {
    pub(crate) fn new(rows: RowStream<'c>) -> Self {
        Self {
            rows: Some(rows),
            fetched: 0,
        }
    }

    /// Next row, or `None` once the result is exhausted.
    pub async fn next(&mut self) -> DbResult<Option<Row>> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        match rows.next().await {
            Some(Ok(row)) => {
                self.fetched += 1;
                Ok(Some(row))
            }
            Some(Err(e)) => Err(e),
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    /// Finalize the engine cursor without reading the remaining rows.
    pub fn close(mut self) {
        self.finish();
    }

    pub fn is_closed(&self) -> bool {
        self.rows.is_none()
    }

    /// Rows returned so far.
    pub fn rows_fetched(&self) -> usize {
        self.fetched
    }

    fn finish(&mut self) {
        if self.rows.take().is_some() {
            debug!(rows = self.fetched, "Cursor finalized");
        }
    }
}

impl Stream for RowCursor<'_> {
    type Item = DbResult<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(rows) = this.rows.as_mut() else {
            return Poll::Ready(None);
        };
        match rows.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(row))) => {
                this.fetched += 1;
                Poll::Ready(Some(Ok(row)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for RowCursor<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
