//! Result views over local and per-peer row streams.
//!
//! Three composers assemble distributed select results: [`SerializedResult`]
//! streams the union of per-peer results lazily in list order,
//! [`SortedResult`] merges consistently pre-sorted per-peer results into the
//! global order, and [`MergedResult`] pushes partial aggregates through a
//! locally prepared reducer select.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::ClientCommand;
use crate::error::DbError;
use crate::statement::{SortOrder, Statement};
use crate::transfer::Transfer;
use crate::value::Value;

/// A forward-only stream of rows. `max_rows == 0` means unlimited
/// everywhere a row cap is taken.
#[async_trait]
pub trait ResultSet: Send {
    fn column_count(&self) -> usize;

    /// Total row count when the producer determined it up front.
    fn row_count(&self) -> Option<i32> {
        None
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError>;

    async fn close(&mut self) {}
}

/// An in-memory result; the building block engines and tests hand back
/// from local execution.
pub struct MemoryResult {
    column_count: usize,
    rows: VecDeque<Vec<Value>>,
    total: i32,
}

impl MemoryResult {
    pub fn new(column_count: usize, rows: Vec<Vec<Value>>) -> Self {
        let total = rows.len() as i32;
        MemoryResult {
            column_count,
            rows: rows.into(),
            total,
        }
    }

    pub fn empty(column_count: usize) -> Self {
        Self::new(column_count, Vec::new())
    }
}

#[async_trait]
impl ResultSet for MemoryResult {
    fn column_count(&self) -> usize {
        self.column_count
    }

    fn row_count(&self) -> Option<i32> {
        Some(self.total)
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        Ok(self.rows.pop_front())
    }
}

/// Rows read off a peer's execute/meta response.
///
/// Row data arrives inline within the response while the session lock is
/// held, so the result is fully buffered by the time the command returns;
/// `row_count` distinguishes the determined and undetermined wire shapes.
#[derive(Debug)]
pub struct ClientResult {
    column_count: usize,
    determined: Option<i32>,
    rows: VecDeque<Vec<Value>>,
}

impl ClientResult {
    /// Read a row-count-determined response body: exactly `row_count` rows.
    pub(crate) async fn read_determined(
        transfer: &mut Transfer,
        column_count: i32,
        row_count: i32,
    ) -> Result<Self, DbError> {
        let mut rows = VecDeque::with_capacity(row_count.max(0) as usize);
        for _ in 0..row_count {
            rows.push_back(Self::read_row(transfer, column_count).await?);
        }
        Ok(ClientResult {
            column_count: column_count as usize,
            determined: Some(row_count),
            rows,
        })
    }

    /// Read a row-count-undetermined response body: flag-prefixed rows
    /// until the peer writes the end flag.
    pub(crate) async fn read_streamed(
        transfer: &mut Transfer,
        column_count: i32,
    ) -> Result<Self, DbError> {
        let mut rows = VecDeque::new();
        while transfer.read_boolean().await? {
            rows.push_back(Self::read_row(transfer, column_count).await?);
        }
        Ok(ClientResult {
            column_count: column_count as usize,
            determined: None,
            rows,
        })
    }

    async fn read_row(transfer: &mut Transfer, column_count: i32) -> Result<Vec<Value>, DbError> {
        let mut row = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count.max(0) {
            row.push(transfer.read_value().await?);
        }
        Ok(row)
    }
}

#[async_trait]
impl ResultSet for ClientResult {
    fn column_count(&self) -> usize {
        self.column_count
    }

    fn row_count(&self) -> Option<i32> {
        self.determined
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        Ok(self.rows.pop_front())
    }
}

/// One source of a [`SerializedResult`]: the local statement or a prepared
/// remote command, executed only when the union stream reaches it.
pub enum SerialSource {
    Local(Arc<dyn Statement>),
    Remote(ClientCommand),
}

/// The logical union of per-peer row streams, drained in list order.
/// Used for selects with neither GROUP BY nor ORDER BY; `limit` caps the
/// union.
pub struct SerializedResult {
    pending: VecDeque<SerialSource>,
    current: Option<Box<dyn ResultSet>>,
    max_rows: i32,
    scrollable: bool,
    limit: Option<i64>,
    emitted: i64,
    column_count: usize,
}

impl SerializedResult {
    /// Activate the first source (the local one) and leave the rest
    /// untouched until the stream reaches them.
    pub async fn open(
        sources: Vec<SerialSource>,
        max_rows: i32,
        scrollable: bool,
        limit: Option<i64>,
    ) -> Result<Self, DbError> {
        let mut result = SerializedResult {
            pending: sources.into(),
            current: None,
            max_rows,
            scrollable,
            limit,
            emitted: 0,
            column_count: 0,
        };
        result.advance().await?;
        Ok(result)
    }

    async fn advance(&mut self) -> Result<(), DbError> {
        if let Some(mut done) = self.current.take() {
            done.close().await;
        }
        if let Some(source) = self.pending.pop_front() {
            let rows: Box<dyn ResultSet> = match source {
                SerialSource::Local(statement) => statement.query_local(self.max_rows).await?,
                SerialSource::Remote(mut command) => {
                    let result = command.execute_query(self.max_rows, self.scrollable).await?;
                    command.close().await;
                    Box::new(result)
                }
            };
            self.column_count = rows.column_count();
            self.current = Some(rows);
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSet for SerializedResult {
    fn column_count(&self) -> usize {
        self.column_count
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return Ok(None);
            }
        }
        loop {
            let Some(current) = self.current.as_mut() else {
                return Ok(None);
            };
            if let Some(row) = current.next_row().await? {
                self.emitted += 1;
                return Ok(Some(row));
            }
            self.advance().await?;
        }
    }

    async fn close(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.close().await;
        }
        // unexecuted remote commands still hold prepared server handles
        while let Some(source) = self.pending.pop_front() {
            if let SerialSource::Remote(mut command) = source {
                command.close().await;
            }
        }
    }
}

/// Globally sorted union of per-peer results that each arrive sorted by
/// the same order: an N-way merge with one-row lookahead per source.
pub struct SortedResult {
    order: SortOrder,
    sources: Vec<Box<dyn ResultSet>>,
    heads: Vec<Option<Vec<Value>>>,
    column_count: usize,
    max_rows: i32,
    emitted: i32,
}

impl SortedResult {
    pub async fn open(
        order: SortOrder,
        max_rows: i32,
        mut sources: Vec<Box<dyn ResultSet>>,
    ) -> Result<Self, DbError> {
        let column_count = sources.first().map(|s| s.column_count()).unwrap_or(0);
        let mut heads = Vec::with_capacity(sources.len());
        for source in &mut sources {
            heads.push(source.next_row().await?);
        }
        Ok(SortedResult {
            order,
            sources,
            heads,
            column_count,
            max_rows,
            emitted: 0,
        })
    }
}

#[async_trait]
impl ResultSet for SortedResult {
    fn column_count(&self) -> usize {
        self.column_count
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        if self.max_rows > 0 && self.emitted >= self.max_rows {
            return Ok(None);
        }
        // first source wins ties, keeping the merge stable
        let best = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(i, head)| head.as_ref().map(|row| (i, row)))
            .fold(None::<(usize, &Vec<Value>)>, |acc, (i, row)| match acc {
                Some((_, current)) if self.order.compare(row, current) != std::cmp::Ordering::Less => acc,
                _ => Some((i, row)),
            })
            .map(|(i, _)| i);
        let Some(i) = best else {
            return Ok(None);
        };
        let Some(row) = self.heads[i].take() else {
            return Ok(None);
        };
        self.heads[i] = self.sources[i].next_row().await?;
        self.emitted += 1;
        Ok(Some(row))
    }

    async fn close(&mut self) {
        for source in &mut self.sources {
            source.close().await;
        }
    }
}

/// Partial aggregates from every peer, finished by a locally prepared
/// reducer select (`plan_sql(true, true)`), which also reapplies ORDER
/// BY / LIMIT / OFFSET.
pub struct MergedResult {
    inner: Box<dyn ResultSet>,
}

impl MergedResult {
    pub async fn reduce(
        mut results: Vec<Box<dyn ResultSet>>,
        reducer: Arc<dyn Statement>,
    ) -> Result<Self, DbError> {
        let column_count = results.first().map(|r| r.column_count()).unwrap_or(0);
        let mut rows = Vec::new();
        for result in &mut results {
            while let Some(row) = result.next_row().await? {
                rows.push(row);
            }
            result.close().await;
        }
        let inner = reducer.query_with_input(column_count, rows).await?;
        Ok(MergedResult { inner })
    }
}

#[async_trait]
impl ResultSet for MergedResult {
    fn column_count(&self) -> usize {
        self.inner.column_count()
    }

    fn row_count(&self) -> Option<i32> {
        self.inner.row_count()
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        self.inner.next_row().await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// Drain a result into plain row vectors. Test and tooling helper.
pub async fn collect_rows(result: &mut dyn ResultSet) -> Result<Vec<Vec<Value>>, DbError> {
    let mut rows = Vec::new();
    while let Some(row) = result.next_row().await? {
        rows.push(row);
    }
    Ok(rows)
}
