//! The statement shape the router dispatches on.
//!
//! Parsing and local execution belong to the database engine; statements
//! cross into the router as trait objects carrying the capability set the
//! dispatch table needs: verb, locality, SQL text and plan SQL, bound
//! parameters, and the owning session context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Endpoint, SchemaRef};
use crate::error::DbError;
use crate::result::ResultSet;
use crate::value::{type_ids, Value};

/// Statement verb; keys the router's dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Define,
    Insert,
    Merge,
    Update,
    Delete,
    Select,
}

/// A routed row: optional partition key plus column values. A missing key
/// is replaced by a fresh random UUID before routing, and the substituted
/// key travels with the row.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub key: Option<Value>,
    pub columns: Vec<Value>,
}

impl Row {
    pub fn new(key: Option<Value>, columns: Vec<Value>) -> Self {
        Row { key, columns }
    }
}

/// The primary table filter of a statement, as far as routing cares: the
/// schema it reads and the single partition-key literal the filter pins,
/// when it pins one.
#[derive(Clone, Debug)]
pub struct TableFilter {
    pub schema: SchemaRef,
    pub partition_key: Option<Value>,
}

/// One key of a select's ORDER BY: projected column index plus direction.
#[derive(Clone, Copy, Debug)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
}

/// A select's complete sort order.
#[derive(Clone, Debug)]
pub struct SortOrder(pub Vec<SortKey>);

impl SortOrder {
    pub fn compare(&self, a: &[Value], b: &[Value]) -> std::cmp::Ordering {
        for key in &self.0 {
            let (x, y) = (&a[key.column], &b[key.column]);
            let ord = crate::value::cmp_values(x, y);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    }
}

/// Parameter metadata as reported by a prepare response.
#[derive(Clone, Copy, Debug)]
pub struct ParameterMeta {
    pub data_type: i32,
    pub precision: i64,
    pub scale: i32,
    pub nullable: i32,
}

impl Default for ParameterMeta {
    fn default() -> Self {
        ParameterMeta {
            data_type: type_ids::UNKNOWN,
            precision: 0,
            scale: 0,
            nullable: crate::command::NULLABLE_UNKNOWN,
        }
    }
}

/// Marker that the owning session is already inside a serialized DDL
/// chain. While the marker is set, the router must not take its own DDL
/// mutex again; the outer serialization point holds it.
#[derive(Default)]
pub struct DdlChain(AtomicBool);

impl DdlChain {
    pub fn enter(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The originating local session a statement runs under.
#[async_trait]
pub trait SessionContext: Send + Sync {
    /// Stable identity; keys peer-session interning.
    fn id(&self) -> u64;

    /// Connection URL for a cluster endpoint as this session would dial it.
    fn url_for(&self, endpoint: &Endpoint) -> String;

    /// Parse and prepare a statement locally; used for reducer selects and
    /// re-prepared plan SQL.
    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>, DbError>;

    /// Re-entrant-DDL marker for this session.
    fn ddl_chain(&self) -> &DdlChain;

    /// The local transaction name this session's engine reports to remote
    /// coordinators during a distributed transaction.
    fn local_transaction_name(&self) -> String {
        String::new()
    }
}

/// A parsed statement with everything the router needs to dispatch it.
///
/// Mutating operations (`set_local`, `set_rows`, parameter binding) use
/// interior mutability; statements are shared as `Arc<dyn Statement>`
/// between the router and the callables it synthesizes.
#[async_trait]
pub trait Statement: Send + Sync {
    fn kind(&self) -> StatementKind;

    fn is_local(&self) -> bool;
    fn set_local(&self, local: bool);

    fn sql(&self) -> String;

    fn fetch_size(&self) -> i32;
    fn set_fetch_size(&self, fetch: i32);

    fn session(&self) -> Arc<dyn SessionContext>;

    /// Currently bound parameter values, positional.
    fn parameters(&self) -> Vec<Value>;
    fn set_parameter(&self, index: usize, value: Value);

    /// Metadata for each parameter placeholder.
    fn parameter_metas(&self) -> Vec<ParameterMeta> {
        self.parameters()
            .iter()
            .map(|_| ParameterMeta::default())
            .collect()
    }

    /// The primary table filter routing keys off, when the statement has
    /// one.
    fn top_filter(&self) -> Option<TableFilter>;

    fn schema(&self) -> SchemaRef;

    /// Execute on this node's engine, returning the update count.
    async fn update_local(&self) -> Result<i32, DbError>;

    /// Execute on this node's engine, returning rows.
    async fn query_local(&self, max_rows: i32) -> Result<Box<dyn ResultSet>, DbError>;

    /// Column metadata of a query statement, as rows.
    async fn query_meta(&self) -> Result<Box<dyn ResultSet>, DbError> {
        Err(DbError::unsupported("statement has no result metadata"))
    }

    /// Rewritten SQL for distributed execution; with `for_reducer` the SQL
    /// finishes partial aggregates locally.
    fn plan_sql(&self, distributed: bool, for_reducer: bool) -> String {
        let _ = (distributed, for_reducer);
        self.sql()
    }

    // Insert / merge capabilities.

    fn rows(&self) -> Vec<Row> {
        Vec::new()
    }

    fn set_rows(&self, _rows: Vec<Row>) {}

    /// Plan SQL with exactly the given row subset inlined, shipped to the
    /// peer owning that subset.
    fn rows_plan_sql(&self, _rows: &[Row]) -> String {
        self.sql()
    }

    /// The sub-query of an `INSERT ... SELECT` / `MERGE ... SELECT`.
    fn source_query(&self) -> Option<Arc<dyn Statement>> {
        None
    }

    // Select capabilities.

    fn is_group_query(&self) -> bool {
        false
    }

    fn sort_order(&self) -> Option<SortOrder> {
        None
    }

    fn limit_rows(&self) -> Option<i64> {
        None
    }

    fn has_limit_or_offset(&self) -> bool {
        false
    }

    /// Reducer hook: evaluate this (local) select over externally supplied
    /// input rows instead of stored data. Used to finish partial
    /// aggregates gathered from peers.
    async fn query_with_input(
        &self,
        _column_count: usize,
        _rows: Vec<Vec<Value>>,
    ) -> Result<Box<dyn ResultSet>, DbError> {
        Err(DbError::unsupported("statement does not accept input rows"))
    }
}

/// Factory the peer service uses to open engine sessions for incoming
/// connections. `coordinator` distinguishes seed-forwarded sessions, whose
/// statements route onward, from replica sessions, whose statements always
/// execute locally.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn open_session(&self, coordinator: bool) -> Result<Arc<dyn SessionContext>, DbError>;
}
