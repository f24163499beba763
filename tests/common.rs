//! Shared harness for integration tests: a scriptable in-memory engine
//! behind the `Statement`/`SessionContext`/`Engine` traits, plus helpers
//! that spin up clusters of real loopback peers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use shardcast::cluster::{Endpoint, SchemaRef, StaticRing};
use shardcast::result::{MemoryResult, ResultSet};
use shardcast::router::Router;
use shardcast::server::PeerService;
use shardcast::session::SessionPool;
use shardcast::statement::{
    DdlChain, Engine, ParameterMeta, Row, SessionContext, SortOrder, Statement, StatementKind,
    TableFilter,
};
use shardcast::value::{type_ids, Value};
use shardcast::DbError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared state of one node's scripted engine: an execution log plus
/// programmable responses keyed by exact SQL text.
pub struct EngineState {
    pub name: String,
    pub log: Mutex<Vec<String>>,
    updates: Mutex<HashMap<String, i32>>,
    queries: Mutex<HashMap<String, (usize, Vec<Vec<Value>>)>>,
}

impl EngineState {
    fn new(name: String) -> Arc<Self> {
        Arc::new(EngineState {
            name,
            log: Mutex::new(Vec::new()),
            updates: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
        })
    }
}

#[derive(Clone)]
pub struct StubEngine(pub Arc<EngineState>);

impl StubEngine {
    pub fn new(name: impl Into<String>) -> Self {
        StubEngine(EngineState::new(name.into()))
    }

    pub fn log(&self) -> Vec<String> {
        self.0.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.0.log.lock().unwrap().clear();
    }

    /// Number of log entries containing `needle`.
    pub fn executed(&self, needle: &str) -> usize {
        self.0
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.contains(needle))
            .count()
    }

    pub fn set_update_count(&self, sql: &str, count: i32) {
        self.0.updates.lock().unwrap().insert(sql.to_string(), count);
    }

    pub fn set_query_result(&self, sql: &str, columns: usize, rows: Vec<Vec<Value>>) {
        self.0
            .queries
            .lock()
            .unwrap()
            .insert(sql.to_string(), (columns, rows));
    }

    fn session(&self, coordinator: bool) -> StubSession {
        StubSession(Arc::new(SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            coordinator,
            ddl: DdlChain::default(),
            state: self.0.clone(),
        }))
    }
}

#[async_trait]
impl Engine for StubEngine {
    async fn open_session(&self, coordinator: bool) -> Result<Arc<dyn SessionContext>, DbError> {
        Ok(Arc::new(self.session(coordinator)))
    }
}

struct SessionInner {
    id: u64,
    coordinator: bool,
    ddl: DdlChain,
    state: Arc<EngineState>,
}

#[derive(Clone)]
pub struct StubSession(Arc<SessionInner>);

#[async_trait]
impl SessionContext for StubSession {
    fn id(&self) -> u64 {
        self.0.id
    }

    fn url_for(&self, endpoint: &Endpoint) -> String {
        endpoint.addr().to_string()
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>, DbError> {
        self.0
            .state
            .log
            .lock()
            .unwrap()
            .push(format!("prepare:{sql}"));
        Ok(StubStatement::prepared(self.clone(), sql))
    }

    fn ddl_chain(&self) -> &DdlChain {
        &self.0.ddl
    }

    fn local_transaction_name(&self) -> String {
        format!("{}#tx", self.0.state.name)
    }
}

/// Shape flags of a scripted select.
#[derive(Default)]
struct SelectShape {
    group: bool,
    order: Option<SortOrder>,
    limit: Option<i64>,
    has_limit_or_offset: bool,
}

/// A scripted statement. Special SQL markers drive behavior:
/// `#ROWS:<n>#...` reports `n` as its update count, `SLOW` sleeps inside
/// query execution, `SLOWUPDATE` sleeps inside update execution, `FAIL`
/// fails, and `REDUCE:...` accepts input rows and sums the first column.
pub struct StubStatement {
    session: StubSession,
    kind: StatementKind,
    sql: String,
    local: AtomicBool,
    fetch: AtomicI32,
    param_count: usize,
    params: Mutex<Vec<Value>>,
    schema: Mutex<SchemaRef>,
    filter: Mutex<Option<TableFilter>>,
    rows: Mutex<Vec<Row>>,
    source: Mutex<Option<Arc<dyn Statement>>>,
    shape: Mutex<SelectShape>,
}

impl StubStatement {
    fn prepared(session: StubSession, sql: &str) -> Arc<Self> {
        Self::build(session, Self::infer_kind(sql), sql)
    }

    fn infer_kind(sql: &str) -> StatementKind {
        let stripped = sql
            .rsplit('#')
            .next()
            .unwrap_or(sql)
            .trim_start_matches("PLAN:")
            .trim_start_matches("REDUCE:");
        let first = stripped
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match first.as_str() {
            "CREATE" | "DROP" | "ALTER" => StatementKind::Define,
            "INSERT" => StatementKind::Insert,
            "MERGE" => StatementKind::Merge,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            _ => StatementKind::Select,
        }
    }

    pub fn build(session: StubSession, kind: StatementKind, sql: &str) -> Arc<Self> {
        // inlined-row plans carry no placeholders
        let param_count = if sql.starts_with("#ROWS:") {
            0
        } else {
            sql.matches('?').count()
        };
        Arc::new(StubStatement {
            session,
            kind,
            sql: sql.to_string(),
            local: AtomicBool::new(false),
            fetch: AtomicI32::new(64),
            param_count,
            params: Mutex::new(Vec::new()),
            schema: Mutex::new(SchemaRef::new("app.t")),
            filter: Mutex::new(None),
            rows: Mutex::new(Vec::new()),
            source: Mutex::new(None),
            shape: Mutex::new(SelectShape::default()),
        })
    }

    pub fn with_filter(self: Arc<Self>, schema: &str, key: Option<Value>) -> Arc<Self> {
        *self.schema.lock().unwrap() = SchemaRef::new(schema);
        *self.filter.lock().unwrap() = Some(TableFilter {
            schema: SchemaRef::new(schema),
            partition_key: key,
        });
        self
    }

    pub fn with_rows(self: Arc<Self>, rows: Vec<Row>) -> Arc<Self> {
        *self.rows.lock().unwrap() = rows;
        self
    }

    pub fn with_source_query(self: Arc<Self>, query: Arc<dyn Statement>) -> Arc<Self> {
        *self.source.lock().unwrap() = Some(query);
        self
    }

    pub fn with_group(self: Arc<Self>) -> Arc<Self> {
        self.shape.lock().unwrap().group = true;
        self
    }

    pub fn with_order(self: Arc<Self>, order: SortOrder) -> Arc<Self> {
        self.shape.lock().unwrap().order = Some(order);
        self
    }

    pub fn with_limit(self: Arc<Self>, limit: i64) -> Arc<Self> {
        let mut shape = self.shape.lock().unwrap();
        shape.limit = Some(limit);
        shape.has_limit_or_offset = true;
        drop(shape);
        self
    }

    pub fn with_params(self: Arc<Self>, values: Vec<Value>) -> Arc<Self> {
        *self.params.lock().unwrap() = values;
        self
    }

    pub fn current_rows(&self) -> Vec<Row> {
        self.rows.lock().unwrap().clone()
    }

    fn state(&self) -> &Arc<EngineState> {
        &self.session.0.state
    }
}

#[async_trait]
impl Statement for StubStatement {
    fn kind(&self) -> StatementKind {
        self.kind
    }

    fn is_local(&self) -> bool {
        self.local.load(Ordering::SeqCst)
    }

    fn set_local(&self, local: bool) {
        self.local.store(local, Ordering::SeqCst);
    }

    fn sql(&self) -> String {
        self.sql.clone()
    }

    fn fetch_size(&self) -> i32 {
        self.fetch.load(Ordering::SeqCst)
    }

    fn set_fetch_size(&self, fetch: i32) {
        self.fetch.store(fetch, Ordering::SeqCst);
    }

    fn session(&self) -> Arc<dyn SessionContext> {
        Arc::new(self.session.clone())
    }

    fn parameters(&self) -> Vec<Value> {
        self.params.lock().unwrap().clone()
    }

    fn set_parameter(&self, index: usize, value: Value) {
        let mut params = self.params.lock().unwrap();
        if params.len() <= index {
            params.resize(index + 1, Value::Null);
        }
        params[index] = value;
    }

    fn parameter_metas(&self) -> Vec<ParameterMeta> {
        (0..self.param_count.max(self.params.lock().unwrap().len()))
            .map(|_| ParameterMeta::default())
            .collect()
    }

    fn top_filter(&self) -> Option<TableFilter> {
        self.filter.lock().unwrap().clone()
    }

    fn schema(&self) -> SchemaRef {
        self.schema.lock().unwrap().clone()
    }

    async fn update_local(&self) -> Result<i32, DbError> {
        let state = self.state();
        state.log.lock().unwrap().push(format!("update:{}", self.sql));
        if self.sql.contains("SLOWUPDATE") {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        if self.sql.contains("FAIL") {
            return Err(DbError::Cluster("scripted failure".into()));
        }
        if let Some(rest) = self.sql.strip_prefix("#ROWS:") {
            let count = rest
                .split('#')
                .next()
                .and_then(|n| n.parse::<i32>().ok())
                .unwrap_or(0);
            return Ok(count);
        }
        let routed = self.rows.lock().unwrap().len();
        if routed > 0 {
            return Ok(routed as i32);
        }
        Ok(*state.updates.lock().unwrap().get(&self.sql).unwrap_or(&1))
    }

    async fn query_local(&self, max_rows: i32) -> Result<Box<dyn ResultSet>, DbError> {
        let state = self.state();
        state.log.lock().unwrap().push(format!("query:{}", self.sql));
        if self.sql.contains("SLOW") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.sql.contains("FAIL") {
            return Err(DbError::Cluster("scripted failure".into()));
        }
        let (columns, mut rows) = state
            .queries
            .lock()
            .unwrap()
            .get(&self.sql)
            .cloned()
            .unwrap_or((1, Vec::new()));
        if max_rows > 0 && rows.len() > max_rows as usize {
            rows.truncate(max_rows as usize);
        }
        if self.sql.contains("STREAM") {
            return Ok(Box::new(Unbounded(MemoryResult::new(columns, rows))));
        }
        Ok(Box::new(MemoryResult::new(columns, rows)))
    }

    async fn query_meta(&self) -> Result<Box<dyn ResultSet>, DbError> {
        let columns = self
            .state()
            .queries
            .lock()
            .unwrap()
            .get(&self.sql)
            .map(|(c, _)| *c)
            .unwrap_or(1);
        let rows = (0..columns)
            .map(|i| vec![Value::Text(format!("C{}", i + 1)), Value::Int(type_ids::TEXT)])
            .collect();
        Ok(Box::new(MemoryResult::new(2, rows)))
    }

    fn plan_sql(&self, _distributed: bool, for_reducer: bool) -> String {
        if for_reducer {
            format!("REDUCE:{}", self.sql)
        } else {
            format!("PLAN:{}", self.sql)
        }
    }

    fn rows(&self) -> Vec<Row> {
        self.rows.lock().unwrap().clone()
    }

    fn set_rows(&self, rows: Vec<Row>) {
        *self.rows.lock().unwrap() = rows;
    }

    fn rows_plan_sql(&self, rows: &[Row]) -> String {
        let keys = rows
            .iter()
            .map(|r| r.key.as_ref().map(|k| k.to_string()).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        format!("#ROWS:{}#KEYS:{}#{}", rows.len(), keys, self.sql)
    }

    fn source_query(&self) -> Option<Arc<dyn Statement>> {
        self.source.lock().unwrap().clone()
    }

    fn is_group_query(&self) -> bool {
        self.shape.lock().unwrap().group
    }

    fn sort_order(&self) -> Option<SortOrder> {
        self.shape.lock().unwrap().order.clone()
    }

    fn limit_rows(&self) -> Option<i64> {
        self.shape.lock().unwrap().limit
    }

    fn has_limit_or_offset(&self) -> bool {
        self.shape.lock().unwrap().has_limit_or_offset
    }

    async fn query_with_input(
        &self,
        _column_count: usize,
        rows: Vec<Vec<Value>>,
    ) -> Result<Box<dyn ResultSet>, DbError> {
        if !self.sql.starts_with("REDUCE:") {
            return Err(DbError::unsupported("statement does not accept input rows"));
        }
        let mut total: i64 = 0;
        for row in rows {
            total += match row.first() {
                Some(Value::Int(i)) => *i as i64,
                Some(Value::Long(l)) => *l,
                _ => 0,
            };
        }
        Ok(Box::new(MemoryResult::new(1, vec![vec![Value::Long(total)]])))
    }
}

/// A result whose total row count is not known up front; forces the
/// streamed wire shape.
struct Unbounded(MemoryResult);

#[async_trait]
impl ResultSet for Unbounded {
    fn column_count(&self) -> usize {
        self.0.column_count()
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        self.0.next_row().await
    }
}

/// One in-process node: scripted engine, ring view, router, peer service.
pub struct TestNode {
    pub endpoint: Endpoint,
    pub ring: Arc<StaticRing>,
    pub engine: StubEngine,
    pub router: Arc<Router>,
}

impl TestNode {
    /// Build an originating statement bound to a fresh local session on
    /// this node.
    pub fn statement(&self, kind: StatementKind, sql: &str) -> Arc<StubStatement> {
        StubStatement::build(self.engine.session(false), kind, sql)
    }
}

pub struct ClusterOpts {
    pub nodes: usize,
    pub rf: usize,
    pub vnodes: usize,
    pub seeds: usize,
    pub datacenter_of: Option<fn(usize) -> String>,
}

impl Default for ClusterOpts {
    fn default() -> Self {
        ClusterOpts {
            nodes: 3,
            rf: 2,
            vnodes: 8,
            seeds: 1,
            datacenter_of: None,
        }
    }
}

/// Bind every node's listener first so all addresses are known, then wire
/// each node's ring, router, and peer service on real loopback sockets.
pub async fn start_cluster(opts: ClusterOpts) -> Vec<TestNode> {
    init_logs();
    let mut listeners = Vec::with_capacity(opts.nodes);
    let mut endpoints = Vec::with_capacity(opts.nodes);
    for _ in 0..opts.nodes {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        endpoints.push(Endpoint::new(format!("127.0.0.1:{port}")));
        listeners.push(listener);
    }
    let seeds: Vec<Endpoint> = endpoints[..opts.seeds.max(1).min(opts.nodes)].to_vec();

    let mut nodes = Vec::with_capacity(opts.nodes);
    for (i, listener) in listeners.into_iter().enumerate() {
        let peers: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| **e != endpoints[i])
            .cloned()
            .collect();
        let mut ring = StaticRing::new(
            endpoints[i].clone(),
            peers,
            seeds.clone(),
            opts.vnodes,
            opts.rf,
        );
        if let Some(dc_of) = opts.datacenter_of {
            for (j, endpoint) in endpoints.iter().enumerate() {
                ring.set_datacenter(endpoint.clone(), dc_of(j));
            }
        }
        let ring = Arc::new(ring);
        let engine = StubEngine::new(format!("node{i}"));
        let pool = Arc::new(SessionPool::new());
        let router = Arc::new(Router::with_rng_seed(
            ring.clone(),
            ring.clone(),
            ring.clone(),
            pool,
            0xC0FFEE + i as u64,
        ));
        let service = PeerService::new(Arc::new(engine.clone()), router.clone());
        tokio::spawn(service.serve(listener));
        nodes.push(TestNode {
            endpoint: endpoints[i].clone(),
            ring,
            engine,
            router,
        });
    }
    nodes
}

/// The subset of `nodes` owning `key` under `node`'s ring view.
pub fn owners_of(node: &TestNode, schema: &str, key: &Value) -> Vec<Endpoint> {
    use shardcast::cluster::Replication;
    let token = node.ring.token_of(&key.bytes_for_hash());
    let mut owners = node
        .ring
        .natural_endpoints(&SchemaRef::new(schema), token);
    owners.extend(node.ring.pending_endpoints_for(token, schema));
    owners
}

/// Drain a boxed result into rows.
pub async fn rows_of(result: &mut Box<dyn ResultSet>) -> Vec<Vec<Value>> {
    shardcast::result::collect_rows(result.as_mut())
        .await
        .expect("drain result")
}
