//! Partition-aware statement dispatch.
//!
//! For every statement verb the router computes the target endpoint set,
//! turns each remote target into a prepared command on a pooled peer
//! session, wraps local execution and remote commands into one batch of
//! callables, and hands the batch to the parallel executor. Update paths
//! return a summed count; query paths return a composed result.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument};

use crate::cluster::{Endpoint, Membership, Replication, Topology};
use crate::error::DbError;
use crate::parallel::{execute_select_batch, execute_update_batch};
use crate::partition::PartitionResolver;
use crate::result::{MergedResult, ResultSet, SerialSource, SerializedResult, SortedResult};
use crate::session::SessionPool;
use crate::statement::{Row, Statement, StatementKind};
use crate::value::Value;

pub struct Router {
    membership: Arc<dyn Membership>,
    topology: Arc<dyn Topology>,
    resolver: PartitionResolver,
    pool: Arc<SessionPool>,
    /// Serializes DDL on the seed. Skipped when the originating session is
    /// already inside a serialized chain.
    ddl_lock: tokio::sync::Mutex<()>,
    rng: StdMutex<SmallRng>,
}

impl Router {
    pub fn new(
        membership: Arc<dyn Membership>,
        topology: Arc<dyn Topology>,
        replication: Arc<dyn Replication>,
        pool: Arc<SessionPool>,
    ) -> Self {
        Self::with_rng(membership, topology, replication, pool, SmallRng::from_entropy())
    }

    /// Deterministic tie-breaking for tests.
    pub fn with_rng_seed(
        membership: Arc<dyn Membership>,
        topology: Arc<dyn Topology>,
        replication: Arc<dyn Replication>,
        pool: Arc<SessionPool>,
        seed: u64,
    ) -> Self {
        Self::with_rng(
            membership,
            topology,
            replication,
            pool,
            SmallRng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        membership: Arc<dyn Membership>,
        topology: Arc<dyn Topology>,
        replication: Arc<dyn Replication>,
        pool: Arc<SessionPool>,
        rng: SmallRng,
    ) -> Self {
        Router {
            membership,
            topology,
            resolver: PartitionResolver::new(replication),
            pool,
            ddl_lock: tokio::sync::Mutex::new(()),
            rng: StdMutex::new(rng),
        }
    }

    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Dispatch a mutating statement per its verb.
    pub async fn execute_update(&self, statement: Arc<dyn Statement>) -> Result<i32, DbError> {
        match statement.kind() {
            StatementKind::Define => self.execute_define(statement).await,
            StatementKind::Insert | StatementKind::Merge => {
                self.execute_insert_or_merge(statement).await
            }
            StatementKind::Update | StatementKind::Delete => {
                self.execute_update_or_delete(statement).await
            }
            StatementKind::Select => Err(DbError::unsupported("select routed as update")),
        }
    }

    // ── DDL ──────────────────────────────────────────────────────────────

    /// DDL runs on every member. A non-seed node forwards to the first
    /// live seed; the seed serializes cluster-wide execution under one
    /// mutex and returns the summed count.
    #[instrument(skip_all, fields(sql = %statement.sql()))]
    async fn execute_define(&self, statement: Arc<dyn Statement>) -> Result<i32, DbError> {
        if statement.is_local() {
            return statement.update_local().await;
        }
        let seed = self
            .membership
            .first_live_seed_endpoint()
            .ok_or_else(|| DbError::Cluster("no live seed endpoint".into()))?;
        let context = statement.session();

        if seed != self.membership.broadcast_address() {
            info!(%seed, "forwarding ddl to seed");
            let url = context.url_for(&seed);
            let session = self.pool.seed_endpoint_session(context.id(), &url).await?;
            let mut command = SessionPool::command_on(
                session,
                &statement.sql(),
                statement.parameters(),
                statement.fetch_size(),
            )
            .await?;
            let count = command.execute_update().await;
            command.close().await;
            return count;
        }

        // This node is the seed. A session already marked as serialized
        // is re-entering from a forwarded chain; the outer holder of the
        // DDL mutex serializes for it, and taking the mutex again here
        // would deadlock the chain.
        if context.ddl_chain().active() {
            return self.define_fan_out(&statement).await;
        }
        let _serial = self.ddl_lock.lock().await;
        context.ddl_chain().enter();
        let outcome = self.define_fan_out(&statement).await;
        context.ddl_chain().leave();
        outcome
    }

    async fn define_fan_out(&self, statement: &Arc<dyn Statement>) -> Result<i32, DbError> {
        let this = self.membership.broadcast_address();
        let members = self.sorted_live_members();
        debug!(members = members.len(), "ddl fan-out");
        let mut tasks = Vec::with_capacity(members.len());
        tasks.push(Self::local_update_callable(statement.clone()));
        let sql = statement.sql();
        for endpoint in members.into_iter().filter(|m| *m != this) {
            tasks.push(self.update_callable(endpoint, statement, sql.clone()));
        }
        execute_update_batch(tasks).await
    }

    // ── INSERT / MERGE ───────────────────────────────────────────────────

    #[instrument(skip_all, fields(kind = ?statement.kind(), sql = %statement.sql()))]
    async fn execute_insert_or_merge(&self, statement: Arc<dyn Statement>) -> Result<i32, DbError> {
        if statement.is_local() {
            return statement.update_local().await;
        }
        if let Some(query) = statement.source_query() {
            return self.insert_from_query(statement, query).await;
        }
        self.route_rows(statement).await
    }

    /// `INSERT ... SELECT` and `MERGE ... SELECT`: route by the
    /// sub-query's partition, falling back to a broadcast of the original
    /// SQL when the sub-query does not pin one.
    async fn insert_from_query(
        &self,
        statement: Arc<dyn Statement>,
        query: Arc<dyn Statement>,
    ) -> Result<i32, DbError> {
        let targets = query
            .top_filter()
            .and_then(|filter| self.resolver.targets_if_equal(&filter));
        let this = self.membership.broadcast_address();

        let Some(targets) = targets else {
            // Unresolved: every live member runs the original SQL; the
            // local branch executes the statement in place.
            let members = self.sorted_live_members();
            let sql = statement.sql();
            statement.set_local(true);
            let mut tasks = Vec::with_capacity(members.len());
            tasks.push(Self::local_update_callable(statement.clone()));
            for endpoint in members.into_iter().filter(|m| *m != this) {
                tasks.push(self.update_callable(endpoint, &statement, sql.clone()));
            }
            return execute_update_batch(tasks).await;
        };

        if targets.contains(&this) {
            statement.set_local(true);
            return statement.update_local().await;
        }
        let endpoint = self.pick(&targets);
        let context = statement.session();
        let url = context.url_for(&endpoint);
        let mut command = self
            .pool
            .command(
                &context,
                &url,
                &statement.sql(),
                statement.parameters(),
                statement.fetch_size(),
            )
            .await?;
        let count = command.execute_update().await;
        command.close().await;
        count
    }

    /// Row routing: hash each row's partition key (generating a key where
    /// absent), keep the live natural and pending replicas, and bucket by
    /// self / local-DC peer / remote-DC peer. One callable per destination
    /// carries exactly that destination's rows.
    async fn route_rows(&self, statement: Arc<dyn Statement>) -> Result<i32, DbError> {
        let this = self.membership.broadcast_address();
        let local_dc = self.topology.datacenter(&this);
        let schema = statement.schema();

        let mut local_rows: Vec<Row> = Vec::new();
        let mut local_dc_rows: BTreeMap<Endpoint, Vec<Row>> = BTreeMap::new();
        let mut remote_dc_rows: BTreeMap<Endpoint, Vec<Row>> = BTreeMap::new();

        for mut row in statement.rows() {
            let key = match &row.key {
                Some(key) => key.clone(),
                None => {
                    let generated = Value::new_random_uuid();
                    row.key = Some(generated.clone());
                    generated
                }
            };
            let token = self.resolver.token_of(&key.bytes_for_hash());
            let mut placed: HashSet<Endpoint> = HashSet::new();
            for destination in self.resolver.targets_for_token(&schema, token) {
                if !self.membership.is_alive(&destination) || !placed.insert(destination.clone())
                {
                    continue;
                }
                if destination == this {
                    local_rows.push(row.clone());
                } else if self.topology.datacenter(&destination) == local_dc {
                    local_dc_rows.entry(destination).or_default().push(row.clone());
                } else {
                    remote_dc_rows.entry(destination).or_default().push(row.clone());
                }
            }
        }

        debug!(
            local = local_rows.len(),
            local_dc = local_dc_rows.len(),
            remote_dc = remote_dc_rows.len(),
            "insert fan-out buckets"
        );

        let mut tasks = Vec::new();
        for (endpoint, rows) in local_dc_rows.into_iter().chain(remote_dc_rows) {
            let sql = statement.rows_plan_sql(&rows);
            tasks.push(self.update_callable(endpoint, &statement, sql));
        }
        if !local_rows.is_empty() {
            statement.set_rows(local_rows);
            tasks.push(Self::local_update_callable(statement.clone()));
        }
        execute_update_batch(tasks).await
    }

    // ── UPDATE / DELETE ──────────────────────────────────────────────────

    #[instrument(skip_all, fields(kind = ?statement.kind(), sql = %statement.sql()))]
    async fn execute_update_or_delete(&self, statement: Arc<dyn Statement>) -> Result<i32, DbError> {
        if statement.is_local() {
            return statement.update_local().await;
        }
        let this = self.membership.broadcast_address();
        let targets = statement
            .top_filter()
            .and_then(|filter| self.resolver.targets_if_equal(&filter));

        let mut tasks = Vec::new();
        match targets {
            Some(endpoints) => {
                for endpoint in endpoints {
                    if endpoint == this {
                        tasks.push(Self::local_update_callable(statement.clone()));
                    } else {
                        tasks.push(self.update_callable(endpoint, &statement, statement.sql()));
                    }
                }
            }
            None => {
                for endpoint in self.sorted_live_members() {
                    if endpoint == this {
                        tasks.push(Self::local_update_callable(statement.clone()));
                    } else {
                        tasks.push(self.update_callable(endpoint, &statement, statement.sql()));
                    }
                }
            }
        }
        execute_update_batch(tasks).await
    }

    // ── SELECT ───────────────────────────────────────────────────────────

    /// Dispatch a select: point reads go to one owner, everything else
    /// fans out and composes per the select's shape.
    #[instrument(skip_all, fields(sql = %statement.sql(), max_rows))]
    pub async fn execute_select(
        &self,
        statement: Arc<dyn Statement>,
        max_rows: i32,
        scrollable: bool,
    ) -> Result<Box<dyn ResultSet>, DbError> {
        if statement.kind() != StatementKind::Select {
            return Err(DbError::unsupported("statement is not a select"));
        }
        if statement.is_local() {
            return statement.query_local(max_rows).await;
        }
        let this = self.membership.broadcast_address();

        if let Some(targets) = statement
            .top_filter()
            .and_then(|filter| self.resolver.targets_if_equal(&filter))
        {
            if targets.contains(&this) {
                return statement.query_local(max_rows).await;
            }
            let endpoint = self.pick(&targets);
            debug!(%endpoint, "point select forwarded");
            let context = statement.session();
            let url = context.url_for(&endpoint);
            let mut command = self
                .pool
                .command(
                    &context,
                    &url,
                    &statement.sql(),
                    statement.parameters(),
                    statement.fetch_size(),
                )
                .await?;
            let result = command.execute_query(max_rows, scrollable).await;
            command.close().await;
            return result.map(|r| Box::new(r) as Box<dyn ResultSet>);
        }

        // Unresolved: fan out with a plan SQL suitable for partial
        // evaluation when the select aggregates or carries LIMIT/OFFSET.
        let plan_sql = if statement.is_group_query() || statement.has_limit_or_offset() {
            statement.plan_sql(true, false)
        } else {
            statement.sql()
        };
        let context = statement.session();
        let members = self.sorted_live_members();

        if !statement.is_group_query() && statement.sort_order().is_none() {
            let local = self.new_local_select(&statement, &plan_sql).await?;
            let mut sources = vec![SerialSource::Local(local)];
            for endpoint in members.into_iter().filter(|m| *m != this) {
                let url = context.url_for(&endpoint);
                let command = self
                    .pool
                    .command(
                        &context,
                        &url,
                        &plan_sql,
                        statement.parameters(),
                        statement.fetch_size(),
                    )
                    .await?;
                sources.push(SerialSource::Remote(command));
            }
            let result =
                SerializedResult::open(sources, max_rows, scrollable, statement.limit_rows())
                    .await?;
            return Ok(Box::new(result));
        }

        let mut tasks: Vec<BoxFuture<'static, Result<Box<dyn ResultSet>, DbError>>> = Vec::new();
        for endpoint in members {
            if endpoint == this {
                let local = self.new_local_select(&statement, &plan_sql).await?;
                tasks.push(Box::pin(async move { local.query_local(max_rows).await }));
            } else {
                tasks.push(
                    self.select_callable(endpoint, &statement, plan_sql.clone(), max_rows, scrollable)
                        .await?,
                );
            }
        }
        let results = execute_select_batch(tasks).await?;

        if !statement.is_group_query() {
            if let Some(order) = statement.sort_order() {
                let sorted = SortedResult::open(order, max_rows, results).await?;
                return Ok(Box::new(sorted));
            }
        }
        let reducer_sql = statement.plan_sql(true, true);
        let reducer = context.prepare(&reducer_sql).await?;
        reducer.set_local(true);
        let merged = MergedResult::reduce(results, reducer).await?;
        Ok(Box::new(merged))
    }

    /// Local side of a fan-out select. A plain select is flipped local and
    /// reused in place; a select with grouping or LIMIT/OFFSET is prepared
    /// fresh from the plan SQL with the original's bindings and fetch size.
    async fn new_local_select(
        &self,
        statement: &Arc<dyn Statement>,
        plan_sql: &str,
    ) -> Result<Arc<dyn Statement>, DbError> {
        if !statement.is_group_query() && !statement.has_limit_or_offset() {
            statement.set_local(true);
            return Ok(statement.clone());
        }
        let context = statement.session();
        let prepared = context.prepare(plan_sql).await?;
        prepared.set_local(true);
        prepared.set_fetch_size(statement.fetch_size());
        for (index, value) in statement.parameters().into_iter().enumerate() {
            prepared.set_parameter(index, value);
        }
        Ok(prepared)
    }

    // ── Callables and helpers ────────────────────────────────────────────

    fn local_update_callable(
        statement: Arc<dyn Statement>,
    ) -> BoxFuture<'static, Result<i32, DbError>> {
        Box::pin(async move { statement.update_local().await })
    }

    fn update_callable(
        &self,
        endpoint: Endpoint,
        statement: &Arc<dyn Statement>,
        sql: String,
    ) -> BoxFuture<'static, Result<i32, DbError>> {
        let pool = self.pool.clone();
        let context = statement.session();
        let params = statement.parameters();
        let fetch_size = statement.fetch_size();
        Box::pin(async move {
            let url = context.url_for(&endpoint);
            let mut command = pool.command(&context, &url, &sql, params, fetch_size).await?;
            let count = command.execute_update().await;
            command.close().await;
            count
        })
    }

    /// Prepare the remote command now; defer only its execution into the
    /// returned callable.
    async fn select_callable(
        &self,
        endpoint: Endpoint,
        statement: &Arc<dyn Statement>,
        sql: String,
        max_rows: i32,
        scrollable: bool,
    ) -> Result<BoxFuture<'static, Result<Box<dyn ResultSet>, DbError>>, DbError> {
        let context = statement.session();
        let url = context.url_for(&endpoint);
        let mut command = self
            .pool
            .command(&context, &url, &sql, statement.parameters(), statement.fetch_size())
            .await?;
        Ok(Box::pin(async move {
            let result = command.execute_query(max_rows, scrollable).await;
            command.close().await;
            result.map(|r| Box::new(r) as Box<dyn ResultSet>)
        }))
    }

    fn sorted_live_members(&self) -> Vec<Endpoint> {
        let mut members: Vec<Endpoint> = self.membership.live_members().into_iter().collect();
        members.sort();
        members
    }

    /// Deterministic for a single candidate, uniform-random otherwise: the
    /// load-balancing choice across equal owners.
    fn pick(&self, targets: &[Endpoint]) -> Endpoint {
        if targets.len() == 1 {
            return targets[0].clone();
        }
        let index = self
            .rng
            .lock()
            .expect("router rng lock")
            .gen_range(0..targets.len());
        targets[index].clone()
    }
}
