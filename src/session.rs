//! Peer sessions and the session pool.
//!
//! A [`ClientSession`] is one TCP connection to a peer. Its transfer,
//! command-id counter, and everything else touching the wire live behind a
//! single async mutex; `cancel_statement` deliberately bypasses that lock
//! on a dedicated out-of-band connection so it can interrupt an in-flight
//! execute.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::command::{tags, ClientCommand};
use crate::error::DbError;
use crate::statement::SessionContext;
use crate::transfer::Transfer;
use crate::value::Value;

/// Distributed transaction state a session accumulates: autocommit off
/// means every peer execute flows through the distributed message variants
/// and reports a local transaction name back.
#[derive(Default)]
pub struct Transaction {
    pub autocommit: bool,
    pub local_transaction_names: Vec<String>,
}

/// State guarded by the session lock: the wire plus the monotonically
/// increasing id counter handed to commands and result objects.
pub struct SessionBody {
    pub transfer: Transfer,
    next_id: i32,
}

impl SessionBody {
    /// Allocate the next server-side object id.
    pub fn alloc_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    /// The most recently allocated id.
    pub fn current_id(&self) -> i32 {
        self.next_id
    }
}

pub struct ClientSession {
    url: String,
    coordinator: bool,
    body: Mutex<SessionBody>,
    last_reconnect: AtomicI32,
    closed: AtomicBool,
    /// Peer-assigned identity of this session, used to address
    /// out-of-band cancels.
    server_serial: AtomicU64,
    server_cached_objects: AtomicI32,
    transaction: StdMutex<Option<Transaction>>,
}

impl ClientSession {
    /// Dial the peer and run the session-open exchange. `coordinator`
    /// sessions route statements onward on the peer; plain sessions
    /// execute them locally there.
    pub async fn connect(url: &str, coordinator: bool) -> Result<Arc<Self>, DbError> {
        let (transfer, serial) = Self::open_transfer(url, coordinator).await?;
        let session = Arc::new(ClientSession {
            url: url.to_string(),
            coordinator,
            body: Mutex::new(SessionBody {
                transfer,
                next_id: 0,
            }),
            last_reconnect: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            server_serial: AtomicU64::new(serial),
            server_cached_objects: AtomicI32::new(crate::sys().server_cached_objects),
            transaction: StdMutex::new(None),
        });
        debug!(url, coordinator, serial, "session opened");
        Ok(session)
    }

    async fn open_transfer(url: &str, coordinator: bool) -> Result<(Transfer, u64), DbError> {
        let stream = TcpStream::connect(url).await?;
        let mut transfer = Transfer::new(stream);
        transfer.write_int(tags::SESSION_INIT).write_boolean(coordinator);
        transfer.done().await?;
        let serial = transfer.read_long().await? as u64;
        Ok((transfer, serial))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn lock_body(&self) -> MutexGuard<'_, SessionBody> {
        self.body.lock().await
    }

    /// Epoch bumped on every transport re-establishment; commands compare
    /// it against their creation epoch to detect stale prepared handles.
    pub fn last_reconnect(&self) -> i32 {
        self.last_reconnect.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn check_closed(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    /// Eviction window of the peer's prepared-statement cache; a command
    /// whose id falls this far behind the current id must re-prepare.
    pub fn server_cached_objects(&self) -> i32 {
        self.server_cached_objects.load(Ordering::SeqCst)
    }

    pub fn set_server_cached_objects(&self, n: i32) {
        self.server_cached_objects.store(n, Ordering::SeqCst);
    }

    /// Transport-failure policy: mark the wire broken, attempt one
    /// reconnect, and hand the original error back for the caller to
    /// rethrow. A successful reconnect bumps the epoch so the next command
    /// operation re-prepares.
    pub async fn handle_exception(&self, body: &mut SessionBody, error: DbError) -> DbError {
        if !error.is_transport() {
            return error;
        }
        warn!(url = %self.url, %error, "transport failure, reconnecting");
        match Self::open_transfer(&self.url, self.coordinator).await {
            Ok((transfer, serial)) => {
                body.transfer = transfer;
                self.server_serial.store(serial, Ordering::SeqCst);
                self.last_reconnect.fetch_add(1, Ordering::SeqCst);
                info!(url = %self.url, epoch = self.last_reconnect(), "session reconnected");
            }
            Err(reconnect_error) => {
                warn!(url = %self.url, %reconnect_error, "reconnect failed, closing session");
                self.closed.store(true, Ordering::SeqCst);
            }
        }
        error
    }

    /// Re-establish the transport and advance the reconnect epoch.
    pub async fn reconnect(&self) -> Result<(), DbError> {
        let mut body = self.body.lock().await;
        let (transfer, serial) = Self::open_transfer(&self.url, self.coordinator).await?;
        body.transfer = transfer;
        self.server_serial.store(serial, Ordering::SeqCst);
        self.last_reconnect.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Ask the peer to abort the statement with the given command id.
    ///
    /// Runs on a dedicated short-lived connection, outside the session
    /// lock, so it can overtake an execute that currently holds it.
    pub async fn cancel_statement(&self, id: i32) {
        let serial = self.server_serial.load(Ordering::SeqCst);
        let attempt = async {
            let stream = TcpStream::connect(&self.url).await?;
            let mut transfer = Transfer::new(stream);
            transfer
                .write_int(tags::SESSION_CANCEL_STATEMENT)
                .write_long(serial as i64)
                .write_int(id);
            transfer.flush().await?;
            Ok::<(), DbError>(())
        };
        if let Err(e) = attempt.await {
            warn!(url = %self.url, id, %e, "cancel delivery failed");
        }
    }

    /// Session-variable sync point after every execute. The peer owns the
    /// authoritative state; nothing to pull yet.
    pub fn read_session_state(&self) {
        debug!(url = %self.url, "session state refreshed");
    }

    /// Start a transaction on this session; `autocommit == false` switches
    /// peer executes to the distributed message variants.
    pub fn set_transaction(&self, autocommit: bool) {
        *self.transaction.lock().expect("transaction lock") = Some(Transaction {
            autocommit,
            local_transaction_names: Vec::new(),
        });
    }

    pub fn clear_transaction(&self) {
        *self.transaction.lock().expect("transaction lock") = None;
    }

    pub fn in_distributed_transaction(&self) -> bool {
        self.transaction
            .lock()
            .expect("transaction lock")
            .as_ref()
            .map(|t| !t.autocommit)
            .unwrap_or(false)
    }

    /// Record a peer-reported local transaction name; the accumulated set
    /// drives cross-node commit.
    pub fn add_local_transaction_name(&self, name: String) {
        if let Some(t) = self.transaction.lock().expect("transaction lock").as_mut() {
            t.local_transaction_names.push(name);
        }
    }

    pub fn local_transaction_names(&self) -> Vec<String> {
        self.transaction
            .lock()
            .expect("transaction lock")
            .as_ref()
            .map(|t| t.local_transaction_names.clone())
            .unwrap_or_default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Interns peer sessions by `(originating session, peer URL)` so every
/// local session reuses one wire per peer. Seed sessions (DDL forwarding)
/// are interned separately because they run in coordinator mode.
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<(u64, String, bool), Arc<ClientSession>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn intern(
        &self,
        origin: u64,
        url: &str,
        coordinator: bool,
    ) -> Result<Arc<ClientSession>, DbError> {
        let key = (origin, url.to_string(), coordinator);
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let fresh = ClientSession::connect(url, coordinator).await?;
        sessions.insert(key, fresh.clone());
        Ok(fresh)
    }

    /// The pooled replica session for `(origin, url)`.
    pub async fn session(&self, origin: u64, url: &str) -> Result<Arc<ClientSession>, DbError> {
        self.intern(origin, url, false).await
    }

    /// The pooled coordinator session used to forward DDL to the seed.
    pub async fn seed_endpoint_session(
        &self,
        origin: u64,
        url: &str,
    ) -> Result<Arc<ClientSession>, DbError> {
        self.intern(origin, url, true).await
    }

    /// A prepared command on the pooled session for `url`, carrying the
    /// originating statement's parameter values.
    pub async fn command(
        &self,
        origin: &Arc<dyn SessionContext>,
        url: &str,
        sql: &str,
        params: Vec<Value>,
        fetch_size: i32,
    ) -> Result<ClientCommand, DbError> {
        let session = self.session(origin.id(), url).await?;
        Self::command_on(session, sql, params, fetch_size).await
    }

    /// A prepared command on an explicit session; the DDL forwarding path
    /// uses this with a seed session.
    pub async fn command_on(
        session: Arc<ClientSession>,
        sql: &str,
        params: Vec<Value>,
        fetch_size: i32,
    ) -> Result<ClientCommand, DbError> {
        let mut command = ClientCommand::prepare_new(session, sql, fetch_size).await?;
        for (i, value) in params.into_iter().enumerate() {
            if let Some(parameter) = command.parameters_mut().get_mut(i) {
                parameter.set_value(value, false);
            }
        }
        Ok(command)
    }

    /// Drop every pooled session, marking them closed.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.close();
        }
    }
}
