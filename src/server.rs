//! The peer-facing half of the command protocol.
//!
//! One task per accepted connection owns the server end of a [`Transfer`]
//! and a map of prepared statements keyed by command id. Statements from
//! replica sessions execute locally; statements from coordinator sessions
//! (seed-forwarded DDL) route onward through the router. Statement
//! failures are reported as error statuses and the connection keeps
//! serving; cancels arrive on dedicated connections and abort the matching
//! in-flight command.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::tags;
use crate::error::{codes, DbError};
use crate::result::ResultSet;
use crate::router::Router;
use crate::statement::{Engine, SessionContext, Statement, StatementKind};
use crate::transfer::Transfer;
use crate::value::Value;

pub struct PeerService {
    engine: Arc<dyn Engine>,
    router: Arc<Router>,
    /// In-flight commands by (session serial, command id), cancellable
    /// out-of-band.
    cancels: Mutex<HashMap<(u64, i32), Arc<Notify>>>,
    next_serial: AtomicU64,
}

impl PeerService {
    pub fn new(engine: Arc<dyn Engine>, router: Arc<Router>) -> Arc<Self> {
        Arc::new(PeerService {
            engine,
            router,
            cancels: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        })
    }

    /// Bind `addr` and serve in a background task.
    pub async fn start(
        self: Arc<Self>,
        addr: &str,
    ) -> Result<(SocketAddr, JoinHandle<()>), DbError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(%local, "peer service listening");
        let handle = tokio::spawn(self.serve(listener));
        Ok((local, handle))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream).await {
                            debug!(%remote, %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(%e, "accept failed");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), DbError> {
        stream.set_nodelay(true)?;
        let mut transfer = Transfer::new(stream);

        // The session-open exchange, or a one-shot out-of-band cancel.
        let first = transfer.read_int().await?;
        match first {
            tags::SESSION_INIT => {}
            tags::SESSION_CANCEL_STATEMENT => {
                let serial = transfer.read_long().await? as u64;
                let id = transfer.read_int().await?;
                self.cancel(serial, id).await;
                return Ok(());
            }
            other => {
                return Err(DbError::Protocol(format!(
                    "expected SESSION_INIT, got tag {other}"
                )));
            }
        }
        let coordinator = transfer.read_boolean().await?;
        let session = self.engine.open_session(coordinator).await?;
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        transfer.write_ok().write_long(serial as i64);
        transfer.flush().await?;
        debug!(serial, coordinator, "peer session opened");

        let mut prepared: HashMap<i32, Arc<dyn Statement>> = HashMap::new();
        loop {
            let tag = match transfer.read_int().await {
                Ok(tag) => tag,
                // the peer hung up
                Err(_) => break,
            };
            self.dispatch(&mut transfer, tag, serial, coordinator, &session, &mut prepared)
                .await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        transfer: &mut Transfer,
        tag: i32,
        serial: u64,
        coordinator: bool,
        session: &Arc<dyn SessionContext>,
        prepared: &mut HashMap<i32, Arc<dyn Statement>>,
    ) -> Result<(), DbError> {
        debug!(serial, op = tags::name(tag), "dispatch");
        match tag {
            tags::SESSION_PREPARE | tags::SESSION_PREPARE_READ_PARAMS => {
                let id = transfer.read_int().await?;
                let sql = transfer.read_string().await?;
                match session.prepare(&sql).await {
                    Ok(statement) => {
                        if !coordinator {
                            statement.set_local(true);
                        }
                        let metas = statement.parameter_metas();
                        let is_query = statement.kind() == StatementKind::Select;
                        prepared.insert(id, statement);
                        transfer
                            .write_ok()
                            .write_boolean(is_query)
                            .write_boolean(false)
                            .write_int(metas.len() as i32);
                        if tag == tags::SESSION_PREPARE_READ_PARAMS {
                            for meta in metas {
                                transfer
                                    .write_int(meta.data_type)
                                    .write_long(meta.precision)
                                    .write_int(meta.scale)
                                    .write_int(meta.nullable);
                            }
                        }
                        transfer.flush().await?;
                    }
                    Err(e) => transfer.write_error(e.code(), &e.to_string()).await?,
                }
            }
            tags::COMMAND_EXECUTE_QUERY | tags::COMMAND_EXECUTE_DISTRIBUTED_QUERY => {
                let id = transfer.read_int().await?;
                let _object_id = transfer.read_int().await?;
                let max_rows = transfer.read_int().await?;
                let _fetch = transfer.read_int().await?;
                let statement = self.bind_parameters(transfer, id, prepared).await?;
                let distributed = tag == tags::COMMAND_EXECUTE_DISTRIBUTED_QUERY;
                match statement {
                    Ok(statement) => {
                        let run = self.run_query(serial, id, statement, max_rows);
                        match run.await {
                            Ok(mut result) => {
                                transfer.write_ok();
                                if distributed {
                                    transfer.write_string(&session.local_transaction_name());
                                }
                                Self::write_result(transfer, result.as_mut()).await?;
                                transfer.flush().await?;
                            }
                            Err(e) => transfer.write_error(e.code(), &e.to_string()).await?,
                        }
                    }
                    Err(e) => transfer.write_error(e.code(), &e.to_string()).await?,
                }
            }
            tags::COMMAND_EXECUTE_UPDATE | tags::COMMAND_EXECUTE_DISTRIBUTED_UPDATE => {
                let id = transfer.read_int().await?;
                let statement = self.bind_parameters(transfer, id, prepared).await?;
                let distributed = tag == tags::COMMAND_EXECUTE_DISTRIBUTED_UPDATE;
                match statement {
                    Ok(statement) => {
                        let run = self.run_update(serial, id, statement);
                        match run.await {
                            Ok(count) => {
                                transfer.write_ok();
                                if distributed {
                                    transfer.write_string(&session.local_transaction_name());
                                }
                                // the trailing boolean is reserved for a
                                // future autocommit flag
                                transfer.write_int(count).write_boolean(false);
                                transfer.flush().await?;
                            }
                            Err(e) => transfer.write_error(e.code(), &e.to_string()).await?,
                        }
                    }
                    Err(e) => transfer.write_error(e.code(), &e.to_string()).await?,
                }
            }
            tags::COMMAND_GET_META_DATA => {
                let id = transfer.read_int().await?;
                let _object_id = transfer.read_int().await?;
                let outcome = match prepared.get(&id) {
                    Some(statement) => statement.query_meta().await,
                    None => Err(DbError::Protocol(format!("unknown command id {id}"))),
                };
                match outcome {
                    Ok(mut result) => {
                        transfer.write_ok();
                        Self::write_result(transfer, result.as_mut()).await?;
                        transfer.flush().await?;
                    }
                    Err(e) => transfer.write_error(e.code(), &e.to_string()).await?,
                }
            }
            tags::COMMAND_CLOSE => {
                let id = transfer.read_int().await?;
                prepared.remove(&id);
                // no response
            }
            other => {
                return Err(DbError::Protocol(format!("unknown message tag {other}")));
            }
        }
        Ok(())
    }

    /// Read the parameter values off the wire and bind them. Wire errors
    /// propagate; an unknown command id is a statement-level error.
    async fn bind_parameters(
        &self,
        transfer: &mut Transfer,
        id: i32,
        prepared: &HashMap<i32, Arc<dyn Statement>>,
    ) -> Result<Result<Arc<dyn Statement>, DbError>, DbError> {
        let count = transfer.read_int().await?;
        let mut values = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count.max(0) {
            values.push(transfer.read_value().await?);
        }
        let Some(statement) = prepared.get(&id) else {
            return Ok(Err(DbError::Protocol(format!("unknown command id {id}"))));
        };
        for (index, value) in values.into_iter().enumerate() {
            statement.set_parameter(index, value);
        }
        Ok(Ok(statement.clone()))
    }

    async fn run_query(
        &self,
        serial: u64,
        id: i32,
        statement: Arc<dyn Statement>,
        max_rows: i32,
    ) -> Result<Box<dyn ResultSet>, DbError> {
        let cancelled = self.register(serial, id).await;
        let outcome = tokio::select! {
            result = self.router.execute_select(statement, max_rows, false) => Some(result),
            _ = cancelled.notified() => None,
        };
        self.unregister(serial, id).await;
        outcome.unwrap_or_else(|| {
            Err(DbError::Peer {
                code: codes::STATEMENT_CANCELLED,
                message: "statement cancelled".into(),
            })
        })
    }

    async fn run_update(
        &self,
        serial: u64,
        id: i32,
        statement: Arc<dyn Statement>,
    ) -> Result<i32, DbError> {
        let cancelled = self.register(serial, id).await;
        let run = async {
            if statement.is_local() {
                statement.update_local().await
            } else {
                self.router.execute_update(statement).await
            }
        };
        let outcome = tokio::select! {
            result = run => Some(result),
            _ = cancelled.notified() => None,
        };
        self.unregister(serial, id).await;
        outcome.unwrap_or_else(|| {
            Err(DbError::Peer {
                code: codes::STATEMENT_CANCELLED,
                message: "statement cancelled".into(),
            })
        })
    }

    async fn write_result(
        transfer: &mut Transfer,
        result: &mut dyn ResultSet,
    ) -> Result<(), DbError> {
        let column_count = result.column_count();
        transfer.write_int(column_count as i32);
        match result.row_count() {
            Some(total) => {
                transfer.write_int(total);
                while let Some(row) = result.next_row().await? {
                    Self::write_row(transfer, &row, column_count);
                }
            }
            None => {
                transfer.write_int(-1);
                while let Some(row) = result.next_row().await? {
                    transfer.write_boolean(true);
                    Self::write_row(transfer, &row, column_count);
                }
                transfer.write_boolean(false);
            }
        }
        result.close().await;
        Ok(())
    }

    fn write_row(transfer: &mut Transfer, row: &[Value], column_count: usize) {
        for index in 0..column_count {
            transfer.write_value(row.get(index).unwrap_or(&Value::Null));
        }
    }

    async fn register(&self, serial: u64, id: i32) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.cancels.lock().await.insert((serial, id), notify.clone());
        notify
    }

    async fn unregister(&self, serial: u64, id: i32) {
        self.cancels.lock().await.remove(&(serial, id));
    }

    async fn cancel(&self, serial: u64, id: i32) {
        if let Some(notify) = self.cancels.lock().await.get(&(serial, id)) {
            info!(serial, id, "cancelling statement");
            notify.notify_waiters();
        } else {
            debug!(serial, id, "cancel for unknown command");
        }
    }
}
