//! The client side of a prepared statement on a peer.
//!
//! A [`ClientCommand`] moves `created → prepared ↔ executing → closed`.
//! The only internal transition is the re-prepare triggered by
//! [`prepare_if_required`]: a reconnect epoch mismatch or falling out of
//! the peer's prepared-statement cache window silently prepares again
//! under a fresh id before the next operation's tag goes out.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::DbError;
use crate::result::ClientResult;
use crate::session::{ClientSession, SessionBody};
use crate::statement::ParameterMeta;
use crate::transfer::Transfer;
use crate::value::{type_ids, Value};

/// Message tags of the peer command protocol.
pub mod tags {
    pub const SESSION_INIT: i32 = 0;
    pub const SESSION_PREPARE: i32 = 1;
    pub const SESSION_PREPARE_READ_PARAMS: i32 = 2;
    pub const COMMAND_EXECUTE_QUERY: i32 = 3;
    pub const COMMAND_EXECUTE_DISTRIBUTED_QUERY: i32 = 4;
    pub const COMMAND_EXECUTE_UPDATE: i32 = 5;
    pub const COMMAND_EXECUTE_DISTRIBUTED_UPDATE: i32 = 6;
    pub const COMMAND_GET_META_DATA: i32 = 7;
    pub const COMMAND_CLOSE: i32 = 8;
    pub const SESSION_CANCEL_STATEMENT: i32 = 9;

    pub fn name(tag: i32) -> &'static str {
        match tag {
            SESSION_INIT => "SESSION_INIT",
            SESSION_PREPARE => "SESSION_PREPARE",
            SESSION_PREPARE_READ_PARAMS => "SESSION_PREPARE_READ_PARAMS",
            COMMAND_EXECUTE_QUERY => "COMMAND_EXECUTE_QUERY",
            COMMAND_EXECUTE_DISTRIBUTED_QUERY => "COMMAND_EXECUTE_DISTRIBUTED_QUERY",
            COMMAND_EXECUTE_UPDATE => "COMMAND_EXECUTE_UPDATE",
            COMMAND_EXECUTE_DISTRIBUTED_UPDATE => "COMMAND_EXECUTE_DISTRIBUTED_UPDATE",
            COMMAND_GET_META_DATA => "COMMAND_GET_META_DATA",
            COMMAND_CLOSE => "COMMAND_CLOSE",
            SESSION_CANCEL_STATEMENT => "SESSION_CANCEL_STATEMENT",
            _ => "UNKNOWN",
        }
    }
}

/// JDBC-style nullability: unknown until metadata says otherwise.
pub const NULLABLE_UNKNOWN: i32 = 2;

/// Sentinel forcing the next cache-window check to re-prepare.
const ID_INVALID: i32 = i32::MIN;

/// A client-side bound parameter with lazily supplied metadata.
pub struct ClientCommandParameter {
    index: usize,
    value: Option<Value>,
    meta: ParameterMeta,
}

impl ClientCommandParameter {
    fn new(index: usize) -> Self {
        ClientCommandParameter {
            index,
            value: None,
            meta: ParameterMeta::default(),
        }
    }

    async fn read_meta(&mut self, transfer: &mut Transfer) -> Result<(), DbError> {
        self.meta = ParameterMeta {
            data_type: transfer.read_int().await?,
            precision: transfer.read_long().await?,
            scale: transfer.read_int().await?,
            nullable: transfer.read_int().await?,
        };
        Ok(())
    }

    /// Bind a value; the previous one is released only when `close_old`
    /// asks for it.
    pub fn set_value(&mut self, value: Value, close_old: bool) {
        if close_old {
            drop(self.value.take());
        }
        self.value = Some(value);
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_value_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn check_set(&self) -> Result<(), DbError> {
        if self.value.is_none() {
            return Err(DbError::parameter_not_set(self.index));
        }
        Ok(())
    }

    /// Type from the bound value when present, else from metadata.
    pub fn data_type(&self) -> i32 {
        match &self.value {
            Some(v) if v.type_id() != type_ids::NULL => v.type_id(),
            _ => self.meta.data_type,
        }
    }

    pub fn precision(&self) -> i64 {
        self.value
            .as_ref()
            .map(|v| v.precision())
            .unwrap_or(self.meta.precision)
    }

    pub fn scale(&self) -> i32 {
        self.value
            .as_ref()
            .map(|v| v.scale())
            .unwrap_or(self.meta.scale)
    }

    /// Nullability is always metadata.
    pub fn nullable(&self) -> i32 {
        self.meta.nullable
    }

    fn close(&mut self) {
        drop(self.value.take());
    }
}

/// The client-side half of one prepared statement on a peer.
pub struct ClientCommand {
    session: Option<Arc<ClientSession>>,
    sql: String,
    fetch_size: i32,
    id: i32,
    is_query: bool,
    /// `session.last_reconnect` at (re-)prepare time; a later mismatch
    /// forces re-preparation before anything else goes on the wire.
    created: i32,
    parameters: Vec<ClientCommandParameter>,
}

impl ClientCommand {
    /// Prepare `sql` on the peer, reading parameter metadata. The session
    /// is attached only after the prepare succeeds, so a failed prepare
    /// leaves nothing to close.
    pub async fn prepare_new(
        session: Arc<ClientSession>,
        sql: &str,
        fetch_size: i32,
    ) -> Result<ClientCommand, DbError> {
        let mut command = ClientCommand {
            session: None,
            sql: sql.to_string(),
            fetch_size: if fetch_size > 0 {
                fetch_size
            } else {
                crate::sys().fetch_size
            },
            id: ID_INVALID,
            is_query: false,
            created: 0,
            parameters: Vec::new(),
        };
        {
            let mut body = session.lock_body().await;
            if let Err(e) = command.prepare(&session, &mut body, true).await {
                let e = if e.is_transport() {
                    session.handle_exception(&mut body, e).await
                } else {
                    e
                };
                return Err(e);
            }
        }
        command.session = Some(session);
        Ok(command)
    }

    async fn prepare(
        &mut self,
        session: &ClientSession,
        body: &mut SessionBody,
        read_params: bool,
    ) -> Result<(), DbError> {
        self.id = body.alloc_id();
        let tag = if read_params {
            tags::SESSION_PREPARE_READ_PARAMS
        } else {
            tags::SESSION_PREPARE
        };
        debug!(url = session.url(), id = self.id, op = tags::name(tag), sql = %self.sql);
        let transfer = &mut body.transfer;
        transfer.write_int(tag).write_int(self.id).write_string(&self.sql);
        transfer.done().await?;
        self.is_query = transfer.read_boolean().await?;
        // reserved
        transfer.read_boolean().await?;
        let param_count = transfer.read_int().await?;
        if read_params {
            self.parameters.clear();
            for index in 0..param_count.max(0) {
                let mut parameter = ClientCommandParameter::new(index as usize);
                parameter.read_meta(transfer).await?;
                self.parameters.push(parameter);
            }
        }
        self.created = session.last_reconnect();
        Ok(())
    }

    /// Pre-flight for every execute/meta call: a reconnect invalidates the
    /// server-side handle outright, and the peer evicts prepared handles
    /// whose id falls `server_cached_objects` behind the current id.
    async fn prepare_if_required(
        &mut self,
        session: &ClientSession,
        body: &mut SessionBody,
    ) -> Result<(), DbError> {
        if session.last_reconnect() != self.created {
            self.id = ID_INVALID;
        }
        session.check_closed()?;
        if self.id <= body.current_id().saturating_sub(session.server_cached_objects()) {
            self.prepare(session, body, false).await?;
        }
        Ok(())
    }

    pub fn is_query(&self) -> bool {
        self.is_query
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[ClientCommandParameter] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Vec<ClientCommandParameter> {
        &mut self.parameters
    }

    /// The server-side handle of this prepared statement; addresses
    /// out-of-band cancels.
    pub fn id(&self) -> i32 {
        self.id
    }

    fn check_parameters(&self) -> Result<(), DbError> {
        for parameter in &self.parameters {
            parameter.check_set()?;
        }
        Ok(())
    }

    fn send_parameters(&self, transfer: &mut Transfer) -> Result<(), DbError> {
        transfer.write_int(self.parameters.len() as i32);
        for parameter in &self.parameters {
            let value = parameter
                .value()
                .ok_or_else(|| DbError::parameter_not_set(parameter.index))?;
            transfer.write_value(value);
        }
        Ok(())
    }

    fn attached_session(&self) -> Result<Arc<ClientSession>, DbError> {
        self.session.clone().ok_or(DbError::Closed)
    }

    /// Column metadata of a query command, as a determined result bound to
    /// a fresh server object id with unbounded fetch.
    pub async fn get_meta_data(&mut self) -> Result<Option<ClientResult>, DbError> {
        if !self.is_query {
            return Ok(None);
        }
        let session = self.attached_session()?;
        let mut body = session.lock_body().await;
        let object_id = body.alloc_id();
        self.prepare_if_required(&session, &mut body).await?;
        debug!(url = session.url(), id = self.id, op = tags::name(tags::COMMAND_GET_META_DATA));
        let run = async {
            let transfer = &mut body.transfer;
            transfer
                .write_int(tags::COMMAND_GET_META_DATA)
                .write_int(self.id)
                .write_int(object_id);
            transfer.done().await?;
            let column_count = transfer.read_int().await?;
            let row_count = transfer.read_int().await?;
            ClientResult::read_determined(transfer, column_count, row_count).await
        };
        match run.await {
            Ok(result) => Ok(Some(result)),
            Err(e) if e.is_transport() => Err(session.handle_exception(&mut body, e).await),
            Err(e) => Err(e),
        }
    }

    /// Execute as a query. Within a distributed transaction the
    /// distributed tag is used and the peer's local transaction name is
    /// appended to the session's accumulated set. `row_count < 0` on the
    /// response selects the streamed result shape.
    pub async fn execute_query(
        &mut self,
        max_rows: i32,
        scrollable: bool,
    ) -> Result<ClientResult, DbError> {
        self.check_parameters()?;
        let session = self.attached_session()?;
        let mut body = session.lock_body().await;
        let object_id = body.alloc_id();
        self.prepare_if_required(&session, &mut body).await?;

        let distributed = session.in_distributed_transaction();
        let tag = if distributed {
            tags::COMMAND_EXECUTE_DISTRIBUTED_QUERY
        } else {
            tags::COMMAND_EXECUTE_QUERY
        };
        debug!(url = session.url(), id = self.id, op = tags::name(tag), max_rows);
        let fetch = if scrollable { i32::MAX } else { self.fetch_size };

        let run = async {
            let transfer = &mut body.transfer;
            transfer
                .write_int(tag)
                .write_int(self.id)
                .write_int(object_id)
                .write_int(max_rows)
                .write_int(fetch);
            self.send_parameters(transfer)?;
            transfer.done().await?;
            if distributed {
                let name = transfer.read_string().await?;
                session.add_local_transaction_name(name);
            }
            let column_count = transfer.read_int().await?;
            let row_count = transfer.read_int().await?;
            if row_count < 0 {
                ClientResult::read_streamed(transfer, column_count).await
            } else {
                ClientResult::read_determined(transfer, column_count, row_count).await
            }
        };
        let outcome = match run.await {
            Ok(result) => Ok(result),
            Err(e) if e.is_transport() => Err(session.handle_exception(&mut body, e).await),
            Err(e) => Err(e),
        };
        session.read_session_state();
        outcome
    }

    /// Execute as an update, returning the peer's update count.
    pub async fn execute_update(&mut self) -> Result<i32, DbError> {
        self.check_parameters()?;
        let session = self.attached_session()?;
        let mut body = session.lock_body().await;
        self.prepare_if_required(&session, &mut body).await?;

        let distributed = session.in_distributed_transaction();
        let tag = if distributed {
            tags::COMMAND_EXECUTE_DISTRIBUTED_UPDATE
        } else {
            tags::COMMAND_EXECUTE_UPDATE
        };
        debug!(url = session.url(), id = self.id, op = tags::name(tag));

        let run = async {
            let transfer = &mut body.transfer;
            transfer.write_int(tag).write_int(self.id);
            self.send_parameters(transfer)?;
            transfer.done().await?;
            if distributed {
                let name = transfer.read_string().await?;
                session.add_local_transaction_name(name);
            }
            let update_count = transfer.read_int().await?;
            // reserved for a future autocommit flag
            transfer.read_boolean().await?;
            Ok::<i32, DbError>(update_count)
        };
        let outcome = match run.await {
            Ok(count) => Ok(count),
            Err(e) if e.is_transport() => Err(session.handle_exception(&mut body, e).await),
            Err(e) => Err(e),
        };
        session.read_session_state();
        outcome
    }

    /// Release the server-side handle. Best effort: transport failures are
    /// logged and swallowed, bound values are released, and the command is
    /// inert afterwards. A no-op when the session is absent or already
    /// closed, so calling close twice changes nothing.
    pub async fn close(&mut self) {
        let Some(session) = self.session.as_ref().filter(|s| !s.is_closed()).cloned() else {
            return;
        };
        self.session = None;
        {
            let mut body = session.lock_body().await;
            debug!(url = session.url(), id = self.id, op = tags::name(tags::COMMAND_CLOSE));
            body.transfer.write_int(tags::COMMAND_CLOSE).write_int(self.id);
            if let Err(e) = body.transfer.flush().await {
                warn!(url = session.url(), id = self.id, %e, "close failed");
            }
        }
        for parameter in &mut self.parameters {
            parameter.close();
        }
        self.parameters.clear();
    }

    /// Cancel the in-flight execution of this command on the peer.
    /// Delivered out-of-band; does not take the session lock.
    pub async fn cancel(&self) {
        if let Some(session) = &self.session {
            session.cancel_statement(self.id).await;
        }
    }
}
