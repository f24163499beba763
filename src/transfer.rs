//! Typed wire primitives over a peer TCP stream.
//!
//! A command message is a sequence of typed writes followed by a
//! [`Transfer::done`] barrier. Writers append to a [`BytesMut`] frame;
//! the assembled frame goes to the socket in a single write when the
//! message is flushed, and `done` then waits for the peer's status
//! header. All multi-byte integers are big-endian. Strings are an int
//! byte length followed by UTF-8. Values are a type-id int followed by
//! the type's payload.
//!
//! A `Transfer` is never shared: every use happens under the owning
//! session's lock, because the stream is a single full-duplex sequence of
//! typed messages that cannot be interleaved.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::error::DbError;
use crate::value::{type_ids, Value};

/// Status header written by the peer ahead of every response payload.
pub const STATUS_OK: i32 = 0;
pub const STATUS_ERROR: i32 = 1;

/// Upper bound on string/bytes payloads, guarding against corrupt frames.
const MAX_PAYLOAD: i32 = 16 * 1024 * 1024;

pub struct Transfer {
    stream: BufStream<TcpStream>,
    out: BytesMut,
}

impl Transfer {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
            out: BytesMut::with_capacity(4096),
        }
    }

    pub fn write_int(&mut self, v: i32) -> &mut Self {
        self.out.put_i32(v);
        self
    }

    pub fn write_long(&mut self, v: i64) -> &mut Self {
        self.out.put_i64(v);
        self
    }

    pub fn write_boolean(&mut self, v: bool) -> &mut Self {
        self.out.put_u8(u8::from(v));
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.out.put_i32(s.len() as i32);
        self.out.put_slice(s.as_bytes());
        self
    }

    pub fn write_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.out.put_i32(b.len() as i32);
        self.out.put_slice(b);
        self
    }

    pub fn write_value(&mut self, v: &Value) -> &mut Self {
        self.write_int(v.type_id());
        match v {
            Value::Null => {}
            Value::Boolean(b) => {
                self.write_boolean(*b);
            }
            Value::Int(i) => {
                self.write_int(*i);
            }
            Value::Long(l) => {
                self.write_long(*l);
            }
            Value::Double(d) => {
                self.out.put_f64(*d);
            }
            Value::Text(s) => {
                self.write_string(s);
            }
            Value::Bytes(b) => {
                self.write_bytes(b);
            }
            Value::Uuid(u) => {
                self.out.put_slice(u.as_bytes());
            }
        }
        self
    }

    pub async fn read_int(&mut self) -> Result<i32, DbError> {
        Ok(self.stream.read_i32().await?)
    }

    pub async fn read_long(&mut self) -> Result<i64, DbError> {
        Ok(self.stream.read_i64().await?)
    }

    pub async fn read_boolean(&mut self) -> Result<bool, DbError> {
        Ok(self.stream.read_u8().await? != 0)
    }

    pub async fn read_string(&mut self) -> Result<String, DbError> {
        let len = self.stream.read_i32().await?;
        if !(0..=MAX_PAYLOAD).contains(&len) {
            return Err(DbError::Protocol(format!("bad string length {len}")));
        }
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf).await?;
        String::from_utf8(buf).map_err(|e| DbError::Protocol(format!("invalid utf-8: {e}")))
    }

    pub async fn read_bytes(&mut self) -> Result<Vec<u8>, DbError> {
        let len = self.stream.read_i32().await?;
        if !(0..=MAX_PAYLOAD).contains(&len) {
            return Err(DbError::Protocol(format!("bad byte length {len}")));
        }
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_value(&mut self) -> Result<Value, DbError> {
        let type_id = self.read_int().await?;
        match type_id {
            type_ids::NULL => Ok(Value::Null),
            type_ids::BOOLEAN => Ok(Value::Boolean(self.read_boolean().await?)),
            type_ids::INT => Ok(Value::Int(self.read_int().await?)),
            type_ids::LONG => Ok(Value::Long(self.read_long().await?)),
            type_ids::DOUBLE => Ok(Value::Double(self.stream.read_f64().await?)),
            type_ids::TEXT => Ok(Value::Text(self.read_string().await?)),
            type_ids::BYTES => Ok(Value::Bytes(self.read_bytes().await?)),
            type_ids::UUID => {
                let mut buf = [0u8; 16];
                self.stream.read_exact(&mut buf).await?;
                Ok(Value::Uuid(uuid::Uuid::from_bytes(buf)))
            }
            other => Err(DbError::Protocol(format!("unknown value type id {other}"))),
        }
    }

    /// Ship the assembled frame in one write and flush the socket.
    pub async fn flush(&mut self) -> Result<(), DbError> {
        if !self.out.is_empty() {
            let frame = self.out.split();
            self.stream.write_all(&frame).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush the pending message and wait for the peer's status header.
    ///
    /// A `STATUS_ERROR` header carries an error code and message and is
    /// surfaced as [`DbError::Peer`]; the response payload follows only
    /// after a `STATUS_OK`.
    pub async fn done(&mut self) -> Result<(), DbError> {
        self.flush().await?;
        let status = self.read_int().await?;
        match status {
            STATUS_OK => Ok(()),
            STATUS_ERROR => {
                let code = self.read_int().await?;
                let message = self.read_string().await?;
                Err(DbError::Peer {
                    code: code as u16,
                    message,
                })
            }
            other => Err(DbError::Protocol(format!("unknown status {other}"))),
        }
    }

    /// Server side: acknowledge the current message, payload follows.
    pub fn write_ok(&mut self) -> &mut Self {
        self.write_int(STATUS_OK)
    }

    /// Server side: report a failure for the current message and flush.
    pub async fn write_error(&mut self, code: u16, message: &str) -> Result<(), DbError> {
        self.write_int(STATUS_ERROR)
            .write_int(code as i32)
            .write_string(message);
        self.flush().await
    }
}
