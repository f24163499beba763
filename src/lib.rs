//! Distributed-execution core of a clustered SQL database.
//!
//! Client applications submit parsed statements against a logical database
//! whose data is partitioned across peer nodes. For each statement the
//! [`router::Router`] computes the target endpoints from the partition
//! key, dispatches sub-statements to those nodes in parallel over the
//! [`command`] channel, and merges the partial results into a single
//! answer indistinguishable from single-node execution.
//!
//! Parsing, local execution, gossip membership, and replica placement are
//! external collaborators behind the traits in [`statement`] and
//! [`cluster`].

pub mod cluster;
pub mod command;
pub mod error;
pub mod parallel;
pub mod partition;
pub mod result;
pub mod router;
pub mod server;
pub mod session;
pub mod statement;
pub mod transfer;
pub mod value;

pub use cluster::{Endpoint, SchemaRef, Token};
pub use error::DbError;
pub use result::ResultSet;
pub use router::Router;
pub use session::{ClientSession, SessionPool};
pub use statement::{Statement, StatementKind};
pub use value::Value;

use once_cell::sync::Lazy;

/// System limits, read once from the environment with compiled defaults.
pub struct SysProperties {
    /// Prepared-statement id distance after which the peer has evicted the
    /// handle and a command must re-prepare.
    pub server_cached_objects: i32,
    /// Default fetch size for commands that do not specify one.
    pub fetch_size: i32,
}

impl SysProperties {
    fn from_env() -> Self {
        SysProperties {
            server_cached_objects: env_int("SHARDCAST_SERVER_CACHED_OBJECTS", 512),
            fetch_size: env_int("SHARDCAST_FETCH_SIZE", 64),
        }
    }
}

fn env_int(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

static SYS: Lazy<SysProperties> = Lazy::new(SysProperties::from_env);

pub fn sys() -> &'static SysProperties {
    &SYS
}
