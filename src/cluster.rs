//! Cluster membership, topology, and replica placement.
//!
//! The router consumes these as traits: gossip/failure detection, the
//! endpoint snitch, and the partitioner/token metadata are external
//! services. [`StaticRing`] is the in-crate default used by embedders and
//! tests: a murmur3 virtual-node token ring with a manually steerable
//! liveness table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Cursor;
use std::sync::RwLock;

use murmur3::murmur3_32;

/// A network node in the cluster, identified by its `host:port` address.
/// Total-ordered by address bytes so log lines and broadcast fan-outs are
/// tie-break free.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Endpoint(addr.into())
    }

    pub fn addr(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partitioner output locating a key on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

/// Reference to the schema a statement routes against; the full name keys
/// pending-endpoint lookups during topology changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchemaRef {
    pub name: String,
}

impl SchemaRef {
    pub fn new(name: impl Into<String>) -> Self {
        SchemaRef { name: name.into() }
    }

    pub fn full_name(&self) -> &str {
        &self.name
    }
}

/// Live-member view provided by the gossip/failure-detection service.
pub trait Membership: Send + Sync {
    fn live_members(&self) -> HashSet<Endpoint>;
    fn first_live_seed_endpoint(&self) -> Option<Endpoint>;
    fn is_alive(&self, endpoint: &Endpoint) -> bool;
    fn broadcast_address(&self) -> Endpoint;
}

/// Endpoint snitch mapping endpoints to datacenters.
pub trait Topology: Send + Sync {
    fn datacenter(&self, endpoint: &Endpoint) -> String;
}

/// Partitioner plus replica placement under the current and pending
/// topology.
pub trait Replication: Send + Sync {
    fn token_of(&self, key: &[u8]) -> Token;
    fn natural_endpoints(&self, schema: &SchemaRef, token: Token) -> Vec<Endpoint>;
    fn pending_endpoints_for(&self, token: Token, schema_full_name: &str) -> Vec<Endpoint>;
}

const DEFAULT_DATACENTER: &str = "datacenter1";

/// Fixed-membership ring: every node owns `vnodes` murmur3 tokens and each
/// token is replicated to the next `rf` distinct nodes clockwise.
pub struct StaticRing {
    ring: BTreeMap<u32, Endpoint>,
    members: Vec<Endpoint>,
    seeds: Vec<Endpoint>,
    self_addr: Endpoint,
    rf: usize,
    datacenters: HashMap<Endpoint, String>,
    down: RwLock<HashSet<Endpoint>>,
    pending: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl StaticRing {
    pub fn new(
        self_addr: Endpoint,
        peers: Vec<Endpoint>,
        seeds: Vec<Endpoint>,
        vnodes: usize,
        rf: usize,
    ) -> Self {
        let mut members = peers;
        members.push(self_addr.clone());
        members.sort();
        members.dedup();

        let mut ring = BTreeMap::new();
        for node in &members {
            for v in 0..vnodes.max(1) {
                let token_key = format!("{}-{}", node, v);
                let mut cursor = Cursor::new(token_key.as_bytes());
                let token = murmur3_32(&mut cursor, 0).unwrap_or(0);
                ring.insert(token, node.clone());
            }
        }

        Self {
            ring,
            members,
            seeds,
            self_addr,
            rf: rf.max(1),
            datacenters: HashMap::new(),
            down: RwLock::new(HashSet::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Assign an endpoint to a datacenter; unassigned endpoints report the
    /// default datacenter.
    pub fn set_datacenter(&mut self, endpoint: Endpoint, dc: impl Into<String>) {
        self.datacenters.insert(endpoint, dc.into());
    }

    pub fn mark_down(&self, endpoint: &Endpoint) {
        self.down.write().expect("liveness lock").insert(endpoint.clone());
    }

    pub fn mark_up(&self, endpoint: &Endpoint) {
        self.down.write().expect("liveness lock").remove(endpoint);
    }

    /// Register pending replicas for every token of `schema_full_name`,
    /// mirroring an in-progress topology change.
    pub fn set_pending(&self, schema_full_name: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.pending
            .write()
            .expect("pending lock")
            .insert(schema_full_name.into(), endpoints);
    }

    /// Walk the ring clockwise from `token`, collecting the first `rf`
    /// distinct nodes.
    fn replicas_for(&self, token: Token) -> Vec<Endpoint> {
        let mut reps = Vec::new();
        let mut seen = HashSet::new();
        for (_t, node) in self.ring.range(token.0..).chain(self.ring.range(..)) {
            if seen.insert(node.clone()) {
                reps.push(node.clone());
                if reps.len() == self.rf {
                    break;
                }
            }
        }
        reps
    }
}

impl Membership for StaticRing {
    fn live_members(&self) -> HashSet<Endpoint> {
        let down = self.down.read().expect("liveness lock");
        self.members
            .iter()
            .filter(|m| !down.contains(m))
            .cloned()
            .collect()
    }

    fn first_live_seed_endpoint(&self) -> Option<Endpoint> {
        self.seeds.iter().find(|s| self.is_alive(s)).cloned()
    }

    fn is_alive(&self, endpoint: &Endpoint) -> bool {
        !self.down.read().expect("liveness lock").contains(endpoint)
    }

    fn broadcast_address(&self) -> Endpoint {
        self.self_addr.clone()
    }
}

impl Topology for StaticRing {
    fn datacenter(&self, endpoint: &Endpoint) -> String {
        self.datacenters
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| DEFAULT_DATACENTER.to_string())
    }
}

impl Replication for StaticRing {
    fn token_of(&self, key: &[u8]) -> Token {
        let mut cursor = Cursor::new(key);
        Token(murmur3_32(&mut cursor, 0).unwrap_or(0))
    }

    fn natural_endpoints(&self, _schema: &SchemaRef, token: Token) -> Vec<Endpoint> {
        self.replicas_for(token)
    }

    fn pending_endpoints_for(&self, _token: Token, schema_full_name: &str) -> Vec<Endpoint> {
        self.pending
            .read()
            .expect("pending lock")
            .get(schema_full_name)
            .cloned()
            .unwrap_or_default()
    }
}
