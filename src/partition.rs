//! Partition-key to endpoint resolution.

use std::sync::Arc;

use crate::cluster::{Endpoint, Replication, SchemaRef, Token};
use crate::statement::TableFilter;

/// Maps a statement's primary table filter to the endpoints owning its
/// partition, when the filter pins a single partition key.
pub struct PartitionResolver {
    replication: Arc<dyn Replication>,
}

impl PartitionResolver {
    pub fn new(replication: Arc<dyn Replication>) -> Self {
        PartitionResolver { replication }
    }

    pub fn token_of(&self, key: &[u8]) -> Token {
        self.replication.token_of(key)
    }

    /// Natural followed by pending endpoints for a token. Natural comes
    /// first; duplicates are permitted.
    pub fn targets_for_token(&self, schema: &SchemaRef, token: Token) -> Vec<Endpoint> {
        let mut endpoints = self.replication.natural_endpoints(schema, token);
        endpoints.extend(
            self.replication
                .pending_endpoints_for(token, schema.full_name()),
        );
        endpoints
    }

    /// The endpoint set for a filter that pins one partition-key literal;
    /// `None` when no key can be extracted, which sends the router down
    /// the broadcast path.
    pub fn targets_if_equal(&self, filter: &TableFilter) -> Option<Vec<Endpoint>> {
        let key = filter.partition_key.as_ref()?;
        let token = self.replication.token_of(&key.bytes_for_hash());
        Some(self.targets_for_token(&filter.schema, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticRing;
    use crate::value::Value;

    fn resolver() -> (PartitionResolver, Vec<Endpoint>) {
        let nodes: Vec<Endpoint> = (0..3)
            .map(|i| Endpoint::new(format!("127.0.0.1:{}", 7200 + i)))
            .collect();
        let ring = Arc::new(StaticRing::new(
            nodes[0].clone(),
            nodes[1..].to_vec(),
            vec![nodes[0].clone()],
            8,
            2,
        ));
        (PartitionResolver::new(ring), nodes)
    }

    #[test]
    fn no_partition_key_resolves_to_none() {
        let (resolver, _) = resolver();
        let filter = TableFilter {
            schema: SchemaRef::new("app.t"),
            partition_key: None,
        };
        assert!(resolver.targets_if_equal(&filter).is_none());
    }

    #[test]
    fn pinned_key_resolves_to_replica_set_with_pending() {
        let (resolver, nodes) = resolver();
        let filter = TableFilter {
            schema: SchemaRef::new("app.t"),
            partition_key: Some(Value::Int(42)),
        };
        let targets = resolver.targets_if_equal(&filter).unwrap();
        assert_eq!(targets.len(), 2);
        for t in &targets {
            assert!(nodes.contains(t));
        }
        // a pending endpoint is appended after the natural set
        let ring = StaticRing::new(
            nodes[0].clone(),
            nodes[1..].to_vec(),
            vec![nodes[0].clone()],
            8,
            2,
        );
        let extra = Endpoint::new("127.0.0.1:7999");
        ring.set_pending("app.t", vec![extra.clone()]);
        let resolver = PartitionResolver::new(Arc::new(ring));
        let targets = resolver.targets_if_equal(&filter).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets.last(), Some(&extra));
    }
}
