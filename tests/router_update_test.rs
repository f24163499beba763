mod common;

use common::{owners_of, start_cluster, ClusterOpts, TestNode};
use shardcast::statement::StatementKind;
use shardcast::value::Value;
use shardcast::DbError;

fn key_not_owned_by(caller: &TestNode) -> (Value, Vec<shardcast::Endpoint>) {
    for candidate in 0..1000 {
        let key = Value::Int(candidate);
        let owners = owners_of(caller, "app.t", &key);
        if !owners.contains(&caller.endpoint) {
            return (key, owners);
        }
    }
    panic!("no remote-owned key found");
}

fn key_owned_by(caller: &TestNode) -> (Value, Vec<shardcast::Endpoint>) {
    for candidate in 0..1000 {
        let key = Value::Int(candidate);
        let owners = owners_of(caller, "app.t", &key);
        if owners.contains(&caller.endpoint) {
            return (key, owners);
        }
    }
    panic!("no locally-owned key found");
}

#[tokio::test]
async fn resolved_update_dispatches_to_exactly_the_owner_set() {
    let nodes = start_cluster(ClusterOpts::default()).await;
    let caller = &nodes[0];
    let (key, owners) = key_not_owned_by(caller);
    let sql = "UPDATE t SET v = 0 WHERE k = ?";

    let statement = caller
        .statement(StatementKind::Update, sql)
        .with_filter("app.t", Some(key))
        .with_params(vec![Value::Int(1)]);
    let count = caller.router.execute_update(statement).await.unwrap();
    assert_eq!(count as usize, owners.len(), "one count per replica write");

    for node in &nodes {
        let expected = usize::from(owners.contains(&node.endpoint));
        assert_eq!(node.engine.executed("update:UPDATE t SET v = 0"), expected);
    }
}

#[tokio::test]
async fn resolved_delete_including_self_runs_the_local_branch_in_place() {
    let nodes = start_cluster(ClusterOpts::default()).await;
    let caller = &nodes[2];
    let (key, owners) = key_owned_by(caller);
    let sql = "DELETE FROM t WHERE k = ?";

    let statement = caller
        .statement(StatementKind::Delete, sql)
        .with_filter("app.t", Some(key))
        .with_params(vec![Value::Int(1)]);
    let count = caller.router.execute_update(statement).await.unwrap();
    assert_eq!(count as usize, owners.len());
    assert_eq!(caller.engine.executed("update:DELETE FROM t"), 1);
}

#[tokio::test]
async fn unresolved_update_broadcasts_to_all_live_members() {
    let nodes = start_cluster(ClusterOpts::default()).await;
    let caller = &nodes[0];
    let sql = "UPDATE t SET v = v + 1";

    let statement = caller.statement(StatementKind::Update, sql);
    let count = caller.router.execute_update(statement).await.unwrap();
    assert_eq!(count, 3);
    for node in &nodes {
        assert_eq!(node.engine.executed("update:UPDATE t SET v = v + 1"), 1);
    }
}

#[tokio::test]
async fn broadcast_skips_members_the_caller_sees_as_dead() {
    let nodes = start_cluster(ClusterOpts::default()).await;
    let caller = &nodes[0];
    caller.ring.mark_down(&nodes[2].endpoint);
    let sql = "DELETE FROM t";

    let statement = caller.statement(StatementKind::Delete, sql);
    let count = caller.router.execute_update(statement).await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(nodes[2].engine.executed("update:"), 0);
}

#[tokio::test]
async fn first_peer_failure_propagates() {
    let nodes = start_cluster(ClusterOpts::default()).await;
    let caller = &nodes[0];
    // every member runs this and fails on execution
    let statement = caller.statement(StatementKind::Update, "UPDATE t SET v = FAIL");
    let err = caller.router.execute_update(statement).await.unwrap_err();
    match err {
        // the local branch loses the race to a peer on some runs
        DbError::Peer { message, .. } => assert!(message.contains("scripted failure")),
        DbError::Cluster(message) => assert!(message.contains("scripted failure")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn select_routed_as_update_is_rejected() {
    let nodes = start_cluster(ClusterOpts {
        nodes: 1,
        rf: 1,
        ..Default::default()
    })
    .await;
    let statement = nodes[0].statement(StatementKind::Select, "SELECT v FROM t");
    assert!(nodes[0].router.execute_update(statement).await.is_err());
}
