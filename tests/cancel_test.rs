mod common;

use std::time::Duration;

use common::{start_cluster, ClusterOpts};
use shardcast::error::{codes, DbError};
use shardcast::session::{ClientSession, SessionPool};

#[tokio::test]
async fn out_of_band_cancel_unblocks_inflight_execute() {
    let nodes = start_cluster(ClusterOpts {
        nodes: 1,
        rf: 1,
        ..Default::default()
    })
    .await;
    let node = &nodes[0];

    let session = ClientSession::connect(node.endpoint.addr(), false)
        .await
        .unwrap();
    let mut command = SessionPool::command_on(session.clone(), "SELECT SLOW FROM t", vec![], 64)
        .await
        .unwrap();
    let id = command.id();

    let inflight = tokio::spawn(async move { command.execute_query(0, false).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the cancel goes out on its own connection while the execute holds
    // the session lock
    session.cancel_statement(id).await;

    let err = tokio::time::timeout(Duration::from_secs(5), inflight)
        .await
        .expect("execute unblocked by cancel")
        .unwrap()
        .unwrap_err();
    match err {
        DbError::Peer { code, .. } => assert_eq!(code, codes::STATEMENT_CANCELLED),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancel_for_unknown_command_is_harmless() {
    let nodes = start_cluster(ClusterOpts {
        nodes: 1,
        rf: 1,
        ..Default::default()
    })
    .await;
    let session = ClientSession::connect(nodes[0].endpoint.addr(), false)
        .await
        .unwrap();
    session.cancel_statement(4242).await;

    // session remains fully usable
    let mut command = SessionPool::command_on(session, "DELETE FROM t", vec![], 64)
        .await
        .unwrap();
    assert_eq!(command.execute_update().await.unwrap(), 1);
    command.close().await;
}
