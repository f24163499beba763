//! Concurrent execution of routed statement batches.
//!
//! Both entry points run every task to completion unless one fails; the
//! first failure wins, the remaining siblings are aborted best-effort, and
//! the error propagates to the caller.

use futures::future::BoxFuture;
use tokio::task::JoinSet;

use crate::error::DbError;
use crate::result::ResultSet;

/// Run update callables concurrently and sum their counts, matching
/// single-node semantics for multi-replica writes: equal writes to N
/// replicas report as N rows written.
pub async fn execute_update_batch(
    tasks: Vec<BoxFuture<'static, Result<i32, DbError>>>,
) -> Result<i32, DbError> {
    let mut set = JoinSet::new();
    for task in tasks {
        set.spawn(task);
    }
    let mut total: i32 = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(count)) => total = total.saturating_add(count),
            Ok(Err(e)) => {
                set.abort_all();
                return Err(e);
            }
            Err(join_error) => {
                set.abort_all();
                return Err(DbError::convert(join_error));
            }
        }
    }
    Ok(total)
}

/// Run select callables concurrently, returning their results in
/// submission order.
pub async fn execute_select_batch(
    tasks: Vec<BoxFuture<'static, Result<Box<dyn ResultSet>, DbError>>>,
) -> Result<Vec<Box<dyn ResultSet>>, DbError> {
    let count = tasks.len();
    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (index, task.await) });
    }
    let mut slots: Vec<Option<Box<dyn ResultSet>>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Ok(result))) => slots[index] = Some(result),
            Ok((_, Err(e))) => {
                set.abort_all();
                return Err(e);
            }
            Err(join_error) => {
                set.abort_all();
                return Err(DbError::convert(join_error));
            }
        }
    }
    let mut results = Vec::with_capacity(count);
    for slot in slots {
        results.push(slot.ok_or_else(|| DbError::Protocol("missing batch result".into()))?);
    }
    Ok(results)
}
