use std::{future::Future, time::Duration};

use distributed::{CommunicationGroup, group::local_groups};

/// Runs `f` once per rank of an in-memory group, each on its own task.
pub async fn run_group<F, Fut, T>(world_size: usize, timeout: Duration, f: F) -> Vec<T>
where
    F: Fn(CommunicationGroup) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let groups = local_groups(world_size, timeout).await.unwrap();
    let handles: Vec<_> = groups.into_iter().map(|g| tokio::spawn(f(g))).collect();

    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}
