#![allow(dead_code)]

use std::{future::Future, time::Duration};

use distributed::{CommunicationGroup, group::local_groups};
use worker::{Method, RunConfig};

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

pub fn config(method: Method) -> RunConfig {
    RunConfig {
        method,
        epochs: 1,
        batch_size: 256,
        print_every: 2,
        lr: 0.01,
        timeout_secs: 10,
        seed: 7,
        samples: 2560,
        val_samples: 512,
        shuffle: false,
    }
}
