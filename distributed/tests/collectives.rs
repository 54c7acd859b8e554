mod common;

use std::time::Duration;

use distributed::{DistErr, ReduceOp, group::local_groups, shard_range};
use tokio::time::{self, Instant};

use common::run_group;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_reduce_is_identical_everywhere() {
    let results = run_group(4, TIMEOUT, |mut g| async move {
        let r = g.rank() as f32;
        let mut sum = [r, 10. * r, 1.];
        let mut avg = [r, 10. * r, 1.];

        g.all_reduce(&mut sum, ReduceOp::Sum).await.unwrap();
        g.all_reduce(&mut avg, ReduceOp::Average).await.unwrap();
        g.destroy().await.unwrap();
        (sum, avg)
    })
    .await;

    for (sum, avg) in results {
        assert_eq!(sum, [6., 60., 4.]);
        assert_eq!(avg, [1.5, 15., 1.]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_copies_root() {
    let results = run_group(3, TIMEOUT, |mut g| async move {
        let mut data = [g.rank() as f32; 4];
        g.broadcast(&mut data, 2).await.unwrap();
        g.destroy().await.unwrap();
        data
    })
    .await;

    assert!(results.iter().all(|d| *d == [2.; 4]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_gather_accepts_uneven_shards() {
    let results = run_group(3, TIMEOUT, |mut g| async move {
        let range = shard_range(7, g.rank(), 3);
        let shard: Vec<f32> = range.map(|i| i as f32).collect();
        let full = g.all_gather(&shard).await.unwrap();
        g.destroy().await.unwrap();
        full
    })
    .await;

    let expected: Vec<f32> = (0..7).map(|i| i as f32).collect();
    assert!(results.iter().all(|full| *full == expected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reduce_scatter_returns_own_range() {
    let results = run_group(3, TIMEOUT, |mut g| async move {
        let ranges: Vec<_> = (0..3).map(|r| shard_range(5, r, 3)).collect();
        let data = vec![g.rank() as f32 + 1.; 5];
        let mine = g
            .reduce_scatter(&data, &ranges, ReduceOp::Average)
            .await
            .unwrap();
        g.destroy().await.unwrap();
        mine
    })
    .await;

    assert_eq!(results[0], [2., 2.]);
    assert_eq!(results[1], [2., 2.]);
    assert_eq!(results[2], [2.]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_shapes_fail_on_every_worker() {
    for odd in [0, 2] {
        let results = run_group(4, TIMEOUT, move |mut g| async move {
            let len = if g.rank() == odd { 3 } else { 2 };
            let mut data = vec![1.; len];
            g.all_reduce(&mut data, ReduceOp::Sum).await
        })
        .await;

        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.kind(), "ShapeMismatchError", "{err}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_tensors_bigger_than_the_link_buffer_fail_on_every_worker() {
    for odd in [0, 2] {
        let results = run_group(4, TIMEOUT, move |mut g| async move {
            let len = if g.rank() == odd { 100_000 } else { 50_000 };
            let mut data = vec![1.; len];
            (g.rank(), g.all_reduce(&mut data, ReduceOp::Sum).await)
        })
        .await;

        for (rank, result) in results {
            let err = result.unwrap_err();
            assert_eq!(err.kind(), "ShapeMismatchError", "rank {rank}: {err}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diverging_collectives_fail_on_every_worker() {
    let results = run_group(3, TIMEOUT, |mut g| async move {
        let mut data = [1., 2.];

        if g.rank() == 1 {
            g.broadcast(&mut data, 0).await
        } else {
            g.all_reduce(&mut data, ReduceOp::Sum).await
        }
    })
    .await;

    for result in results {
        assert!(matches!(
            result,
            Err(DistErr::CollectiveMismatch { rank: 1, .. })
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_releases_peers_before_the_timeout() {
    let timeout = Duration::from_secs(10);

    for aborting in [0, 2] {
        let start = Instant::now();

        let results = run_group(4, timeout, move |mut g| async move {
            let mut data = [1.; 8];

            if g.rank() == aborting {
                g.abort("loss is not finite").await;
                return Err(DistErr::InvalidConfig {
                    reason: "local failure".into(),
                });
            }

            g.all_reduce(&mut data, ReduceOp::Sum).await
        })
        .await;

        assert!(start.elapsed() < timeout);

        for (rank, result) in results.into_iter().enumerate() {
            if rank == aborting {
                continue;
            }

            match result {
                Err(DistErr::PeerAborted { rank, reason }) => {
                    assert_eq!(rank, aborting);
                    assert_eq!(reason, "loss is not finite");
                }
                other => panic!("rank {rank} got {other:?}"),
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vanished_worker_is_reported_as_aborted() {
    let results = run_group(3, TIMEOUT, |mut g| async move {
        if g.rank() == 1 {
            drop(g);
            return None;
        }

        let mut data = [1.];
        Some(g.all_reduce(&mut data, ReduceOp::Sum).await)
    })
    .await;

    for result in results.into_iter().flatten() {
        assert_eq!(result.unwrap_err().kind(), "PeerAborted");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_worker_turns_into_a_timeout() {
    let timeout = Duration::from_millis(300);
    let start = Instant::now();

    let results = run_group(3, timeout, move |mut g| async move {
        if g.rank() == 2 {
            time::sleep(timeout * 4).await;
            return None;
        }

        let mut data = [1.];
        Some(g.all_reduce(&mut data, ReduceOp::Sum).await)
    })
    .await;

    for result in results.into_iter().flatten() {
        assert_eq!(result.unwrap_err().kind(), "RendezvousTimeout");
    }

    assert!(start.elapsed() < timeout * 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collectives_after_abort_fail_fast() {
    let mut groups = local_groups(1, TIMEOUT).await.unwrap();
    let mut g = groups.remove(0);

    g.barrier().await.unwrap();
    g.abort("done").await;

    let err = g.barrier().await.unwrap_err();
    assert_eq!(err.kind(), "PeerAborted");
    g.destroy().await.unwrap();
}
