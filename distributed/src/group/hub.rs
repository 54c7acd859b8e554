use std::{ops::Range, time::Duration};

use comms::{
    msg::{Command, Msg, Payload},
    specs::collective::{CollectiveHeader, CollectiveOp, Failure, ReduceOp},
};
use futures::future;
use log::{debug, warn};
use tokio::time;

use super::link::Link;
use crate::error::{DistErr, Result};

/// What a leaf brought to a collective.
enum Arrival {
    Tensor(Vec<f32>),
    Failed(Failure),
    Aborted { rank: usize, reason: String },
}

/// The rank 0 side of the group, every collective is computed here and its result sent back.
pub(super) struct Hub {
    /// Sorted by rank, `leaves[i]` is rank `i + 1`.
    leaves: Vec<Link>,
}

impl Hub {
    pub fn new(mut leaves: Vec<Link>) -> Self {
        leaves.sort_by_key(|link| link.rank);
        Self { leaves }
    }

    /// Runs one collective on behalf of the whole group.
    ///
    /// Every leaf's header is validated against the hub's own, the first failure found is sent to
    /// every leaf so the whole group fails the same way.
    ///
    /// # Arguments
    /// * `header` - The hub's own header, the reference every leaf is checked against.
    /// * `data` - The hub's own contribution.
    /// * `scatter` - For reduce scatter, the range of the result that goes to each rank.
    /// * `timeout` - The bound on the wait for the slowest leaf.
    ///
    /// # Returns
    /// The hub's share of the result.
    pub async fn collective(
        &mut self,
        header: CollectiveHeader,
        data: &[f32],
        scatter: Option<&[Range<usize>]>,
        timeout: Duration,
    ) -> Result<Vec<f32>> {
        let arrivals = self.leaves.iter_mut().map(|link| arrive(link, header));
        let gathered = time::timeout(timeout, future::join_all(arrivals)).await;

        let Ok(arrivals) = gathered else {
            let failure = Failure::Timeout {
                seq: header.seq,
                waited_ms: timeout.as_millis() as u64,
            };

            warn!(seq = header.seq; "collective timed out, failing the group");
            self.fan_out(&Msg::Control(Command::Fail(failure.clone())), None, timeout)
                .await;
            return Err(failure.into());
        };

        let mut contributions = Vec::with_capacity(self.leaves.len() + 1);
        contributions.push(data.to_vec());
        let mut failure = None;
        let mut aborted = None;

        for arrival in arrivals {
            match arrival {
                Arrival::Tensor(tensor) => contributions.push(tensor),
                Arrival::Failed(f) => {
                    failure.get_or_insert(f);
                }
                Arrival::Aborted { rank, reason } => {
                    aborted.get_or_insert((rank, reason));
                }
            }
        }

        if let Some((rank, reason)) = aborted {
            warn!(rank = rank, seq = header.seq; "peer aborted during a collective: {reason}");
            let msg = Msg::Control(Command::Abort {
                rank,
                reason: reason.clone(),
            });
            self.fan_out(&msg, Some(rank), timeout).await;
            return Err(DistErr::PeerAborted { rank, reason });
        }

        if let Some(failure) = failure {
            warn!(seq = header.seq; "collective failed: {failure:?}");
            self.fan_out(&Msg::Control(Command::Fail(failure.clone())), None, timeout)
                .await;
            return Err(failure.into());
        }

        let result = match header.op {
            CollectiveOp::AllReduce { op } | CollectiveOp::ReduceScatter { op } => {
                reduce(&contributions, op)
            }
            CollectiveOp::Broadcast { root } => {
                let root = root.min(contributions.len() - 1);
                contributions.swap_remove(root)
            }
            CollectiveOp::AllGather => contributions.concat(),
            CollectiveOp::Barrier => Vec::new(),
        };

        debug!(seq = header.seq, len = result.len(); "collective computed, replying");

        let replies = self.leaves.iter_mut().map(|link| {
            let part = share(&result, scatter, link.rank);
            async move { link.send(&Msg::Data(Payload::Tensor(part))).await }
        });

        time::timeout(timeout, future::try_join_all(replies))
            .await
            .map_err(|_| DistErr::RendezvousTimeout {
                seq: Some(header.seq),
                waited: timeout,
            })??;

        Ok(share(&result, scatter, 0).to_vec())
    }

    /// Waits for every leaf to leave the group and acknowledges it.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let waits = self.leaves.iter_mut().map(|link| async move {
            let rank = link.rank;

            match link.recv().await? {
                Msg::Control(Command::Shutdown { .. }) => Ok(()),
                Msg::Control(Command::Abort { rank, reason }) => {
                    Err(DistErr::PeerAborted { rank, reason })
                }
                other => Err(DistErr::UnexpectedMessage {
                    rank,
                    got: other.kind(),
                    expected: "control/shutdown",
                }),
            }
        });

        let outcome = match time::timeout(timeout, future::join_all(waits)).await {
            Ok(outcomes) => outcomes.into_iter().collect::<Result<Vec<_>>>().map(|_| ()),
            Err(_) => Err(DistErr::RendezvousTimeout {
                seq: None,
                waited: timeout,
            }),
        };

        if let Err(e) = outcome {
            let msg = Msg::Control(Command::Abort {
                rank: 0,
                reason: e.to_string(),
            });
            self.fan_out(&msg, None, timeout).await;
            return Err(e);
        }

        let acks = self.leaves.iter_mut().map(|link| async move {
            link.send(&Msg::Control(Command::ShutdownAck)).await?;
            link.close().await
        });

        time::timeout(timeout, future::try_join_all(acks))
            .await
            .map_err(|_| DistErr::RendezvousTimeout {
                seq: None,
                waited: timeout,
            })??;

        Ok(())
    }

    /// Tells every leaf the group can't go on.
    pub async fn abort(&mut self, reason: &str, timeout: Duration) {
        let msg = Msg::Control(Command::Abort {
            rank: 0,
            reason: reason.to_string(),
        });

        self.fan_out(&msg, None, timeout).await;
    }

    /// Best effort delivery of `msg` to every leaf but `skip`.
    async fn fan_out(&mut self, msg: &Msg<'_>, skip: Option<usize>, timeout: Duration) {
        let sends = self
            .leaves
            .iter_mut()
            .filter(|link| Some(link.rank) != skip)
            .map(|link| async move {
                if let Err(e) = link.send(msg).await {
                    debug!(rank = link.rank; "couldn't notify peer: {e}");
                }
            });

        if time::timeout(timeout, future::join_all(sends)).await.is_err() {
            warn!("gave up notifying the group after {timeout:?}");
        }
    }
}

/// Reads one leaf's header and tensor, checking them against `expected`.
async fn arrive(link: &mut Link, expected: CollectiveHeader) -> Arrival {
    let rank = link.rank;

    match try_arrive(link, expected).await {
        Ok(arrival) => arrival,
        Err(DistErr::PeerAborted { rank, reason }) => Arrival::Aborted { rank, reason },
        Err(e) => Arrival::Aborted {
            rank,
            reason: e.to_string(),
        },
    }
}

async fn try_arrive(link: &mut Link, expected: CollectiveHeader) -> Result<Arrival> {
    let rank = link.rank;
    let seq = expected.seq;

    let header = match link.recv().await? {
        Msg::Control(Command::Collective(header)) => header,
        Msg::Control(Command::Abort { rank, reason }) => {
            return Ok(Arrival::Aborted { rank, reason });
        }
        _ => {
            return Ok(Arrival::Failed(Failure::CollectiveMismatch {
                rank,
                got: None,
                expected,
            }));
        }
    };

    let failure = if header.seq != expected.seq || header.op != expected.op {
        Some(Failure::CollectiveMismatch {
            rank,
            got: Some(header),
            expected,
        })
    } else if expected.op.requires_equal_len() && header.len != expected.len {
        Some(Failure::ShapeMismatch {
            seq,
            rank,
            got: header.len,
            expected: expected.len,
        })
    } else {
        None
    };

    if let Some(failure) = failure {
        return discard_tensor(link, failure).await;
    }

    let arrival = match link.recv().await? {
        Msg::Data(Payload::Tensor(tensor)) if tensor.len() == header.len => {
            Arrival::Tensor(tensor.to_vec())
        }
        Msg::Data(Payload::Tensor(tensor)) => Arrival::Failed(Failure::ShapeMismatch {
            seq,
            rank,
            got: tensor.len(),
            expected: header.len,
        }),
        Msg::Control(Command::Abort { rank, reason }) => Arrival::Aborted { rank, reason },
        _ => Arrival::Failed(Failure::CollectiveMismatch {
            rank,
            got: None,
            expected,
        }),
    };

    Ok(arrival)
}

/// Reads and drops the tensor that follows a rejected header.
///
/// The leaf sends its tensor right after the header and only then waits for the reply, a tensor
/// bigger than the link's buffer would keep it blocked in `send` if nobody read it.
async fn discard_tensor(link: &mut Link, failure: Failure) -> Result<Arrival> {
    let arrival = match link.recv().await? {
        Msg::Control(Command::Abort { rank, reason }) => Arrival::Aborted { rank, reason },
        _ => Arrival::Failed(failure),
    };

    Ok(arrival)
}

/// Folds the contributions element wise, in rank order.
fn reduce(contributions: &[Vec<f32>], op: ReduceOp) -> Vec<f32> {
    let Some((first, rest)) = contributions.split_first() else {
        return Vec::new();
    };

    let mut acc = first.clone();
    for tensor in rest {
        acc.iter_mut().zip(tensor).for_each(|(a, x)| *a += x);
    }

    if op == ReduceOp::Average {
        let n = contributions.len() as f32;
        acc.iter_mut().for_each(|a| *a /= n);
    }

    acc
}

/// Returns the part of `result` that goes to `rank`.
fn share<'a>(result: &'a [f32], scatter: Option<&[Range<usize>]>, rank: usize) -> &'a [f32] {
    match scatter {
        Some(ranges) => ranges
            .get(rank)
            .and_then(|range| result.get(range.clone()))
            .unwrap_or_default(),
        None => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_sum_and_average() {
        let contributions = vec![vec![1., 2.], vec![3., 4.], vec![5., 6.], vec![7., 8.]];

        assert_eq!(reduce(&contributions, ReduceOp::Sum), [16., 20.]);
        assert_eq!(reduce(&contributions, ReduceOp::Average), [4., 5.]);
        assert!(reduce(&[], ReduceOp::Sum).is_empty());
    }

    #[test]
    fn test_share_follows_ranges() {
        let result = [0., 1., 2., 3., 4.];
        let ranges = [0..2, 2..4, 4..5];

        assert_eq!(share(&result, Some(&ranges), 1), [2., 3.]);
        assert_eq!(share(&result, Some(&ranges), 2), [4.]);
        assert!(share(&result, Some(&ranges), 3).is_empty());
        assert_eq!(share(&result, None, 3), result);
    }
}
