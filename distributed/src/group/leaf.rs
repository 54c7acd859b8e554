use std::time::Duration;

use comms::{
    msg::{Command, Msg, Payload},
    specs::collective::CollectiveHeader,
};
use log::debug;
use tokio::time;

use super::link::Link;
use crate::error::{DistErr, Result};

/// The side of the group every non zero rank runs, a single link to the hub.
pub(super) struct Leaf {
    rank: usize,
    hub: Link,
}

impl Leaf {
    pub fn new(rank: usize, hub: Link) -> Self {
        Self { rank, hub }
    }

    /// Sends this worker's contribution and waits for its share of the result.
    ///
    /// # Arguments
    /// * `header` - Announces the collective the worker is in.
    /// * `data` - The worker's contribution, `header.len` values long.
    /// * `timeout` - The bound on the whole exchange.
    pub async fn collective(
        &mut self,
        header: CollectiveHeader,
        data: &[f32],
        timeout: Duration,
    ) -> Result<Vec<f32>> {
        let hub = &mut self.hub;

        let exchange = async {
            hub.send(&Msg::Control(Command::Collective(header))).await?;
            hub.send(&Msg::Data(Payload::Tensor(data))).await?;

            match hub.recv().await? {
                Msg::Data(Payload::Tensor(result)) => Ok::<_, DistErr>(result.to_vec()),
                Msg::Control(Command::Fail(failure)) => Err(failure.into()),
                Msg::Control(Command::Abort { rank, reason }) => {
                    Err(DistErr::PeerAborted { rank, reason })
                }
                other => Err(DistErr::UnexpectedMessage {
                    rank: 0,
                    got: other.kind(),
                    expected: "data/tensor",
                }),
            }
        };

        time::timeout(timeout, exchange)
            .await
            .map_err(|_| DistErr::RendezvousTimeout {
                seq: Some(header.seq),
                waited: timeout,
            })?
    }

    /// Leaves the group, waiting for the hub's acknowledgement.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let rank = self.rank;
        let hub = &mut self.hub;

        let exchange = async {
            hub.send(&Msg::Control(Command::Shutdown { rank })).await?;

            match hub.recv().await? {
                Msg::Control(Command::ShutdownAck) => {}
                Msg::Control(Command::Abort { rank, reason }) => {
                    return Err(DistErr::PeerAborted { rank, reason });
                }
                other => {
                    return Err(DistErr::UnexpectedMessage {
                        rank: 0,
                        got: other.kind(),
                        expected: "control/shutdown_ack",
                    });
                }
            }

            hub.close().await
        };

        time::timeout(timeout, exchange)
            .await
            .map_err(|_| DistErr::RendezvousTimeout {
                seq: None,
                waited: timeout,
            })?
    }

    /// Tells the hub this worker can't go on, the hub relays it to everyone else.
    pub async fn abort(&mut self, reason: &str, timeout: Duration) {
        let msg = Msg::Control(Command::Abort {
            rank: self.rank,
            reason: reason.to_string(),
        });

        match time::timeout(timeout, self.hub.send(&msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(rank = self.rank; "couldn't notify the hub: {e}"),
            Err(_) => debug!(rank = self.rank; "gave up notifying the hub after {timeout:?}"),
        }
    }
}
