//! The communication group: one handle per worker over which every collective is issued.
//!
//! The group is a star, rank 0 is the hub every other rank (a leaf) is connected to. Each
//! collective is announced with a header carrying its sequence number, kind and tensor length,
//! the hub checks every header against its own before combining the tensors, so workers that
//! diverged fail together instead of hanging or silently mixing unrelated data.

mod hub;
mod leaf;
mod link;
mod rendezvous;

use std::{ops::Range, time::Duration};

use comms::specs::collective::{CollectiveHeader, CollectiveOp, ReduceOp};
use futures::future;
use log::{debug, info, warn};
use tokio::io::{self, AsyncRead, AsyncWrite};

use self::{hub::Hub, leaf::Leaf, link::Link};
use crate::{
    error::{DistErr, Result},
    topology::Topology,
};

const LOCAL_LINK_CAPACITY: usize = 64 * 1024;

enum Role {
    Hub(Hub),
    Leaf(Leaf),
}

/// This worker's handle into the group. Not `Clone`, there's exactly one per worker.
pub struct CommunicationGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    seq: u64,
    aborted: bool,
    role: Role,
}

impl CommunicationGroup {
    /// Joins the group described by `topology` over TCP.
    ///
    /// Blocks until every worker of the group reached this call. Rank 0 listens on the rendezvous
    /// address, every other rank connects to it.
    ///
    /// # Arguments
    /// * `topology` - This worker's resolved topology.
    /// * `timeout` - The bound on the rendezvous and, later, on every collective.
    ///
    /// # Errors
    /// `RendezvousTimeout` if the group didn't form in time, `RendezvousRejected` if the hub
    /// refused this worker.
    pub async fn create_tcp(topology: &Topology, timeout: Duration) -> Result<Self> {
        let rank = topology.identity.rank;
        let world_size = topology.identity.world_size;
        let addr = topology.rendezvous;

        let role = if rank == 0 {
            Role::Hub(rendezvous::hub_tcp(addr, world_size, timeout).await?)
        } else {
            Role::Leaf(rendezvous::leaf_tcp(addr, rank, world_size, timeout).await?)
        };

        info!(rank = rank, world_size = world_size; "joined the group");
        Ok(Self::new(rank, world_size, timeout, role))
    }

    /// Joins a group over already established transports.
    ///
    /// # Arguments
    /// * `rank` - This worker's rank.
    /// * `world_size` - The amount of workers in the group.
    /// * `links` - For rank 0 one transport per other rank in any order, for any other rank a
    ///   single transport to rank 0.
    /// * `timeout` - The bound on the rendezvous and every collective.
    pub async fn from_links<R, W>(
        rank: usize,
        world_size: usize,
        links: Vec<(R, W)>,
        timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if rank >= world_size {
            return Err(DistErr::invalid_config(format!(
                "rank {rank} is out of range for a group of {world_size}"
            )));
        }

        let mut links: Vec<Link> = links
            .into_iter()
            .map(|(rx, tx)| Link::new(link::UNKNOWN_RANK, rx, tx))
            .collect();

        let role = if rank == 0 {
            Role::Hub(rendezvous::hub_links(links, world_size, timeout).await?)
        } else {
            let (Some(mut hub), None) = (links.pop(), links.pop()) else {
                return Err(DistErr::invalid_config(
                    "a leaf needs exactly one link, to rank 0",
                ));
            };

            hub.rank = 0;
            Role::Leaf(rendezvous::leaf_link(hub, rank, world_size, timeout).await?)
        };

        Ok(Self::new(rank, world_size, timeout, role))
    }

    fn new(rank: usize, world_size: usize, timeout: Duration, role: Role) -> Self {
        Self {
            rank,
            world_size,
            timeout,
            seq: 0,
            aborted: false,
            role,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reduces `data` element wise across the group, every worker ends up with the same result.
    ///
    /// # Arguments
    /// * `data` - This worker's contribution, overwritten with the result.
    /// * `op` - The reduction.
    ///
    /// # Errors
    /// `ShapeMismatch` on every worker if the contributions differ in length.
    pub async fn all_reduce(&mut self, data: &mut [f32], op: ReduceOp) -> Result<()> {
        let result = self.run(CollectiveOp::AllReduce { op }, data, None).await?;
        self.copy_result(data, &result)
    }

    /// Overwrites `data` on every worker with `root`'s copy.
    pub async fn broadcast(&mut self, data: &mut [f32], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(DistErr::invalid_config(format!(
                "broadcast root {root} is out of range for a group of {}",
                self.world_size
            )));
        }

        let result = self.run(CollectiveOp::Broadcast { root }, data, None).await?;
        self.copy_result(data, &result)
    }

    /// Concatenates every worker's `data` in rank order, lengths may differ between workers.
    pub async fn all_gather(&mut self, data: &[f32]) -> Result<Vec<f32>> {
        self.run(CollectiveOp::AllGather, data, None).await
    }

    /// Reduces `data` across the group and returns this worker's range of the result.
    ///
    /// # Arguments
    /// * `data` - This worker's contribution to the full tensor.
    /// * `ranges` - The range of the result each rank receives, one per rank.
    /// * `op` - The reduction.
    pub async fn reduce_scatter(
        &mut self,
        data: &[f32],
        ranges: &[Range<usize>],
        op: ReduceOp,
    ) -> Result<Vec<f32>> {
        if ranges.len() != self.world_size || ranges.iter().any(|r| r.end > data.len()) {
            return Err(DistErr::invalid_config(format!(
                "reduce scatter ranges {ranges:?} don't split {} values among {} ranks",
                data.len(),
                self.world_size
            )));
        }

        let result = self
            .run(CollectiveOp::ReduceScatter { op }, data, Some(ranges))
            .await?;

        let expected = ranges[self.rank].len();
        if result.len() != expected {
            return Err(DistErr::ShapeMismatch {
                seq: self.seq - 1,
                rank: self.rank,
                got: result.len(),
                expected,
            });
        }

        Ok(result)
    }

    /// Waits until every worker of the group reached the barrier.
    pub async fn barrier(&mut self) -> Result<()> {
        self.run(CollectiveOp::Barrier, &[], None).await.map(|_| ())
    }

    /// Tells the rest of the group this worker hit a fatal error.
    ///
    /// Workers waiting in a collective fail with `PeerAborted` instead of waiting for the
    /// timeout. Every later collective on this handle fails right away.
    pub async fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }

        warn!(rank = self.rank; "aborting the group: {reason}");
        self.aborted = true;

        match &mut self.role {
            Role::Hub(hub) => hub.abort(reason, self.timeout).await,
            Role::Leaf(leaf) => leaf.abort(reason, self.timeout).await,
        }
    }

    /// Leaves the group for good, waiting until every worker did the same.
    ///
    /// After an `abort` the transports are just dropped.
    pub async fn destroy(mut self) -> Result<()> {
        if self.aborted {
            debug!(rank = self.rank; "dropping an aborted group");
            return Ok(());
        }

        match &mut self.role {
            Role::Hub(hub) => hub.shutdown(self.timeout).await?,
            Role::Leaf(leaf) => leaf.shutdown(self.timeout).await?,
        }

        info!(rank = self.rank; "left the group");
        Ok(())
    }

    async fn run(
        &mut self,
        op: CollectiveOp,
        data: &[f32],
        scatter: Option<&[Range<usize>]>,
    ) -> Result<Vec<f32>> {
        if self.aborted {
            return Err(DistErr::PeerAborted {
                rank: self.rank,
                reason: "this worker already aborted the group".to_string(),
            });
        }

        let header = CollectiveHeader {
            seq: self.seq,
            op,
            len: data.len(),
        };
        self.seq += 1;

        debug!(rank = self.rank, seq = header.seq, len = header.len; "entering {op:?}");

        match &mut self.role {
            Role::Hub(hub) => hub.collective(header, data, scatter, self.timeout).await,
            Role::Leaf(leaf) => leaf.collective(header, data, self.timeout).await,
        }
    }

    fn copy_result(&self, data: &mut [f32], result: &[f32]) -> Result<()> {
        if data.len() != result.len() {
            return Err(DistErr::ShapeMismatch {
                seq: self.seq - 1,
                rank: self.rank,
                got: result.len(),
                expected: data.len(),
            });
        }

        data.copy_from_slice(result);
        Ok(())
    }
}

/// Wires `world_size` groups together through in-memory pipes.
///
/// # Returns
/// The groups indexed by rank, with their rendezvous already completed.
pub async fn local_groups(world_size: usize, timeout: Duration) -> Result<Vec<CommunicationGroup>> {
    if world_size == 0 {
        return Err(DistErr::invalid_config("a group needs at least one worker"));
    }

    let mut hub_links = Vec::with_capacity(world_size - 1);
    let mut leaf_links = Vec::with_capacity(world_size - 1);

    for _ in 1..world_size {
        let (hub_end, leaf_end) = io::duplex(LOCAL_LINK_CAPACITY);
        hub_links.push(io::split(hub_end));
        leaf_links.push(io::split(leaf_end));
    }

    let mut joins = vec![CommunicationGroup::from_links(
        0, world_size, hub_links, timeout,
    )];

    for (i, link) in leaf_links.into_iter().enumerate() {
        joins.push(CommunicationGroup::from_links(
            i + 1,
            world_size,
            vec![link],
            timeout,
        ));
    }

    future::try_join_all(joins).await
}
