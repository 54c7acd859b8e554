//! Forming the group: the hub admits every leaf's `Hello`, then welcomes them all at once.

use std::{net::SocketAddr, time::Duration};

use comms::msg::{Command, Msg};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Instant},
};

use super::{
    hub::Hub,
    leaf::Leaf,
    link::{Link, UNKNOWN_RANK},
};
use crate::error::{DistErr, Result};

const CONNECT_RETRY: Duration = Duration::from_millis(50);

fn timed_out(timeout: Duration) -> DistErr {
    DistErr::RendezvousTimeout {
        seq: None,
        waited: timeout,
    }
}

/// Accepts leaves on `addr` until every rank of the group joined.
///
/// Connections are read concurrently, one that never says hello doesn't hold back the rest and is
/// dropped once the group is complete.
pub(super) async fn hub_tcp(addr: SocketAddr, world_size: usize, timeout: Duration) -> Result<Hub> {
    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();

    if slots.is_empty() {
        return Ok(Hub::new(Vec::new()));
    }

    let listener = TcpListener::bind(addr).await?;
    info!(world_size = world_size; "waiting for the group at {addr}");

    let mut greetings = FuturesUnordered::new();

    while slots.iter().any(Option::is_none) {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;
                let (rx, tx) = stream.into_split();
                let mut link = Link::new(UNKNOWN_RANK, rx, tx);

                debug!("connection from {peer}, waiting for its hello");
                greetings.push(async move {
                    let claim = hello(&mut link).await;
                    (link, peer, claim)
                });
            }
            Some((mut link, peer, claim)) = greetings.next() => {
                let admitted = match claim {
                    Ok(claim) => {
                        let verdict = claim.and_then(|(rank, theirs)| check_hello(rank, theirs, world_size, &slots));
                        time::timeout_at(deadline, settle(&mut link, verdict))
                            .await
                            .map_err(|_| timed_out(timeout))?
                    }
                    Err(e) => Err(e),
                };

                match admitted {
                    Ok(rank) => {
                        info!(rank = rank; "worker joined from {peer}");
                        link.rank = rank;
                        slots[rank - 1] = Some(link);
                    }
                    Err(e) => warn!("rejected connection from {peer}: {e}"),
                }
            }
            () = time::sleep_until(deadline) => return Err(timed_out(timeout)),
        }
    }

    if !greetings.is_empty() {
        debug!("dropping {} connections that never said hello", greetings.len());
    }
    drop(greetings);

    let mut leaves: Vec<Link> = slots.into_iter().flatten().collect();
    time::timeout_at(deadline, welcome(&mut leaves, world_size))
        .await
        .map_err(|_| timed_out(timeout))??;

    Ok(Hub::new(leaves))
}

/// Connects to the hub at `addr`, retrying until it's up or the timeout elapses.
pub(super) async fn leaf_tcp(
    addr: SocketAddr,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<Leaf> {
    let deadline = Instant::now() + timeout;

    let stream = loop {
        match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) if Instant::now() + CONNECT_RETRY < deadline => {
                debug!(rank = rank; "hub at {addr} not reachable yet: {e}");
                time::sleep(CONNECT_RETRY).await;
            }
            _ => return Err(timed_out(timeout)),
        }
    };

    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let mut link = Link::new(0, rx, tx);

    time::timeout_at(deadline, greet(&mut link, rank, world_size))
        .await
        .map_err(|_| timed_out(timeout))??;

    Ok(Leaf::new(rank, link))
}

/// Runs the hub side of the rendezvous over already established links.
pub(super) async fn hub_links(
    links: Vec<Link>,
    world_size: usize,
    timeout: Duration,
) -> Result<Hub> {
    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();

    for mut link in links {
        let claim = time::timeout_at(deadline, hello(&mut link))
            .await
            .map_err(|_| timed_out(timeout))??;
        let verdict = claim.and_then(|(rank, theirs)| check_hello(rank, theirs, world_size, &slots));
        let rank = time::timeout_at(deadline, settle(&mut link, verdict))
            .await
            .map_err(|_| timed_out(timeout))??;

        link.rank = rank;
        slots[rank - 1] = Some(link);
    }

    let mut leaves: Vec<Link> = slots.into_iter().flatten().collect();
    if leaves.len() + 1 != world_size {
        return Err(DistErr::invalid_config(format!(
            "the hub got {} links for a group of {world_size}",
            leaves.len()
        )));
    }

    time::timeout_at(deadline, welcome(&mut leaves, world_size))
        .await
        .map_err(|_| timed_out(timeout))??;

    Ok(Hub::new(leaves))
}

/// Runs the leaf side of the rendezvous over an already established link.
pub(super) async fn leaf_link(
    mut link: Link,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<Leaf> {
    time::timeout(timeout, greet(&mut link, rank, world_size))
        .await
        .map_err(|_| timed_out(timeout))??;

    Ok(Leaf::new(rank, link))
}

/// Reads the first message of a connection.
///
/// # Returns
/// The rank and group size the leaf claims, or why its first message isn't a hello.
async fn hello(link: &mut Link) -> Result<std::result::Result<(usize, usize), String>> {
    let claim = match link.recv().await? {
        Msg::Control(Command::Hello { rank, world_size }) => Ok((rank, world_size)),
        other => Err(format!("expected a hello, got {}", other.kind())),
    };

    Ok(claim)
}

/// Acts on the verdict of `check_hello`, telling the leaf when it's refused.
///
/// The verdict is computed by the caller so no borrow of the slots is held across an await.
async fn settle(link: &mut Link, verdict: std::result::Result<usize, String>) -> Result<usize> {
    match verdict {
        Ok(rank) => Ok(rank),
        Err(reason) => {
            if let Err(e) = link.send(&Msg::Err(reason.as_str().into())).await {
                debug!("couldn't deliver the rejection: {e}");
            }

            Err(DistErr::RendezvousRejected { reason })
        }
    }
}

fn check_hello(
    rank: usize,
    theirs: usize,
    world_size: usize,
    slots: &[Option<Link>],
) -> std::result::Result<usize, String> {
    if theirs != world_size {
        return Err(format!(
            "rank {rank} expects a group of {theirs}, this group has {world_size}"
        ));
    }

    if rank == 0 || rank >= world_size {
        return Err(format!("rank {rank} is out of range 1..{world_size}"));
    }

    if slots.get(rank - 1).is_some_and(Option::is_some) {
        return Err(format!("rank {rank} already joined"));
    }

    Ok(rank)
}

async fn welcome(leaves: &mut [Link], world_size: usize) -> Result<()> {
    for link in leaves {
        link.send(&Msg::Control(Command::Welcome { world_size })).await?;
    }

    Ok(())
}

/// Introduces this worker to the hub and waits to be welcomed.
async fn greet(link: &mut Link, rank: usize, world_size: usize) -> Result<()> {
    link.send(&Msg::Control(Command::Hello { rank, world_size }))
        .await?;

    match link.recv().await? {
        Msg::Control(Command::Welcome { world_size: theirs }) if theirs == world_size => Ok(()),
        Msg::Control(Command::Welcome { world_size: theirs }) => Err(DistErr::RendezvousRejected {
            reason: format!("the hub runs a group of {theirs}, expected {world_size}"),
        }),
        Msg::Err(reason) => Err(DistErr::RendezvousRejected {
            reason: reason.into_owned(),
        }),
        other => Err(DistErr::UnexpectedMessage {
            rank: 0,
            got: other.kind(),
            expected: "control/welcome",
        }),
    }
}
