use std::io;

use comms::{OnoReceiver, OnoSender, msg::Msg};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{DistErr, Result};

type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Placeholder rank of a connection that hasn't introduced itself yet.
pub(super) const UNKNOWN_RANK: usize = usize::MAX;

/// A framed, bidirectional connection to one peer of the group.
pub(super) struct Link {
    pub rank: usize,
    rx: OnoReceiver<BoxReader>,
    tx: OnoSender<BoxWriter>,
    buf: Vec<u32>,
}

impl Link {
    /// Creates a new `Link` over any transport.
    ///
    /// # Arguments
    /// * `rank` - The rank of the peer on the other end.
    /// * `rx` - The reading half of the transport.
    /// * `tx` - The writing half of the transport.
    pub fn new<R, W>(rank: usize, rx: R, tx: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (rx, tx) = comms::channel(Box::new(rx) as BoxReader, Box::new(tx) as BoxWriter);

        Self {
            rank,
            rx,
            tx,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, msg: &Msg<'_>) -> Result<()> {
        let rank = self.rank;
        self.tx.send(msg).await.map_err(|e| lost(rank, e))
    }

    /// Waits for the next message, borrowed from this link's buffer.
    pub async fn recv(&mut self) -> Result<Msg<'_>> {
        let rank = self.rank;
        self.rx
            .recv_into(&mut self.buf)
            .await
            .map_err(|e| lost(rank, e))
    }

    pub async fn close(&mut self) -> Result<()> {
        Ok(self.tx.close().await?)
    }
}

/// Maps a transport error to a peer failure when the connection is gone.
fn lost(rank: usize, e: io::Error) -> DistErr {
    use io::ErrorKind::*;

    match e.kind() {
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => DistErr::PeerAborted {
            rank,
            reason: format!("connection lost: {e}"),
        },
        _ => DistErr::Io(e),
    }
}
