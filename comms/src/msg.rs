use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::collective::{CollectiveHeader, Failure},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const TENSOR_KIND: Header = 2;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    Tensor(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of a leaf after connecting to the hub.
    Hello { rank: usize, world_size: usize },
    /// The hub's reply once every leaf has greeted it.
    Welcome { world_size: usize },
    Collective(CollectiveHeader),
    Fail(Failure),
    /// A worker hit a fatal error, the group can't make progress anymore.
    Abort { rank: usize, reason: String },
    Shutdown { rank: usize },
    ShutdownAck,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a stable identifier for the kind of message, used for observability.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Welcome { .. }) => "control/welcome",
            Msg::Control(Command::Collective(_)) => "control/collective",
            Msg::Control(Command::Fail(_)) => "control/fail",
            Msg::Control(Command::Abort { .. }) => "control/abort",
            Msg::Control(Command::Shutdown { .. }) => "control/shutdown",
            Msg::Control(Command::ShutdownAck) => "control/shutdown_ack",
            Msg::Data(Payload::Tensor(_)) => "data/tensor",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid message kind {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Tensor(nums)) => {
                buf.extend_from_slice(&TENSOR_KIND.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR_KIND => {
                let string = str::from_utf8(rest)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            TENSOR_KIND => {
                let nums = bytemuck::try_cast_slice(&*rest).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad tensor payload: {e}"))
                })?;

                Ok(Self::Data(Payload::Tensor(nums)))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
