//! Boundary between the mixer and whatever carries mixes back to listeners.

mod channel;
mod udp;

pub use channel::{ChannelTransport, Delivery};
pub use udp::UdpTransport;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

use crate::app::session::SessionId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] bincode::Error),

    #[error("No route to listener {0}")]
    UnknownListener(SessionId),

    #[error("Outbound queue full, frame for {0} dropped")]
    QueueFull(SessionId),

    #[error("Transport closed")]
    Closed,
}

/// One frame of output for one listener, borrowed from the mixer's buffer.
///
/// A listener that hears nothing gets `Silent` so no PCM goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum OutboundFrame<'a> {
    Mixed { sequence: u16, samples: &'a [i16] },
    Silent { sequence: u16, sample_count: u16 },
}

impl OutboundFrame<'_> {
    pub fn sequence(&self) -> u16 {
        match self {
            OutboundFrame::Mixed { sequence, .. } | OutboundFrame::Silent { sequence, .. } => {
                *sequence
            }
        }
    }

    pub fn is_silent(&self) -> bool {
        matches!(self, OutboundFrame::Silent { .. })
    }

    pub fn to_packet(&self) -> MixPacket {
        match *self {
            OutboundFrame::Mixed { sequence, samples } => MixPacket::Mixed {
                sequence,
                samples: samples.to_vec(),
            },
            OutboundFrame::Silent {
                sequence,
                sample_count,
            } => MixPacket::Silent {
                sequence,
                sample_count,
            },
        }
    }
}

/// Owned form of [`OutboundFrame`]. Shares its encoding, so a receiver can
/// decode datagrams straight into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MixPacket {
    Mixed { sequence: u16, samples: Vec<i16> },
    Silent { sequence: u16, sample_count: u16 },
}

impl MixPacket {
    pub fn sequence(&self) -> u16 {
        match self {
            MixPacket::Mixed { sequence, .. } | MixPacket::Silent { sequence, .. } => *sequence,
        }
    }
}

/// Where finished frames go. Called from the mixing thread once per listener per
/// frame, so implementations must not block.
pub trait TransportSink {
    fn emit(&mut self, listener: SessionId, frame: &OutboundFrame<'_>) -> Result<(), TransportError>;

    /// A listener joined with a reply address. Sinks that do not route ignore it.
    fn connect(&mut self, _listener: SessionId, _address: SocketAddr) {}

    fn disconnect(&mut self, _listener: &SessionId) {}
}

impl<T: TransportSink + ?Sized> TransportSink for Box<T> {
    fn emit(&mut self, listener: SessionId, frame: &OutboundFrame<'_>) -> Result<(), TransportError> {
        (**self).emit(listener, frame)
    }

    fn connect(&mut self, listener: SessionId, address: SocketAddr) {
        (**self).connect(listener, address)
    }

    fn disconnect(&mut self, listener: &SessionId) {
        (**self).disconnect(listener)
    }
}
