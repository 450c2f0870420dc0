use tokio::sync::mpsc::{self, error::TrySendError};

use super::{MixPacket, OutboundFrame, TransportError, TransportSink};
use crate::app::session::SessionId;

/// A frame handed to an in-process consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub listener: SessionId,
    pub packet: MixPacket,
}

/// Forwards frames over a bounded tokio channel. A slow consumer loses frames
/// instead of stalling the mixer.
pub struct ChannelTransport {
    sender: mpsc::Sender<Delivery>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl TransportSink for ChannelTransport {
    fn emit(&mut self, listener: SessionId, frame: &OutboundFrame<'_>) -> Result<(), TransportError> {
        let delivery = Delivery {
            listener,
            packet: frame.to_packet(),
        };

        self.sender.try_send(delivery).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull(listener),
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent(sequence: u16) -> OutboundFrame<'static> {
        OutboundFrame::Silent {
            sequence,
            sample_count: 512,
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (mut transport, mut receiver) = ChannelTransport::new(4);
        let listener = SessionId::new();

        transport.emit(listener, &silent(1)).unwrap();
        transport.emit(listener, &silent(2)).unwrap();

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.listener, listener);
        assert_eq!(first.packet.sequence(), 1);
        assert_eq!(receiver.recv().await.unwrap().packet.sequence(), 2);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (mut transport, _receiver) = ChannelTransport::new(1);
        let listener = SessionId::new();

        assert!(transport.emit(listener, &silent(1)).is_ok());
        assert!(matches!(
            transport.emit(listener, &silent(2)),
            Err(TransportError::QueueFull(id)) if id == listener
        ));
    }

    #[test]
    fn closed_receiver_is_reported() {
        let (mut transport, receiver) = ChannelTransport::new(1);
        drop(receiver);
        assert!(matches!(
            transport.emit(SessionId::new(), &silent(1)),
            Err(TransportError::Closed)
        ));
    }
}
