use log::{debug, info};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};

use super::{OutboundFrame, TransportError, TransportSink};
use crate::app::session::SessionId;

/// Sends each listener's frames as one bincode-encoded datagram to the address
/// registered for that listener.
pub struct UdpTransport {
    socket: UdpSocket,
    routes: HashMap<SessionId, SocketAddr>,
    buffer: Vec<u8>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        // the mixing thread must never wait on the kernel
        socket.set_nonblocking(true)?;
        info!("Mix transport bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            routes: HashMap::new(),
            buffer: Vec::with_capacity(1100),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn register(&mut self, listener: SessionId, addr: SocketAddr) {
        debug!("Routing mixes for {} to {}", listener, addr);
        self.routes.insert(listener, addr);
    }

    pub fn unregister(&mut self, listener: &SessionId) -> Option<SocketAddr> {
        self.routes.remove(listener)
    }
}

impl TransportSink for UdpTransport {
    fn emit(&mut self, listener: SessionId, frame: &OutboundFrame<'_>) -> Result<(), TransportError> {
        let addr = *self
            .routes
            .get(&listener)
            .ok_or(TransportError::UnknownListener(listener))?;

        self.buffer.clear();
        bincode::serialize_into(&mut self.buffer, frame)?;
        self.socket.send_to(&self.buffer, addr)?;
        Ok(())
    }

    fn connect(&mut self, listener: SessionId, address: SocketAddr) {
        self.register(listener, address);
    }

    fn disconnect(&mut self, listener: &SessionId) {
        if self.unregister(listener).is_some() {
            debug!("Stopped routing mixes for {}", listener);
        }
    }
}
