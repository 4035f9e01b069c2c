// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The E1.31 UDP receive socket.
//!
//! One socket bound to port 5568 serves every subscribed universe; the
//! per-universe multicast groups are joined and left as subscriptions come
//! and go. The socket registers with the main loop and drains itself into
//! the inflator on readability.

use super::inflator::DmpE131Inflator;
use crate::runtime::LoopHandle;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

/// The sACN port.
pub const E131_PORT: u16 = 5568;

/// Largest packet we expect on the wire; anything bigger is dropped by
/// the recv.
const MAX_PACKET_SIZE: usize = 1500;

/// The multicast group carrying a universe: 239.255.<hi>.<lo>.
pub fn universe_multicast_group(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

/// Receives E1.31 packets and feeds the inflator.
pub struct E131Receiver {
    socket: Rc<UdpSocket>,
    inflator: Rc<RefCell<DmpE131Inflator>>,
}

impl E131Receiver {
    /// Bind the receive socket (reuse-addr, nonblocking, 0.0.0.0:5568).
    pub fn new(inflator: Rc<RefCell<DmpE131Inflator>>) -> crate::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| crate::Error::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| crate::Error::BindFailed(e.to_string()))?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, E131_PORT);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| crate::Error::BindFailed(format!("{}: {}", bind_addr, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| crate::Error::BindFailed(e.to_string()))?;

        let socket: UdpSocket = socket.into();
        log::debug!("[E131] bound receive socket on {}", bind_addr);
        Ok(E131Receiver {
            socket: Rc::new(socket),
            inflator,
        })
    }

    /// Join the multicast group for a universe.
    pub fn join_universe(&self, universe: u16) -> crate::Result<()> {
        let group = universe_multicast_group(universe);
        self.socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| crate::Error::MulticastJoinFailed(format!("{}: {}", group, e)))?;
        log::debug!("[E131] joined {} for universe {}", group, universe);
        Ok(())
    }

    /// Leave the multicast group for a universe.
    pub fn leave_universe(&self, universe: u16) -> crate::Result<()> {
        let group = universe_multicast_group(universe);
        self.socket
            .leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| crate::Error::MulticastJoinFailed(format!("{}: {}", group, e)))?;
        Ok(())
    }

    /// Register with the main loop; from here on packets flow into the
    /// inflator as they arrive.
    pub fn register(&self, handle: &LoopHandle) {
        let socket = self.socket.clone();
        let inflator = self.inflator.clone();
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        handle.add_read_descriptor(self.socket.as_raw_fd(), move || loop {
            match socket.recv_from(&mut buffer) {
                Ok((length, _peer)) => {
                    inflator.borrow_mut().handle_packet(&buffer[..length]);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[E131] recv error: {}", e);
                    break;
                }
            }
        });
    }

    /// Deregister from the main loop.
    pub fn deregister(&self, handle: &LoopHandle) {
        handle.remove_read_descriptor(self.socket.as_raw_fd());
    }
}
