//! Host port allocation for ADB forwarding.
//!
//! Ports cannot be reserved for QEMU atomically. A port counts as free if a
//! connect to it is refused right now; another allocator (or anything else on
//! the host) may take it before QEMU binds it. That race is accepted: losing
//! it shows up later as a bounded timeout waiting for adbd, not as a crash.

use std::net::TcpStream;

use tracing::debug;

use crate::config::ADB_BASE_PORT;
use crate::error::{Error, Result};

/// ADB uses ports in pairs: console, then control.
pub const ADB_PORT_WIDTH: u16 = 2;

/// Host ports believed free when they were probed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    ports: Vec<u16>,
}

impl PortLease {
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Console port; the emulator serial is `emulator-<console>`.
    pub fn console(&self) -> u16 {
        self.ports[0]
    }

    /// Port adbd is reachable on.
    pub fn adb(&self) -> u16 {
        self.ports[self.ports.len() - 1]
    }

    /// QEMU user-net forwarding: the n-th host port maps to guest port 5554 + n.
    pub fn forwarding_args(&self) -> Vec<String> {
        let forwards: Vec<String> = self
            .ports
            .iter()
            .zip(ADB_BASE_PORT..)
            .map(|(host, guest)| format!("hostfwd=tcp::{}-:{}", host, guest))
            .collect();
        vec![
            "-device".into(),
            "virtio-net,netdev=adbnet0".into(),
            "-netdev".into(),
            format!("user,id=adbnet0,{}", forwards.join(",")),
        ]
    }
}

/// True if something accepts connections on `localhost:<port>`.
pub fn port_accepts(port: u16) -> bool {
    TcpStream::connect(("localhost", port)).is_ok()
}

#[derive(Debug, Clone)]
pub struct PortBroker {
    base: u16,
}

impl PortBroker {
    pub fn new(base: u16) -> Self {
        Self { base }
    }

    /// Find `count` consecutive free ports at or above the base.
    ///
    /// Candidates are scanned a whole block at a time; if any port in a block
    /// is taken the scan moves past the entire block, which keeps concurrent
    /// allocators from colliding slot by slot.
    pub fn allocate(&self, count: u16) -> Result<PortLease> {
        if count == 0 {
            return Err(Error::Generic("cannot allocate zero ports".into()));
        }
        let mut min_port = u32::from(self.base);
        let step = u32::from(count);
        while min_port + step - 1 <= u32::from(u16::MAX) {
            let block = (min_port..min_port + step).map(|p| p as u16);
            let taken = block.clone().find(|&p| port_accepts(p));
            match taken {
                None => {
                    let ports: Vec<u16> = block.collect();
                    debug!(?ports, "allocated host ports");
                    return Ok(PortLease { ports });
                }
                Some(port) => debug!(port, "port in use, skipping block"),
            }
            min_port += step;
        }
        Err(Error::Generic(format!(
            "no block of {} free ports at or above {}",
            count, self.base
        )))
    }
}

impl Default for PortBroker {
    fn default() -> Self {
        Self::new(ADB_BASE_PORT)
    }
}
