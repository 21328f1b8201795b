// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte pipes to a Black Magic Probe.
//!
//! A probe shows up either as a USB CDC-ACM device (a plain serial port) or,
//! for ctxLink, as a TCP server on the network. Everything above this crate
//! only cares about moving bytes, so both are wrapped in the [`Transport`]
//! enum, which is the single dispatch point between the protocol layers and
//! the operating system.
//!
//! Reads never block: [`Link::recv`] returns whatever is buffered, possibly
//! nothing. All waiting is done by the callers, which poll in 50 ms steps.

mod loopback;
mod serial;
mod tcp;

pub use loopback::LoopbackLink;
pub use serial::{
    collect_ports, find_probes, LineCode, LineStatus, ProbeInfo, SerialLink,
};
pub use tcp::{local_ip, scan_network, TcpLink};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot open port {name}: {source}")]
    PortAccess {
        name: String,
        #[source]
        source: serialport::Error,
    },
    #[error("transport is not open")]
    NotOpen,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial line control failed: {0}")]
    LineControl(#[from] serialport::Error),
}

/// The one seam the protocol layers see: a non-blocking byte pipe.
pub trait Link {
    /// Writes as much of `data` as the pipe accepts, returning the count.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Reads whatever is buffered into `buf`. Returns `Ok(0)` immediately
    /// when nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Number of bytes that `recv` would return without blocking.
    fn pending(&self) -> usize;

    fn flush(&mut self) -> Result<(), TransportError>;
}

/// A possibly-open connection to a probe.
///
/// `Closed` stands in for "no probe selected"; every operation on it fails
/// with [`TransportError::NotOpen`] rather than touching a stale handle.
pub enum Transport {
    Serial(SerialLink),
    Tcp(TcpLink),
    Loopback(LoopbackLink),
    Closed,
}

impl Transport {
    pub fn is_open(&self) -> bool {
        !matches!(self, Transport::Closed)
    }

    /// Drops the underlying handle, releasing the port or socket.
    pub fn close(&mut self) {
        *self = Transport::Closed;
    }

    fn link(&mut self) -> Result<&mut dyn Link, TransportError> {
        match self {
            Transport::Serial(s) => Ok(s),
            Transport::Tcp(t) => Ok(t),
            Transport::Loopback(l) => Ok(l),
            Transport::Closed => Err(TransportError::NotOpen),
        }
    }
}

impl Link for Transport {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.link()?.send(data)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.link()?.recv(buf)
    }

    fn pending(&self) -> usize {
        match self {
            Transport::Serial(s) => s.pending(),
            Transport::Tcp(t) => t.pending(),
            Transport::Loopback(l) => l.pending(),
            Transport::Closed => 0,
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.link()?.flush()
    }
}
