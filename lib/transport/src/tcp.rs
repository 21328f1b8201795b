// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP access to network probes (ctxLink).

use std::io::{ErrorKind, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket,
};
use std::time::{Duration, Instant};

use crate::{Link, TransportError};

/// The GDB-server port of a network probe.
pub const GDB_PORT: u16 = 2022;

/// UDP port a ctxLink answers discovery datagrams on.
const SCAN_PORT: u16 = 32760;
const SCAN_REPLY_WAIT: Duration = Duration::from_millis(500);

pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpLink {
    /// Connects to the probe's GDB server at `ip` (port 2022 implied when
    /// absent).
    pub fn open(ip: &str) -> Result<Self, TransportError> {
        let spec = if ip.contains(':') {
            ip.to_string()
        } else {
            format!("{}:{}", ip, GDB_PORT)
        };
        let peer = spec
            .to_socket_addrs()
            .ok()
            .and_then(|mut a| a.next())
            .ok_or_else(|| TransportError::InvalidAddress(ip.to_string()))?;

        let stream =
            TcpStream::connect_timeout(&peer, Duration::from_secs(3))
                .map_err(|source| TransportError::Connect {
                    addr: spec.clone(),
                    source,
                })?;
        stream.set_nodelay(true).ok();
        stream.set_nonblocking(true)?;
        log::debug!("connected to probe at {}", peer);
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Link for TcpLink {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.stream.write_all(data)?;
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn pending(&self) -> usize {
        let mut probe = [0u8; 4096];
        self.stream.peek(&mut probe).unwrap_or(0)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(self.stream.flush()?)
    }
}

/// Local IPv4 address of the interface the OS would route broadcasts out
/// of. Best effort; `None` when the host has no usable interface.
pub fn local_ip() -> Option<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    // Connecting a UDP socket performs no traffic; it only fixes the
    // source address.
    sock.connect("8.8.8.8:53").ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

/// Broadcasts a discovery datagram and collects the addresses of probes
/// that answer, at most `max` of them.
pub fn scan_network(max: usize) -> Result<Vec<Ipv4Addr>, TransportError> {
    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.set_broadcast(true)?;
    sock.set_read_timeout(Some(Duration::from_millis(50)))?;

    sock.send_to(
        b"ctxLink?",
        (Ipv4Addr::BROADCAST, SCAN_PORT),
    )?;

    let mut found = Vec::new();
    let mut buf = [0u8; 64];
    let deadline = Instant::now() + SCAN_REPLY_WAIT;
    while found.len() < max && Instant::now() < deadline {
        match sock.recv_from(&mut buf) {
            Ok((_, SocketAddr::V4(peer))) => {
                let ip = *peer.ip();
                if !found.contains(&ip) {
                    log::debug!("probe answered from {}", ip);
                    found.push(ip);
                }
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(found)
}
