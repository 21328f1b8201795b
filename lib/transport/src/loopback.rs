// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory byte pipe.
//!
//! The test suites talk to a scripted `LoopbackLink` instead of a real
//! probe: bytes queued with [`LoopbackLink::feed`] come back out of
//! [`Link::recv`], and everything the code under test transmits is captured
//! for inspection.

use std::collections::VecDeque;

use crate::{Link, TransportError};

#[derive(Default)]
pub struct LoopbackLink {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes for the next `recv` calls, as if the probe had sent
    /// them.
    pub fn feed(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Takes everything transmitted so far.
    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Peeks at the transmit capture without consuming it.
    pub fn tx(&self) -> &[u8] {
        &self.tx
    }
}

impl Link for LoopbackLink {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.tx.extend_from_slice(data);
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn pending(&self) -> usize {
        self.rx.len()
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_then_recv() {
        let mut link = LoopbackLink::new();
        link.feed(b"abc");
        let mut buf = [0u8; 2];
        assert_eq!(link.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(link.pending(), 1);
    }

    #[test]
    fn send_is_captured() {
        let mut link = LoopbackLink::new();
        link.send(b"$x#aa").unwrap();
        assert_eq!(link.take_tx(), b"$x#aa");
        assert!(link.tx().is_empty());
    }
}
