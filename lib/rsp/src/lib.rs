// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// GDB Remote Serial Protocol framing, host side.
//
// Everything the probe says arrives as packets of the form
//
//     $ <payload> # <cc>
//
// where <cc> is the two-hex-digit modulo-256 sum of the raw payload
// bytes, before escaping: escaping a payload never changes its checksum,
// so the receiver sums the payload after undoing the escapes. Binary
// payload bytes that collide with the framing characters ('$', '#', '}')
// are sent as '}' followed by the byte XORed with 0x20. The receiver
// answers every packet with a single '+' (checksum good) or '-'
// (checksum bad, please retransmit).
//
// Two payload families need special treatment:
//
// - 'qRcmd,<cmd>' and 'vRun;<args>' carry their argument hex-encoded, two
//   nibbles per byte, so the transmit path encodes everything after the
//   prefix instead of escaping it.
//
// - A reply whose payload is 'O' followed by hex digits is console output
//   from the probe or target, streamed in the middle of a request/reply
//   exchange. The decoder returns it with the lead byte rewritten to a
//   lowercase 'o' so that a final 'OK' reply can never be mistaken for
//   console output ('K' is not a hex digit, so a real 'OK' is left alone).
//
// The receive side keeps a cache of raw wire bytes across calls, because a
// single read may deliver half a packet, or one and a half. The cache is
// bounded by the packet size negotiated in qSupported; the session layer
// pushes that bound in here once it knows it.

use std::time::Duration;

use bmlink_transport::{Link, TransportError};
use thiserror::Error;

mod hex;

pub use hex::{hex_to_bytes, bytes_to_hex};

/// Poll step for all timed waits, per the probe's own pacing.
const POLL_MS: u64 = 50;

/// How long to wait for a '+' after transmitting, per attempt.
const ACK_TIMEOUT_MS: u64 = 500;

/// Transmit attempts before giving up on a packet.
const XMIT_ATTEMPTS: u32 = 3;

/// Receive-cache bound before the session negotiates a real packet size.
pub const DEFAULT_PACKET_SIZE: usize = 256;

/// The asynchronous interrupt byte. Sent bare, outside any packet.
pub const BREAK_BYTE: u8 = 0x03;

#[derive(Debug, Error)]
pub enum RspError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no acknowledgement after {XMIT_ATTEMPTS} attempts")]
    NoAck,
    #[error("receive cache overflow ({0} bytes without a complete packet)")]
    Overflow(usize),
}

pub struct Codec {
    cache: Vec<u8>,
    limit: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            cache: Vec::new(),
            limit: DEFAULT_PACKET_SIZE,
        }
    }

    /// Rebounds the receive cache. Contents survive a grow; `0` drops the
    /// cache entirely (done at disconnect).
    pub fn set_packet_size(&mut self, size: usize) {
        if size == 0 {
            self.cache = Vec::new();
            self.limit = 0;
        } else {
            if size > self.limit {
                self.cache.reserve(size - self.cache.len());
            }
            self.limit = size;
        }
    }

    pub fn packet_size(&self) -> usize {
        self.limit
    }

    /// Discards any buffered wire bytes.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Receives one packet payload, already unescaped and with O-records
    /// decoded. Returns `Ok(None)` when `timeout_ms` elapses first.
    ///
    /// Every accepted frame is ACKed with '+' exactly once; every frame
    /// that fails its checksum is NAKed with '-' and dropped.
    pub fn recv(
        &mut self,
        link: &mut dyn Link,
        timeout_ms: u32,
    ) -> Result<Option<Vec<u8>>, RspError> {
        let mut polls = (timeout_ms as u64).div_ceil(POLL_MS);
        loop {
            self.pull(link)?;
            if let Some(payload) = self.take_frame(link)? {
                return Ok(Some(payload));
            }
            if polls == 0 {
                return Ok(None);
            }
            polls -= 1;
            std::thread::sleep(Duration::from_millis(POLL_MS));
        }
    }

    /// Transmits `payload` as one framed packet and waits for the ACK,
    /// retransmitting on NAK.
    pub fn xmit(
        &mut self,
        link: &mut dyn Link,
        payload: &[u8],
    ) -> Result<(), RspError> {
        let frame = frame_packet(payload);
        for attempt in 0..XMIT_ATTEMPTS {
            if attempt > 0 {
                log::debug!("retransmit (attempt {})", attempt + 1);
            }
            link.send(&frame)?;
            match self.wait_ack(link)? {
                Ack::Ok => return Ok(()),
                Ack::Retransmit => continue,
                Ack::Timeout => return Err(RspError::NoAck),
            }
        }
        Err(RspError::NoAck)
    }

    /// Sends the bare 0x03 interrupt byte. No framing, no reply expected;
    /// the stop reply the probe eventually produces is consumed by the
    /// next `recv` loop that waits for a terminal reply.
    pub fn send_break(
        &mut self,
        link: &mut dyn Link,
    ) -> Result<(), RspError> {
        link.send(&[BREAK_BYTE])?;
        Ok(())
    }

    /// Drains available transport bytes into the cache.
    fn pull(&mut self, link: &mut dyn Link) -> Result<(), RspError> {
        let mut buf = [0u8; 256];
        loop {
            let room = self.limit.saturating_sub(self.cache.len());
            if room == 0 {
                // Nothing resembling a packet in a full cache means the
                // peer is out of sync; there is no way to resynchronize
                // besides reporting it.
                if !self.cache.contains(&b'$') {
                    let n = self.cache.len();
                    self.cache.clear();
                    return Err(RspError::Overflow(n));
                }
                return Ok(());
            }
            let want = room.min(buf.len());
            let got = link.recv(&mut buf[..want])?;
            if got == 0 {
                return Ok(());
            }
            self.cache.extend_from_slice(&buf[..got]);
        }
    }

    /// Extracts the first complete frame from the cache, ACK/NAKing as
    /// appropriate. `Ok(None)` means more wire bytes are needed.
    fn take_frame(
        &mut self,
        link: &mut dyn Link,
    ) -> Result<Option<Vec<u8>>, RspError> {
        loop {
            // Everything before the start-of-packet marker is line noise
            // or a stray ACK from the peer; drop it.
            match self.cache.iter().position(|&b| b == b'$') {
                Some(0) => {}
                Some(start) => {
                    self.cache.drain(..start);
                }
                None => {
                    self.cache.clear();
                    return Ok(None);
                }
            }

            let Some(hash) = self.cache.iter().position(|&b| b == b'#')
            else {
                return Ok(None);
            };
            if self.cache.len() < hash + 3 {
                return Ok(None);
            }

            // The checksum covers the pre-escape payload, so undo the
            // escapes before summing.
            let decoded = unescape(&self.cache[1..hash]);
            let sum = checksum(&decoded);
            let sent = hex::nibble(self.cache[hash + 1])
                .zip(hex::nibble(self.cache[hash + 2]))
                .map(|(hi, lo)| hi << 4 | lo);

            if sent == Some(sum) {
                link.send(b"+")?;
                let payload = match decode_o_record(&decoded) {
                    Some(text) => text,
                    None => decoded,
                };
                self.cache.drain(..hash + 3);
                return Ok(Some(payload));
            }

            log::warn!(
                "checksum mismatch, dropping frame ({} bytes)",
                hash + 3
            );
            link.send(b"-")?;
            self.cache.drain(..hash + 3);
        }
    }

    fn wait_ack(&mut self, link: &mut dyn Link) -> Result<Ack, RspError> {
        let mut polls = ACK_TIMEOUT_MS.div_ceil(POLL_MS);
        loop {
            let mut byte = [0u8; 1];
            while link.recv(&mut byte)? == 1 {
                match byte[0] {
                    b'+' => return Ok(Ack::Ok),
                    b'-' => return Ok(Ack::Retransmit),
                    // Anything else here is stale console output between
                    // our packet and its ACK; skip it.
                    _ => {}
                }
            }
            if polls == 0 {
                return Ok(Ack::Timeout);
            }
            polls -= 1;
            std::thread::sleep(Duration::from_millis(POLL_MS));
        }
    }
}

enum Ack {
    Ok,
    Retransmit,
    Timeout,
}

/// Builds the on-wire form of `payload`: encoding, framing, checksum.
/// The checksum sums the pre-escape payload bytes, so it is invariant
/// under escaping.
pub fn frame_packet(payload: &[u8]) -> Vec<u8> {
    let (encoded, sum) = encode_payload(payload);
    let mut frame = Vec::with_capacity(encoded.len() + 5);
    frame.push(b'$');
    frame.extend_from_slice(&encoded);
    frame.push(b'#');
    frame.extend_from_slice(&hex::byte(sum));
    frame
}

/// 'qRcmd,' and 'vRun;' arguments travel hex-encoded; everything else is
/// escaped binary. Returns the wire form plus the frame checksum: the
/// hex forms contain nothing escapable, so their checksum covers the
/// encoding itself, while escaped payloads are summed pre-escape.
fn encode_payload(payload: &[u8]) -> (Vec<u8>, u8) {
    for prefix in [&b"qRcmd,"[..], &b"vRun;"[..]] {
        if payload.starts_with(prefix) {
            let mut out = prefix.to_vec();
            out.extend_from_slice(&bytes_to_hex(&payload[prefix.len()..]));
            let sum = checksum(&out);
            return (out, sum);
        }
    }
    (escape(payload), checksum(payload))
}

/// Modulo-256 sum of the raw payload bytes.
fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |a, &b| a.wrapping_add(b))
}

/// Escapes '$', '#' and '}' for transmission inside a packet.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if matches!(b, b'$' | b'#' | b'}') {
            out.push(b'}');
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

/// Number of extra bytes [`escape`] would add. The flash pipeline uses
/// this to keep write blocks inside the negotiated packet size.
pub fn escape_overhead(data: &[u8]) -> usize {
    data.iter().filter(|b| matches!(b, b'$' | b'#' | b'}')).count()
}

/// Reverses [`escape`]: a '}' means "XOR the next byte with 0x20".
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == b'}' {
            match iter.next() {
                Some(&next) => out.push(next ^ 0x20),
                // A trailing escape is a truncated frame; keep the byte
                // so nothing is silently lost.
                None => out.push(b),
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Decodes a console-output record: 'O' followed by at least two hex
/// digits. Returns the text with a lowercase 'o' sentinel prepended, or
/// `None` when `payload` is not an O-record (notably the terminal 'OK').
fn decode_o_record(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 3 || payload[0] != b'O' {
        return None;
    }
    if hex::nibble(payload[1]).is_none() || hex::nibble(payload[2]).is_none()
    {
        return None;
    }
    let mut out = vec![b'o'];
    let mut pairs = payload[1..].chunks_exact(2);
    for pair in &mut pairs {
        match hex::nibble(pair[0]).zip(hex::nibble(pair[1])) {
            Some((hi, lo)) => out.push(hi << 4 | lo),
            None => break,
        }
    }
    Some(out)
}
