// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The probe session: one connected Black Magic Probe, one target.
//!
//! A [`Session`] owns the transport, the RSP codec and its receive cache,
//! the target's flash-region list, the cached `monitor` command list and
//! the progress counters. There is no global state: the host creates a
//! session, drives it, and drops it. All reporting funnels through the
//! status callback installed with [`Session::set_status_handler`]; the
//! session never prints.
//!
//! The protocol conversation is strictly in order: one request, zero or
//! more streamed O-records, one terminal `OK`/`E xx`/stop reply. Helpers
//! here loop over the non-terminal packets so each public operation reads
//! as a single exchange.

mod flash;
mod memmap;
mod output;
mod status;
mod trace;

pub use memmap::FlashRegion;
pub use status::{Status, StatusHandler};

use std::time::Duration;

use bmlink_rsp::{Codec, RspError};
use bmlink_script::{TargetMem, TargetMemError};
use bmlink_transport::{
    find_probes, LineCode, SerialLink, TcpLink, Transport, TransportError,
};
use output::OutputGather;
use thiserror::Error;

/// Baud rate of the probe's CDC-ACM GDB interface. The USB link ignores
/// it, but the port still has to be configured with something.
const PROBE_BAUD: u32 = 115_200;

/// Serial handshake wait after asserting the modem lines.
const HANDSHAKE_MS: u32 = 250;

/// Ordinary request/reply wait.
const REPLY_MS: u32 = 1000;

/// Target scans and monitor commands stream output and take longer.
const MONITOR_MS: u32 = 3000;

/// Flash erase can stall the probe for seconds on large sectors.
const ERASE_MS: u32 = 5000;

/// Flash write and target memory access.
const MEM_MS: u32 = 3000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rsp(#[from] RspError),
    #[error("no probe at index {0}")]
    NoProbe(usize),
    #[error("probe did not respond")]
    NoResponse,
    #[error("not connected to a probe")]
    NotConnected,
    #[error("could not enter extended-remote mode")]
    NoConnect,
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("monitor command {0:?} failed")]
    Monitor(String),
    #[error("target advertises no flash regions")]
    NoFlash,
    #[error("nothing to program: image is empty")]
    EmptyImage,
    #[error("image data at {addr:#010x} lies outside every flash region")]
    OutsideFlash { addr: u32 },
    #[error("packet size {0} leaves no room for flash writes")]
    PacketTooSmall(usize),
    #[error("{op} rejected by probe: {reply:?}")]
    Rejected { op: &'static str, reply: String },
    #[error("flash erase failed at {addr:#010x}")]
    EraseFailed { addr: u32 },
    #[error("flash write failed at {addr:#010x}")]
    WriteFailed { addr: u32 },
    #[error("flash commit failed")]
    DoneFailed,
    #[error(
        "CRC mismatch at {addr:#010x}: host {host:#010x}, target {target:#010x}"
    )]
    CrcMismatch { addr: u32, host: u32, target: u32 },
    #[error("SWO trace setup failed")]
    TraceFailed,
    #[error("file I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    fn status(&self) -> Status {
        use SessionError::*;
        match self {
            Transport(TransportError::PortAccess { .. }) => Status::PortAccess,
            Transport(_) => Status::NoConnect,
            Rsp(RspError::NoAck) => Status::NoResponse,
            Rsp(RspError::Overflow(_)) => Status::AllocFailed,
            Rsp(_) => Status::General,
            NoProbe(_) => Status::NoDetect,
            NoResponse => Status::NoResponse,
            NotConnected | NoConnect => Status::NoConnect,
            AttachFailed(_) => Status::AttachFailed,
            Monitor(_) => Status::MonitorFailed,
            NoFlash => Status::NoFlash,
            EmptyImage | OutsideFlash { .. } => Status::General,
            PacketTooSmall(_) => Status::AllocFailed,
            Rejected { .. } => Status::General,
            EraseFailed { .. } => Status::EraseFailed,
            WriteFailed { .. } => Status::WriteFailed,
            DoneFailed => Status::DoneFailed,
            CrcMismatch { .. } => Status::CrcMismatch,
            TraceFailed => Status::General,
            Io(_) => Status::FileIo,
        }
    }
}

/// What a probe identifies itself as in `monitor version`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProbeKind {
    BlackMagicProbe,
    CtxLink,
    Unknown,
}

/// The attached target, as reported by the scan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetInfo {
    /// MCU family name, e.g. `STM32F4xx`; selects configuration scripts.
    pub driver: String,
    /// Architecture tag split off the scan line, e.g. `M4`.
    pub arch: String,
}

/// The outcome of one terminal-reply exchange: the streamed console
/// lines, and whether the final reply was `OK`.
struct Reply {
    ok: bool,
    lines: Vec<String>,
}

#[derive(Default)]
struct Progress {
    step: u32,
    range: u32,
}

pub struct Session {
    transport: Transport,
    codec: Codec,
    packet_size: usize,
    regions: Vec<FlashRegion>,
    monitor_cmds: Option<String>,
    target: Option<TargetInfo>,
    progress: Progress,
    handler: Option<StatusHandler>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            transport: Transport::Closed,
            codec: Codec::new(),
            packet_size: bmlink_rsp::DEFAULT_PACKET_SIZE,
            regions: Vec::new(),
            monitor_cmds: None,
            target: None,
            progress: Progress::default(),
            handler: None,
        }
    }

    /// Installs the host's status callback. All notices, streamed probe
    /// output and error reports are delivered through it.
    pub fn set_status_handler(&mut self, handler: StatusHandler) {
        self.handler = Some(handler);
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn regions(&self) -> &[FlashRegion] {
        &self.regions
    }

    pub fn target(&self) -> Option<&TargetInfo> {
        self.target.as_ref()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Connects to a probe: the `probe_index`-th USB probe, or, when `ip`
    /// is given, the network probe at that address. An existing
    /// connection is torn down first.
    pub fn connect(
        &mut self,
        probe_index: usize,
        ip: Option<&str>,
    ) -> Result<(), SessionError> {
        if self.transport.is_open() {
            self.disconnect();
        }
        match ip.filter(|ip| !ip.is_empty()) {
            Some(ip) => {
                let link = TcpLink::open(ip).map_err(|e| self.fail(e.into()))?;
                self.begin(Transport::Tcp(link), false)
            }
            None => {
                let link = self
                    .open_probe(probe_index)
                    .map_err(|e| self.fail(e))?;
                self.begin(Transport::Serial(link), true)
            }
        }
    }

    /// Runs the session handshake over an already-open transport. Used
    /// directly by the test suites; `connect` is the production path.
    pub fn connect_transport(
        &mut self,
        transport: Transport,
    ) -> Result<(), SessionError> {
        self.begin(transport, false)
    }

    fn open_probe(&mut self, index: usize) -> Result<SerialLink, SessionError> {
        let probes = find_probes();
        let probe =
            probes.get(index).ok_or(SessionError::NoProbe(index))?;
        let mut link = SerialLink::open(&probe.port, PROBE_BAUD)?;
        link.set_line(LineCode::Rts, true)?;
        link.set_line(LineCode::Dtr, true)?;
        // Some probe revisions only start talking once DTR has seen an
        // edge; give the quiet ones a second chance.
        if !await_input(&mut link, HANDSHAKE_MS) {
            link.set_line(LineCode::Dtr, false)?;
            link.set_line(LineCode::Dtr, true)?;
            await_input(&mut link, HANDSHAKE_MS);
        }
        Ok(link)
    }

    fn begin(
        &mut self,
        transport: Transport,
        check_version: bool,
    ) -> Result<(), SessionError> {
        self.transport = transport;
        self.codec = Codec::new();
        if let Err(e) = self.handshake(check_version) {
            // No half-open sessions: a failed handshake releases the
            // port so the next attempt starts clean.
            self.transport.close();
            self.codec.set_packet_size(0);
            return Err(self.fail(e));
        }
        self.notify(Status::Success, "probe connected");
        Ok(())
    }

    fn handshake(&mut self, check_version: bool) -> Result<(), SessionError> {
        if check_version {
            let reply = self.exchange(b"qRcmd,version", REPLY_MS)?;
            if !reply.ok {
                return Err(SessionError::NoResponse);
            }
        }

        self.xmit(b"qSupported:multiprocess+")?;
        let reply = self
            .recv(REPLY_MS)?
            .ok_or(SessionError::NoResponse)?;
        let features = String::from_utf8_lossy(&reply);
        match features
            .split(';')
            .find_map(|f| f.strip_prefix("PacketSize="))
            .and_then(|v| usize::from_str_radix(v, 16).ok())
        {
            Some(size) => {
                self.packet_size = size;
                // Headroom for the frame characters around a full
                // payload.
                self.codec.set_packet_size(size + 16);
            }
            None => {
                log::warn!("no PacketSize in qSupported reply; keeping default");
            }
        }

        for _ in 0..3 {
            self.xmit(b"!")?;
            if let Some(reply) = self.recv(REPLY_MS)? {
                if reply == b"OK" {
                    return Ok(());
                }
            }
        }
        Err(SessionError::NoConnect)
    }

    /// Scans for a target and attaches to it. With `autopower`, a dead
    /// voltage reading turns on the probe's target-power switch and
    /// rescans once. On success the target's memory map is fetched and
    /// the flash-region list rebuilt.
    pub fn attach(
        &mut self,
        autopower: bool,
    ) -> Result<TargetInfo, SessionError> {
        self.attach_inner(autopower).map_err(|e| self.fail(e))
    }

    fn attach_inner(
        &mut self,
        autopower: bool,
    ) -> Result<TargetInfo, SessionError> {
        self.require_open()?;

        let mut scan = self.scan_targets()?;
        if autopower {
            let voltage = scan.lines.iter().find_map(|l| parse_voltage(l));
            if voltage.is_some_and(|v| v < 0.1) {
                self.notify(
                    Status::Notice,
                    "no target voltage, enabling probe power",
                );
                self.monitor("tpwr enable")?;
                std::thread::sleep(Duration::from_millis(100));
                scan = self.scan_targets()?;
            }
        }

        let target = scan
            .lines
            .iter()
            .find_map(|l| parse_target_line(l))
            .ok_or_else(|| {
                SessionError::AttachFailed("no target found".into())
            })?;

        self.xmit(b"vAttach;1")?;
        loop {
            let reply = self
                .recv(MONITOR_MS)?
                .ok_or(SessionError::NoResponse)?;
            if reply.starts_with(b"o") {
                continue;
            }
            // A stop reply is as good as OK: the target halted for us.
            if reply == b"OK"
                || reply.starts_with(b"S")
                || reply.starts_with(b"T")
            {
                break;
            }
            return Err(SessionError::AttachFailed(
                String::from_utf8_lossy(&reply).into_owned(),
            ));
        }

        let xml = self.read_memory_map()?;
        self.regions = memmap::parse_memory_map(&xml);
        if self.regions.is_empty() {
            self.notify(Status::Notice, "target advertises no flash regions");
        }
        self.target = Some(target.clone());
        self.notify(
            Status::Success,
            &format!("attached to {} {}", target.driver, target.arch),
        );
        Ok(target)
    }

    fn scan_targets(&mut self) -> Result<Reply, SessionError> {
        let reply = self.exchange(b"qRcmd,swdp_scan", MONITOR_MS)?;
        for line in &reply.lines {
            self.notify(Status::Notice, line);
        }
        Ok(reply)
    }

    fn read_memory_map(&mut self) -> Result<String, SessionError> {
        let mut xml = String::new();
        let chunk = self.packet_size.saturating_sub(16).max(128);
        let mut offset = 0usize;
        loop {
            let cmd =
                format!("qXfer:memory-map:read::{:x},{:x}", offset, chunk);
            self.xmit(cmd.as_bytes())?;
            let reply = loop {
                let p = self
                    .recv(REPLY_MS)?
                    .ok_or(SessionError::NoResponse)?;
                if !p.starts_with(b"o") {
                    break p;
                }
            };
            match reply.split_first() {
                Some((b'm', data)) => {
                    // An empty continuation would loop forever; treat it
                    // as end-of-document.
                    if data.is_empty() {
                        return Ok(xml);
                    }
                    offset += data.len();
                    xml.push_str(&String::from_utf8_lossy(data));
                }
                Some((b'l', data)) => {
                    xml.push_str(&String::from_utf8_lossy(data));
                    return Ok(xml);
                }
                _ => {
                    return Err(SessionError::Rejected {
                        op: "memory-map read",
                        reply: String::from_utf8_lossy(&reply).into_owned(),
                    });
                }
            }
        }
    }

    /// Detaches from the target, optionally dropping its power, and
    /// forgets the memory map.
    pub fn detach(&mut self, power_down: bool) -> Result<(), SessionError> {
        let result: Result<(), SessionError> = (|| {
            self.require_open()?;
            self.xmit(b"D")?;
            let _ = self.recv(REPLY_MS)?;
            if power_down {
                self.monitor("tpwr disable")?;
            }
            Ok(())
        })();
        self.regions.clear();
        self.target = None;
        result.map_err(|e| self.fail(e))
    }

    /// Closes the transport and frees the codec's receive cache.
    pub fn disconnect(&mut self) {
        if self.transport.is_open() {
            log::debug!("disconnecting");
        }
        self.transport.close();
        self.codec.set_packet_size(0);
        self.regions.clear();
        self.monitor_cmds = None;
        self.target = None;
    }

    /// Runs a `monitor` command, surfacing its console output on the
    /// status bus. `Ok(true)` when the probe answered `OK`.
    pub fn monitor(&mut self, cmd: &str) -> Result<bool, SessionError> {
        let payload = format!("qRcmd,{}", cmd).into_bytes();
        let reply = self
            .exchange(&payload, MONITOR_MS)
            .map_err(|e| self.fail(e))?;
        for line in &reply.lines {
            self.notify(Status::Notice, line);
        }
        if !reply.ok {
            self.notify(
                Status::MonitorFailed,
                &format!("monitor command {:?} failed", cmd),
            );
        }
        Ok(reply.ok)
    }

    /// The probe's `monitor` command names, sorted and space-separated.
    /// Fetched once per connection and cached.
    pub fn monitor_commands(&mut self) -> Result<String, SessionError> {
        if let Some(cached) = &self.monitor_cmds {
            return Ok(cached.clone());
        }
        let reply = self
            .exchange(b"qRcmd,help", MONITOR_MS)
            .map_err(|e| self.fail(e))?;
        if !reply.ok {
            return Err(self.fail(SessionError::Monitor("help".into())));
        }
        let mut names: Vec<&str> = reply
            .lines
            .iter()
            .filter(|l| l.contains("--"))
            .filter_map(|l| {
                l.split("--").next().and_then(|s| s.split_whitespace().next())
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        let list = names.join(" ");
        self.monitor_cmds = Some(list.clone());
        Ok(list)
    }

    /// Identifies the probe from its `monitor version` banner.
    pub fn probe_kind(&mut self) -> Result<ProbeKind, SessionError> {
        let reply = self
            .exchange(b"qRcmd,version", MONITOR_MS)
            .map_err(|e| self.fail(e))?;
        for line in &reply.lines {
            // ctxLink builds also carry the upstream firmware banner, so
            // check for the more specific string first.
            if line.contains("ctxLink") {
                return Ok(ProbeKind::CtxLink);
            }
        }
        for line in &reply.lines {
            if line.contains("Black Magic Probe") {
                return Ok(ProbeKind::BlackMagicProbe);
            }
        }
        Ok(ProbeKind::Unknown)
    }

    /// The target's part id, for probe drivers that report one via
    /// `monitor partid`.
    pub fn part_id(&mut self) -> Result<Option<u32>, SessionError> {
        let reply = self
            .exchange(b"qRcmd,partid", MONITOR_MS)
            .map_err(|e| self.fail(e))?;
        for line in &reply.lines {
            let Some(rest) = line.trim_start().strip_prefix("Part ID") else {
                continue;
            };
            let value = rest.trim_start_matches([':', ' ', '\t']);
            let value = value.split_whitespace().next().unwrap_or("");
            let parsed = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .map_or_else(
                    || u32::from_str_radix(value, 16),
                    |hex| u32::from_str_radix(hex, 16),
                );
            if let Ok(id) = parsed {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Sends the bare interrupt byte. No reply is read here; the stop
    /// reply the probe eventually emits is drained by the next exchange.
    pub fn interrupt_target(&mut self) -> Result<(), SessionError> {
        self.require_open()?;
        self.codec.send_break(&mut self.transport)?;
        Ok(())
    }

    /// Interrupts the target and consumes the resulting stop reply.
    pub fn break_target(&mut self) -> Result<(), SessionError> {
        self.interrupt_target()?;
        let _ = self.recv(REPLY_MS)?;
        Ok(())
    }

    /// Restarts the target: `vRun;` then continue.
    pub fn restart(&mut self) -> Result<(), SessionError> {
        self.require_open()?;
        self.xmit(b"vRun;")?;
        let _ = self.recv(REPLY_MS)?;
        self.xmit(b"c")?;
        Ok(())
    }

    /// Reads raw target memory.
    pub fn read_target_mem(
        &mut self,
        addr: u32,
        len: usize,
    ) -> Result<Vec<u8>, SessionError> {
        self.require_open()?;
        let cmd = format!("m{:x},{:x}:", addr, len);
        self.xmit(cmd.as_bytes())?;
        loop {
            let reply = self
                .recv(MEM_MS)?
                .ok_or(SessionError::NoResponse)?;
            if reply.starts_with(b"o") {
                continue;
            }
            if is_error_reply(&reply) {
                return Err(SessionError::Rejected {
                    op: "memory read",
                    reply: String::from_utf8_lossy(&reply).into_owned(),
                });
            }
            return bmlink_rsp::hex_to_bytes(&reply).ok_or(
                SessionError::Rejected {
                    op: "memory read",
                    reply: String::from_utf8_lossy(&reply).into_owned(),
                },
            );
        }
    }

    /// Writes raw target memory with a binary `X` packet.
    pub fn write_target_mem(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.require_open()?;
        let mut cmd = format!("X{:x},{:x}:", addr, data.len()).into_bytes();
        cmd.extend_from_slice(data);
        self.xmit(&cmd)?;
        self.expect_ok("memory write", MEM_MS)
    }

    // Progress reporting. The flash pipeline resets the range before a
    // download and steps it as blocks go out; the host polls `progress`.

    pub fn progress_reset(&mut self, range: u32) {
        self.progress = Progress { step: 0, range };
    }

    pub fn progress_step(&mut self, n: u32) {
        self.progress.step = self.progress.step.saturating_add(n);
    }

    pub fn progress(&self) -> (u32, u32) {
        (self.progress.step, self.progress.range)
    }

    // -- internals ---------------------------------------------------

    fn require_open(&self) -> Result<(), SessionError> {
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    fn xmit(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        self.codec.xmit(&mut self.transport, payload)?;
        Ok(())
    }

    /// One receive step. A transport failure mid-receive poisons the
    /// connection, so the transport is closed before reporting it.
    fn recv(&mut self, timeout_ms: u32) -> Result<Option<Vec<u8>>, SessionError> {
        match self.codec.recv(&mut self.transport, timeout_ms) {
            Ok(reply) => Ok(reply),
            Err(RspError::Transport(e)) => {
                self.transport.close();
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sends a request and reads to its terminal reply, gathering the
    /// console lines streamed in between.
    fn exchange(
        &mut self,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<Reply, SessionError> {
        self.require_open()?;
        self.xmit(payload)?;
        let mut gather = OutputGather::new();
        let ok = loop {
            let Some(reply) = self.recv(timeout_ms)? else {
                return Err(SessionError::NoResponse);
            };
            if gather.push(&reply) {
                continue;
            }
            if reply == b"OK" {
                break true;
            }
            if is_error_reply(&reply) {
                break false;
            }
            // Stop replies and other stray packets (e.g. after an
            // interrupt) are not ours to interpret here.
            log::trace!(
                "ignoring packet {:?} while waiting for terminal reply",
                String::from_utf8_lossy(&reply)
            );
        };
        Ok(Reply { ok, lines: gather.finish() })
    }

    /// Reads to a terminal reply and demands `OK`.
    fn expect_ok(
        &mut self,
        op: &'static str,
        timeout_ms: u32,
    ) -> Result<(), SessionError> {
        loop {
            let reply = self
                .recv(timeout_ms)?
                .ok_or(SessionError::NoResponse)?;
            if reply.starts_with(b"o") {
                continue;
            }
            if reply == b"OK" {
                return Ok(());
            }
            return Err(SessionError::Rejected {
                op,
                reply: String::from_utf8_lossy(&reply).into_owned(),
            });
        }
    }

    fn notify(&mut self, status: Status, msg: &str) {
        if status.is_error() {
            log::warn!("{}", msg);
        } else {
            log::trace!("{}", msg);
        }
        if let Some(handler) = &mut self.handler {
            handler(status, msg);
        }
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.notify(err.status(), &err.to_string());
        err
    }
}

/// Script-engine access to target memory goes through the same `m`/`X`
/// packets as everything else.
impl TargetMem for Session {
    fn read_mem(
        &mut self,
        addr: u32,
        len: usize,
    ) -> Result<Vec<u8>, TargetMemError> {
        self.read_target_mem(addr, len).map_err(Into::into)
    }

    fn write_mem(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), TargetMemError> {
        self.write_target_mem(addr, data).map_err(Into::into)
    }
}

/// `monitor` command lists are space-separated; exact membership test.
pub fn has_command(name: &str, list: &str) -> bool {
    list.split(' ').any(|cmd| cmd == name)
}

/// Expands a unique prefix to the full command name. An exact match wins
/// even when it prefixes other commands; an ambiguous prefix expands to
/// nothing.
pub fn expand_command<'a>(prefix: &str, list: &'a str) -> Option<&'a str> {
    let mut candidate = None;
    for cmd in list.split(' ') {
        if cmd == prefix {
            return Some(cmd);
        }
        if cmd.starts_with(prefix) {
            if candidate.is_some() {
                candidate = Some(None);
            } else {
                candidate = Some(Some(cmd));
            }
        }
    }
    candidate.flatten()
}

fn is_error_reply(reply: &[u8]) -> bool {
    reply.len() == 3
        && reply[0] == b'E'
        && reply[1..].iter().all(u8::is_ascii_hexdigit)
}

fn parse_voltage(line: &str) -> Option<f32> {
    if !line.to_ascii_lowercase().contains("voltage") {
        return None;
    }
    line.split_whitespace()
        .find_map(|tok| tok.trim_end_matches('V').parse::<f32>().ok())
}

/// Parses a scan result line of the form `1: STM32F4xx M4`, splitting
/// the trailing architecture tag off the family name.
fn parse_target_line(line: &str) -> Option<TargetInfo> {
    let line = line.trim();
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = line[digits..].trim_start_matches(':').trim();
    if rest.is_empty() {
        return None;
    }
    let (driver, arch) = match rest.rsplit_once(' ') {
        Some((driver, tag)) if is_arch_tag(tag) => {
            (driver.trim().to_string(), tag.to_string())
        }
        _ => (rest.to_string(), String::new()),
    };
    Some(TargetInfo { driver, arch })
}

/// `M0`, `M0+`, `M3`, `M33`: the Cortex-M tags the probe appends.
fn is_arch_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    chars.next() == Some('M')
        && !tag[1..].is_empty()
        && tag[1..].chars().all(|c| c.is_ascii_digit() || c == '+')
}

fn await_input(link: &mut SerialLink, timeout_ms: u32) -> bool {
    use bmlink_transport::Link;
    let mut waited = 0;
    loop {
        if link.pending() > 0 {
            return true;
        }
        if waited >= timeout_ms {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
        waited += 50;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmlink_rsp::frame_packet;
    use bmlink_transport::LoopbackLink;

    /// Splits a transmit capture into frame payloads, dropping ACKs.
    pub(crate) fn sent_frames(tx: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < tx.len() {
            match tx[pos] {
                b'$' => {
                    let hash = tx[pos..]
                        .iter()
                        .position(|&b| b == b'#')
                        .map(|i| pos + i)
                        .expect("unterminated frame in capture");
                    frames.push(tx[pos + 1..hash].to_vec());
                    pos = hash + 3;
                }
                _ => pos += 1,
            }
        }
        frames
    }

    /// Feeds the ack-then-reply byte sequence a healthy probe produces.
    pub(crate) fn feed_reply(link: &mut LoopbackLink, payload: &[u8]) {
        link.feed(b"+");
        link.feed(&frame_packet(payload));
    }

    /// A session mid-conversation: loopback transport, known packet
    /// size, optional regions. The tests reach the loopback through
    /// `loopback()`.
    pub(crate) fn test_session(
        packet_size: usize,
        regions: &[FlashRegion],
    ) -> Session {
        let mut session = Session::new();
        session.transport = Transport::Loopback(LoopbackLink::new());
        session.packet_size = packet_size;
        session.codec.set_packet_size(packet_size + 16);
        session.regions = regions.to_vec();
        session
    }

    pub(crate) fn loopback(session: &mut Session) -> &mut LoopbackLink {
        match &mut session.transport {
            Transport::Loopback(link) => link,
            _ => panic!("session is not on a loopback transport"),
        }
    }

    #[test]
    fn handshake_timeout_leaves_nothing_open() {
        let mut session = Session::new();
        let result =
            session.connect_transport(Transport::Loopback(LoopbackLink::new()));
        assert!(matches!(
            result,
            Err(SessionError::Rsp(RspError::NoAck))
        ));
        assert!(!session.is_open());
    }

    #[test]
    fn handshake_failure_reports_no_response_status() {
        let mut session = Session::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.set_status_handler(Box::new(move |status, _| {
            sink.lock().unwrap().push(status);
        }));
        let _ = session
            .connect_transport(Transport::Loopback(LoopbackLink::new()));
        assert!(seen.lock().unwrap().contains(&Status::NoResponse));
    }

    #[test]
    fn handshake_negotiates_packet_size() {
        let mut session = Session::new();
        let mut link = LoopbackLink::new();
        feed_reply(&mut link, b"PacketSize=3ff;qXfer:memory-map:read+");
        feed_reply(&mut link, b"OK"); // !
        session
            .connect_transport(Transport::Loopback(link))
            .unwrap();
        assert_eq!(session.packet_size(), 0x3ff);
        assert_eq!(session.codec.packet_size(), 0x3ff + 16);

        let tx = loopback(&mut session).take_tx();
        let frames = sent_frames(&tx);
        assert_eq!(frames[0], b"qSupported:multiprocess+");
        assert_eq!(frames[1], b"!");
    }

    #[test]
    fn extended_mode_is_retried() {
        let mut session = Session::new();
        let mut link = LoopbackLink::new();
        feed_reply(&mut link, b"PacketSize=3ff");
        feed_reply(&mut link, b"E01"); // first ! refused
        feed_reply(&mut link, b"OK");
        session
            .connect_transport(Transport::Loopback(link))
            .unwrap();
        let tx = loopback(&mut session).take_tx();
        let bangs = sent_frames(&tx).iter().filter(|f| f == &b"!").count();
        assert_eq!(bangs, 2);
    }

    #[test]
    fn monitor_streams_output_and_accepts_ok() {
        let mut session = test_session(1024, &[]);
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = lines.clone();
        session.set_status_handler(Box::new(move |status, msg| {
            if status == Status::Notice {
                sink.lock().unwrap().push(msg.to_string());
            }
        }));
        {
            let link = loopback(&mut session);
            feed_reply(link, b"O54504c4c0a"); // "TPLL\n" hex-encoded
            link.feed(b"+");
            link.feed(&frame_packet(b"OK"));
        }
        assert!(session.monitor("tpwr enable").unwrap());
        assert_eq!(lines.lock().unwrap().as_slice(), ["TPLL"]);
        let tx = loopback(&mut session).take_tx();
        // The command itself goes out hex-encoded after the prefix.
        assert!(sent_frames(&tx)[0].starts_with(b"qRcmd,"));
    }

    #[test]
    fn monitor_command_list_is_sorted_and_cached() {
        let mut session = test_session(1024, &[]);
        {
            let link = loopback(&mut session);
            // "tpwr -- target power\n" then "connect_rst -- reset\n"
            feed_reply(
                link,
                &o_record("  tpwr -- control target power\n"),
            );
            feed_reply(
                link,
                &o_record("  connect_rst -- reset on connect\n"),
            );
            link.feed(b"+");
            link.feed(&frame_packet(b"OK"));
        }
        let list = session.monitor_commands().unwrap();
        assert_eq!(list, "connect_rst tpwr");
        // Second call answers from the cache without touching the wire.
        loopback(&mut session).take_tx();
        assert_eq!(session.monitor_commands().unwrap(), list);
        assert!(loopback(&mut session).take_tx().is_empty());
    }

    #[test]
    fn command_expansion() {
        let list = "connect_rst swdp_scan tpwr traceswo";
        assert!(has_command("tpwr", list));
        assert!(!has_command("tp", list));
        assert_eq!(expand_command("sw", list), Some("swdp_scan"));
        assert_eq!(expand_command("t", list), None); // ambiguous
        assert_eq!(expand_command("tpwr", list), Some("tpwr"));
        assert_eq!(expand_command("x", list), None);
    }

    #[test]
    fn target_line_parsing() {
        let t = parse_target_line(" 1: STM32F4xx M4").unwrap();
        assert_eq!(t.driver, "STM32F4xx");
        assert_eq!(t.arch, "M4");

        let t = parse_target_line("1 LPC43xx M0+").unwrap();
        assert_eq!(t.driver, "LPC43xx");
        assert_eq!(t.arch, "M0+");

        // No architecture tag: the whole remainder is the family.
        let t = parse_target_line("1: GD32VF103").unwrap();
        assert_eq!(t.driver, "GD32VF103");
        assert_eq!(t.arch, "");

        assert!(parse_target_line("Target voltage: 3.3V").is_none());
    }

    #[test]
    fn voltage_parsing() {
        assert_eq!(parse_voltage("Target voltage: 2.97V"), Some(2.97));
        assert_eq!(parse_voltage("Target voltage: 0.0V"), Some(0.0));
        assert_eq!(parse_voltage("1: STM32F4xx M4"), None);
    }

    #[test]
    fn attach_builds_sorted_regions() {
        let mut session = test_session(1024, &[]);
        let xml = "<memory-map>\
            <memory type=\"flash\" start=\"0x8000000\" length=\"0x10000\">\
            <property name=\"blocksize\">0x4000</property></memory>\
            </memory-map>";
        {
            let link = loopback(&mut session);
            // swdp_scan: voltage line, target line, OK
            feed_reply(link, &o_record("Target voltage: 3.3V\n"));
            feed_reply(link, &o_record(" 1: STM32F4xx M4\n"));
            link.feed(b"+");
            link.feed(&frame_packet(b"OK"));
            // vAttach;1
            feed_reply(link, b"T05");
            // memory map
            let mut map_reply = vec![b'l'];
            map_reply.extend_from_slice(xml.as_bytes());
            feed_reply(link, &map_reply);
        }
        let target = session.attach(false).unwrap();
        assert_eq!(target.driver, "STM32F4xx");
        assert_eq!(target.arch, "M4");
        assert_eq!(session.regions().len(), 1);
        assert_eq!(session.regions()[0].base, 0x0800_0000);
        assert!(session.regions()[0].block_size > 0);
    }

    #[test]
    fn part_id_parses_the_id_line() {
        let mut session = test_session(1024, &[]);
        {
            let link = loopback(&mut session);
            feed_reply(link, &o_record("Part ID: 0x2C40102B\n"));
            link.feed(b"+");
            link.feed(&frame_packet(b"OK"));
        }
        assert_eq!(session.part_id().unwrap(), Some(0x2C40_102B));
    }

    #[test]
    fn probe_kind_prefers_ctxlink() {
        let mut session = test_session(1024, &[]);
        {
            let link = loopback(&mut session);
            feed_reply(
                link,
                &o_record("Black Magic Probe (ctxLink), v1.8\n"),
            );
            link.feed(b"+");
            link.feed(&frame_packet(b"OK"));
        }
        assert_eq!(session.probe_kind().unwrap(), ProbeKind::CtxLink);
    }

    /// Hex-encodes `text` the way the probe does into an O-record.
    pub(crate) fn o_record(text: &str) -> Vec<u8> {
        let mut payload = vec![b'O'];
        payload.extend_from_slice(&bmlink_rsp::bytes_to_hex(
            text.as_bytes(),
        ));
        payload
    }
}
