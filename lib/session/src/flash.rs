// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash programming pipeline.
//!
//! Programming runs region by region: compute how many sectors the image
//! actually reaches into, erase exactly those, stream the section bytes
//! in `vFlashWrite` blocks, and commit with `vFlashDone`. Block sizing is
//! where the subtlety lives: a write block must fit the negotiated packet
//! size *after* the payload is escaped, so candidate blocks shrink in
//! 16-byte steps until prefix + payload + escape overhead fits.
//!
//! A failure anywhere aborts the download and leaves the target
//! half-programmed; recovering is the caller's decision (usually another
//! download).

use std::path::Path;

use bmlink_firmware::{Firmware, Section};
use bmlink_rsp::escape_overhead;
use crc::{Crc, CRC_32_MPEG_2};

use crate::{FlashRegion, Session, SessionError, Status, ERASE_MS, MEM_MS};

/// The CRC GDB's `qCRC` implements: poly 0x04C11DB7, init 0xFFFFFFFF,
/// no reflection, no final XOR.
const GDB_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Write blocks start and stay 16-byte aligned.
const BLOCK_ALIGN: usize = 16;

/// `full_erase` gives up once the halved extent drops below this.
const MIN_ERASE: u32 = 1024;

/// Target reads go out in chunks this big.
const READ_CHUNK: u32 = 512;

/// Upper bound on the dump buffer.
const DUMP_CAP: u32 = 1024 * 1024;

impl Session {
    /// Programs the loaded image into the target's flash.
    pub fn download(&mut self, fw: &Firmware) -> Result<(), SessionError> {
        self.download_inner(fw).map_err(|e| self.fail(e))
    }

    fn download_inner(&mut self, fw: &Firmware) -> Result<(), SessionError> {
        self.require_open()?;
        if self.regions.is_empty() {
            return Err(SessionError::NoFlash);
        }
        if fw.byte_count() == 0 {
            return Err(SessionError::EmptyImage);
        }

        let regions = self.regions.clone();

        // Refuse an image that reaches outside the advertised flash
        // before touching the target at all.
        for section in fw.sections() {
            let covered = regions.iter().any(|r| {
                r.contains(section.address) && section.end() <= r.end()
            });
            if !covered {
                return Err(SessionError::OutsideFlash {
                    addr: section.address,
                });
            }
        }

        // The erase of each touched region counts as one progress step;
        // every written block then counts its own bytes.
        let range: u32 = regions
            .iter()
            .map(|r| match region_extent(fw, r) {
                Some((_, bytes)) => 1 + bytes,
                None => 0,
            })
            .sum();
        self.progress_reset(range);

        for region in &regions {
            let Some((top, _)) = region_extent(fw, region) else {
                continue;
            };

            let sectors = (top - region.base).div_ceil(region.block_size);
            let erase_len = sectors * region.block_size;
            self.notify(
                Status::Notice,
                &format!(
                    "erasing {:#010x}, {} KiB",
                    region.base,
                    erase_len / 1024
                ),
            );
            let cmd =
                format!("vFlashErase:{:x},{:x}", region.base, erase_len);
            self.xmit(cmd.as_bytes())?;
            self.check_ok(ERASE_MS, || SessionError::EraseFailed {
                addr: region.base,
            })?;
            self.progress_step(1);

            let mut sections: Vec<&Section> = fw
                .sections()
                .iter()
                .filter(|s| region.contains(s.address))
                .collect();
            sections.sort_by_key(|s| s.address);
            for section in sections {
                self.write_blocks(section)?;
            }

            self.xmit(b"vFlashDone")?;
            self.check_ok(ERASE_MS, || SessionError::DoneFailed)?;
        }

        self.notify(Status::Success, "programming complete");
        Ok(())
    }

    fn write_blocks(&mut self, section: &Section) -> Result<(), SessionError> {
        let mut addr = section.address;
        let mut data = &section.data[..];
        while !data.is_empty() {
            let len = self.block_len(addr, data)?;
            let block = &data[..len];

            let mut cmd = format!("vFlashWrite:{:x}:", addr).into_bytes();
            cmd.extend_from_slice(block);
            self.xmit(&cmd)?;
            self.check_ok(MEM_MS, || SessionError::WriteFailed { addr })?;

            self.progress_step(len as u32);
            addr += len as u32;
            data = &data[len..];
        }
        Ok(())
    }

    /// Largest block at `addr` that frames within the packet size. The
    /// reserve is the `vFlashWrite:<addr>:` prefix plus four bytes for
    /// `$`, `#` and the checksum pair; the escape overhead of the actual
    /// payload bytes then shrinks the candidate in 16-byte steps.
    fn block_len(&self, addr: u32, data: &[u8]) -> Result<usize, SessionError> {
        let prefix = format!("vFlashWrite:{:x}:", addr).len() + 4;
        let budget = self
            .packet_size
            .checked_sub(prefix)
            .ok_or(SessionError::PacketTooSmall(self.packet_size))?;

        let mut len = (budget & !(BLOCK_ALIGN - 1)).min(data.len());
        while len > 0 {
            if prefix + len + escape_overhead(&data[..len])
                <= self.packet_size
            {
                return Ok(len);
            }
            len = len.saturating_sub(BLOCK_ALIGN);
        }
        Err(SessionError::PacketTooSmall(self.packet_size))
    }

    /// Compares each section's CRC-32 against the target's `qCRC`
    /// answer. `Ok(false)` when any section differs; sections outside
    /// the known flash regions are not checked.
    pub fn verify(&mut self, fw: &Firmware) -> Result<bool, SessionError> {
        self.verify_inner(fw).map_err(|e| self.fail(e))
    }

    fn verify_inner(&mut self, fw: &Firmware) -> Result<bool, SessionError> {
        self.require_open()?;
        if self.regions.is_empty() {
            return Err(SessionError::NoFlash);
        }
        let regions = self.regions.clone();

        let mut all_match = true;
        for section in fw.sections() {
            let inside = regions.iter().any(|r| {
                r.contains(section.address) && section.end() <= r.end()
            });
            if !inside {
                continue;
            }

            let host = GDB_CRC.checksum(&section.data);
            let cmd = format!(
                "qCRC:{:x},{:x}",
                section.address,
                section.data.len()
            );
            self.xmit(cmd.as_bytes())?;
            let reply = loop {
                let p = self
                    .recv(MEM_MS)?
                    .ok_or(SessionError::NoResponse)?;
                if !p.starts_with(b"o") {
                    break p;
                }
            };
            let target = reply
                .strip_prefix(b"C")
                .map(String::from_utf8_lossy)
                .and_then(|hex| u32::from_str_radix(&hex, 16).ok())
                .ok_or(SessionError::Rejected {
                    op: "qCRC",
                    reply: String::from_utf8_lossy(&reply).into_owned(),
                })?;

            if target != host {
                let err = SessionError::CrcMismatch {
                    addr: section.address,
                    host,
                    target,
                };
                self.notify(Status::CrcMismatch, &err.to_string());
                all_match = false;
            }
        }
        if all_match {
            self.notify(Status::Success, "verification passed");
        }
        Ok(all_match)
    }

    /// Erases all flash regions, clipped to `flash_size` bytes overall
    /// when given. A refused erase is retried over half the extent until
    /// it either succeeds or the extent drops below 1 KiB.
    pub fn full_erase(
        &mut self,
        flash_size: Option<u32>,
    ) -> Result<(), SessionError> {
        self.full_erase_inner(flash_size).map_err(|e| self.fail(e))
    }

    fn full_erase_inner(
        &mut self,
        flash_size: Option<u32>,
    ) -> Result<(), SessionError> {
        self.require_open()?;
        if self.regions.is_empty() {
            return Err(SessionError::NoFlash);
        }
        let regions = self.regions.clone();
        let mut budget = flash_size.unwrap_or(u32::MAX);

        let mut touched = false;
        for region in &regions {
            if budget == 0 {
                break;
            }
            let mut extent = region.size.min(budget);
            loop {
                let cmd =
                    format!("vFlashErase:{:x},{:x}", region.base, extent);
                self.xmit(cmd.as_bytes())?;
                match self.expect_ok("flash erase", ERASE_MS) {
                    Ok(()) => break,
                    Err(
                        SessionError::Rejected { .. }
                        | SessionError::NoResponse,
                    ) => {
                        extent /= 2;
                        if extent < MIN_ERASE {
                            return Err(SessionError::EraseFailed {
                                addr: region.base,
                            });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            budget = budget.saturating_sub(extent);
            touched = true;
        }

        if touched {
            self.xmit(b"vFlashDone")?;
            self.check_ok(ERASE_MS, || SessionError::DoneFailed)?;
        }
        self.notify(Status::Success, "flash erased");
        Ok(())
    }

    /// Reads the flash regions back and checks they are all `0xFF`.
    pub fn blank_check(
        &mut self,
        flash_size: Option<u32>,
    ) -> Result<bool, SessionError> {
        self.blank_check_inner(flash_size).map_err(|e| self.fail(e))
    }

    fn blank_check_inner(
        &mut self,
        flash_size: Option<u32>,
    ) -> Result<bool, SessionError> {
        self.require_open()?;
        if self.regions.is_empty() {
            return Err(SessionError::NoFlash);
        }
        let regions = self.regions.clone();
        let mut budget = flash_size.unwrap_or(u32::MAX);

        let mut nonblank: u64 = 0;
        let mut first = None;
        for region in &regions {
            if budget == 0 {
                break;
            }
            let extent = region.size.min(budget);
            budget = budget.saturating_sub(extent);

            let mut addr = region.base;
            let end = region.base + extent;
            while addr < end {
                let chunk = READ_CHUNK.min(end - addr);
                let bytes = self.read_target_mem(addr, chunk as usize)?;
                for (i, &b) in bytes.iter().enumerate() {
                    if b != 0xFF {
                        nonblank += 1;
                        first.get_or_insert(addr + i as u32);
                    }
                }
                addr += chunk;
            }
        }

        match first {
            None => {
                self.notify(Status::Success, "flash is blank");
                Ok(true)
            }
            Some(addr) => {
                self.notify(
                    Status::Notice,
                    &format!(
                        "{} non-blank bytes, first at {:#010x}",
                        nonblank, addr
                    ),
                );
                Ok(false)
            }
        }
    }

    /// Reads the flash contents into a BIN file at `path`. The buffer
    /// covers the regions (capped at 1 MiB), is prefilled with `0xFF`,
    /// and trailing blank bytes are trimmed down to a 4-byte boundary.
    pub fn dump_flash(
        &mut self,
        path: &Path,
        flash_size: Option<u32>,
    ) -> Result<(), SessionError> {
        self.dump_flash_inner(path, flash_size)
            .map_err(|e| self.fail(e))
    }

    fn dump_flash_inner(
        &mut self,
        path: &Path,
        flash_size: Option<u32>,
    ) -> Result<(), SessionError> {
        self.require_open()?;
        if self.regions.is_empty() {
            return Err(SessionError::NoFlash);
        }
        let regions = self.regions.clone();

        let base = regions[0].base;
        let span = regions.last().map(|r| r.end() - base).unwrap_or(0);
        let len = span.min(DUMP_CAP).min(flash_size.unwrap_or(u32::MAX));
        let mut buffer = vec![0xFFu8; len as usize];

        for region in &regions {
            let mut addr = region.base;
            let end = region.end().min(base + len);
            while addr < end {
                let chunk = READ_CHUNK.min(end - addr);
                let bytes = self.read_target_mem(addr, chunk as usize)?;
                let at = (addr - base) as usize;
                buffer[at..at + bytes.len()].copy_from_slice(&bytes);
                addr += chunk;
            }
        }

        let used = buffer
            .iter()
            .rposition(|&b| b != 0xFF)
            .map_or(0, |i| i + 1);
        let trimmed = used.div_ceil(4) * 4;
        let trimmed = trimmed.min(buffer.len());
        std::fs::write(path, &buffer[..trimmed])?;
        self.notify(
            Status::Success,
            &format!("dumped {} bytes to {}", trimmed, path.display()),
        );
        Ok(())
    }

    /// Like `expect_ok` but converts a refusal into the pipeline's own
    /// error, keeping transport failures intact.
    fn check_ok(
        &mut self,
        timeout_ms: u32,
        err: impl FnOnce() -> SessionError,
    ) -> Result<(), SessionError> {
        match self.expect_ok("flash", timeout_ms) {
            Ok(()) => Ok(()),
            Err(SessionError::Rejected { .. } | SessionError::NoResponse) => {
                Err(err())
            }
            Err(e) => Err(e),
        }
    }
}

/// The highest image address inside `region` and the payload byte count,
/// or `None` when no section lands in the region.
fn region_extent(fw: &Firmware, region: &FlashRegion) -> Option<(u32, u32)> {
    let mut top = None;
    let mut bytes = 0u32;
    for section in fw.sections() {
        if !region.contains(section.address) {
            continue;
        }
        let end = section.end().min(region.end());
        top = Some(top.map_or(end, |t: u32| t.max(end)));
        bytes += end - section.address;
    }
    top.map(|t| (t, bytes))
}
