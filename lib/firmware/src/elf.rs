// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ELF32 program-header walk.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;

use crate::{FirmwareError, Section, SectionKind};

pub(crate) fn load(bytes: &[u8]) -> Result<Vec<Section>, FirmwareError> {
    let elf = Elf::parse(bytes)?;
    if elf.is_64 {
        return Err(FirmwareError::Elf64);
    }

    let mut sections = Vec::new();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_filesz == 0 {
            continue;
        }
        let offset = ph.p_offset as usize;
        let size = ph.p_filesz as usize;
        let data = bytes
            .get(offset..offset + size)
            .ok_or(FirmwareError::ElfTruncated)?;

        // Code links and loads at the same place; initialized data loads
        // into flash (physical) but links into RAM (virtual).
        let kind = if ph.p_vaddr == ph.p_paddr {
            SectionKind::Code
        } else {
            SectionKind::Data
        };
        sections.push(Section {
            address: ph.p_paddr as u32,
            data: data.to_vec(),
            kind,
        });
    }
    if sections.is_empty() {
        return Err(FirmwareError::Empty);
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use crate::{FileFormat, Firmware, FirmwareError, SectionKind};

    fn le16(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }

    fn le32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    /// Builds a minimal statically-linked ELF32 for ARM with the given
    /// program headers, each `(vaddr, paddr, data)`.
    fn build_elf(segments: &[(u32, u32, &[u8])]) -> Vec<u8> {
        const EHSIZE: u32 = 52;
        const PHENTSIZE: u32 = 32;

        let phnum = segments.len() as u32;
        let mut data_off = EHSIZE + phnum * PHENTSIZE;

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.extend_from_slice(&[1, 1, 1, 0]); // 32-bit, LE, current
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&le16(2)); // ET_EXEC
        out.extend_from_slice(&le16(0x28)); // EM_ARM
        out.extend_from_slice(&le32(1));
        out.extend_from_slice(&le32(segments[0].0)); // e_entry
        out.extend_from_slice(&le32(EHSIZE)); // e_phoff
        out.extend_from_slice(&le32(0)); // e_shoff
        out.extend_from_slice(&le32(0)); // e_flags
        out.extend_from_slice(&le16(EHSIZE as u16));
        out.extend_from_slice(&le16(PHENTSIZE as u16));
        out.extend_from_slice(&le16(phnum as u16));
        out.extend_from_slice(&le16(40)); // e_shentsize
        out.extend_from_slice(&le16(0)); // e_shnum
        out.extend_from_slice(&le16(0)); // e_shstrndx

        for &(vaddr, paddr, data) in segments {
            out.extend_from_slice(&le32(1)); // PT_LOAD
            out.extend_from_slice(&le32(data_off));
            out.extend_from_slice(&le32(vaddr));
            out.extend_from_slice(&le32(paddr));
            out.extend_from_slice(&le32(data.len() as u32));
            out.extend_from_slice(&le32(data.len() as u32));
            out.extend_from_slice(&le32(5)); // R+X
            out.extend_from_slice(&le32(4));
            data_off += data.len() as u32;
        }
        for &(_, _, data) in segments {
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn load_segments_become_sections_at_physical_addresses() {
        let text = [0xDE, 0xAD, 0xBE, 0xEF];
        let init = [0x11, 0x22];
        let bytes = build_elf(&[
            (0x0800_0000, 0x0800_0000, &text),
            (0x2000_0000, 0x0800_0004, &init),
        ]);
        let fw = Firmware::parse(bytes).unwrap();
        assert_eq!(fw.format(), FileFormat::Elf);

        let s = fw.sections();
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].address, 0x0800_0000);
        assert_eq!(s[0].data, text);
        assert_eq!(s[0].kind, SectionKind::Code);
        assert_eq!(s[1].address, 0x0800_0004);
        assert_eq!(s[1].data, init);
        assert_eq!(s[1].kind, SectionKind::Data);
    }

    #[test]
    fn section_bytes_equal_the_file_payload() {
        let text = [7u8; 24];
        let bytes = build_elf(&[(0x0800_0000, 0x0800_0000, &text)]);
        let fw = Firmware::parse(bytes).unwrap();
        let total: usize = fw.sections().iter().map(|s| s.data.len()).sum();
        assert_eq!(total, text.len());
        assert_eq!(fw.byte_count(), text.len());
    }

    #[test]
    fn elf64_is_rejected() {
        let text = [0u8; 4];
        let mut bytes = build_elf(&[(0, 0, &text)]);
        bytes[4] = 2; // ELFCLASS64
        assert!(matches!(
            Firmware::parse(bytes),
            Err(FirmwareError::Elf64) | Err(FirmwareError::Elf(_))
        ));
    }
}
