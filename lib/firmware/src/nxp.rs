// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NXP LPC image services.
//!
//! LPC boot ROMs refuse to run an image unless one slot of the vector
//! table holds the two's-complement of the sum of the other entries; the
//! slot differs between the ARM7TDMI parts and the Cortex-M parts. The
//! same ROMs read the word at 0x2FC as the Code Read Protection marker.
//! Both words are patched in place, through the image's bounded slices.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Firmware, FirmwareError};

/// Flash address of the NXP code-read-protection word.
pub const CRP_ADDRESS: u32 = 0x0000_02FC;

/// Outcome of a vector-table patch attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VectorPatch {
    /// The checksum slot already held the correct value.
    AlreadySet,
    /// The slot was rewritten.
    Patched,
    /// The driver name is not an NXP LPC family.
    NotNxp,
    /// The image has no section covering the vector table.
    NoVectorTable,
}

/// Checksum slot index per family group. The ARM7TDMI parts reserve
/// vector 5, the Cortex-M parts vector 7.
const SLOT_ARM7: usize = 5;
const SLOT_CORTEX_M: usize = 7;

const ARM7_FAMILIES: &[&str] = &["LPC21*", "LPC22*", "LPC23*", "LPC24*"];
const CORTEX_M_FAMILIES: &[&str] = &[
    "LPC8*", "LPC11*", "LPC12*", "LPC13*", "LPC15*", "LPC17*", "LPC18*",
    "LPC40*", "LPC43*", "LPC54*",
];

/// CRP levels and their flash magics. Level 9 is the erased word: no
/// protection at all.
const CRP_MAGICS: &[(u8, u32)] = &[
    (1, 0x1234_5678),
    (2, 0x8765_4321),
    (3, 0x4321_8765),
    (4, 0x4E69_7370), // "NO ISP"
    (9, 0xFFFF_FFFF),
];

impl Firmware {
    /// Fixes up the LPC vector-table checksum for the given probe driver
    /// name. Idempotent: a second call reports [`VectorPatch::AlreadySet`]
    /// and leaves the image untouched.
    pub fn patch_vector_table(&mut self, driver: &str) -> VectorPatch {
        let slot = if matches_any(ARM7_FAMILIES, driver) {
            SLOT_ARM7
        } else if matches_any(CORTEX_M_FAMILIES, driver) {
            SLOT_CORTEX_M
        } else {
            return VectorPatch::NotNxp;
        };

        let base = match self.sections().iter().map(|s| s.address).min() {
            Some(base) => base,
            None => return VectorPatch::NoVectorTable,
        };
        let Some(table) = self.slice_mut(base, 32) else {
            return VectorPatch::NoVectorTable;
        };

        let mut words = [0u32; 8];
        LittleEndian::read_u32_into(table, &mut words);

        let sum = words
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != slot)
            .fold(0u32, |a, (_, &w)| a.wrapping_add(w));
        let checksum = sum.wrapping_neg();

        if words[slot] == checksum {
            return VectorPatch::AlreadySet;
        }
        log::debug!(
            "vector checksum: slot {} {:#010x} -> {:#010x}",
            slot,
            words[slot],
            checksum
        );
        LittleEndian::write_u32(&mut table[slot * 4..slot * 4 + 4], checksum);
        VectorPatch::Patched
    }

    /// The image's CRP level: 1..=4 for the protection magics, 9 for an
    /// erased (unprotected) word, 0 when the word is not recognized or
    /// not present.
    pub fn crp_level(&self) -> u8 {
        let Some(bytes) = self.slice(CRP_ADDRESS, 4) else {
            return 0;
        };
        let word = LittleEndian::read_u32(bytes);
        CRP_MAGICS
            .iter()
            .find(|&&(_, magic)| magic == word)
            .map(|&(level, _)| level)
            .unwrap_or(0)
    }

    /// Replaces the CRP word with the magic for `level`. Refuses to
    /// touch an image whose current word is not a recognized magic:
    /// anything else at 0x2FC is code or data, not a protection marker.
    pub fn set_crp_level(&mut self, level: u8) -> Result<(), FirmwareError> {
        let magic = CRP_MAGICS
            .iter()
            .find(|&&(l, _)| l == level)
            .map(|&(_, m)| m)
            .ok_or(FirmwareError::BadCrpLevel(level))?;

        if self.crp_level() == 0 {
            return Err(FirmwareError::NoCrpWord);
        }
        let bytes = self
            .slice_mut(CRP_ADDRESS, 4)
            .ok_or(FirmwareError::NoCrpWord)?;
        LittleEndian::write_u32(bytes, magic);
        Ok(())
    }
}

fn matches_any(patterns: &[&str], name: &str) -> bool {
    patterns.iter().any(|p| wildcard_match(p, name))
}

/// Case-insensitive glob with `*` (any run) and `?` (any one byte).
fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.split_first(), t.split_first()) {
            (None, None) => true,
            (Some((b'*', rest)), _) => {
                inner(rest, t)
                    || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some((b'?', pr)), Some((_, tr))) => inner(pr, tr),
            (Some((&pc, pr)), Some((&tc, tr))) => {
                pc.eq_ignore_ascii_case(&tc) && inner(pr, tr)
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Firmware;

    /// The scenario image: stack pointer, seven handlers, empty slot 7.
    fn vector_image() -> Vec<u8> {
        let words: [u32; 8] = [
            0x2000_8000,
            0x80,
            0x81,
            0x82,
            0x83,
            0x84,
            0x85,
            0x0000_0000,
        ];
        let mut out = vec![0u8; 32];
        LittleEndian::write_u32_into(&words, &mut out);
        out
    }

    fn word_at(fw: &Firmware, addr: u32) -> u32 {
        LittleEndian::read_u32(fw.slice(addr, 4).unwrap())
    }

    #[test]
    fn cortex_m_patch_fills_slot_seven() {
        let mut fw = Firmware::parse(vector_image()).unwrap();
        assert_eq!(fw.patch_vector_table("LPC17xx"), VectorPatch::Patched);

        let expected = (0x2000_8000u32)
            .wrapping_add(0x80 + 0x81 + 0x82 + 0x83 + 0x84 + 0x85)
            .wrapping_neg();
        assert_eq!(word_at(&fw, 28), expected);
    }

    #[test]
    fn patch_is_idempotent() {
        let mut fw = Firmware::parse(vector_image()).unwrap();
        assert_eq!(fw.patch_vector_table("LPC17xx"), VectorPatch::Patched);
        let bytes: Vec<u8> = fw.section(0).unwrap().data.clone();
        assert_eq!(fw.patch_vector_table("LPC17xx"), VectorPatch::AlreadySet);
        assert_eq!(fw.section(0).unwrap().data, bytes);
    }

    #[test]
    fn arm7_families_use_slot_five() {
        let mut fw = Firmware::parse(vector_image()).unwrap();
        assert_eq!(fw.patch_vector_table("LPC2138"), VectorPatch::Patched);
        // Slot 5 carries the checksum, slot 7 keeps its original value.
        let sum = (0x2000_8000u32)
            .wrapping_add(0x80 + 0x81 + 0x82 + 0x83 + 0x85);
        assert_eq!(word_at(&fw, 20), sum.wrapping_neg());
        assert_eq!(word_at(&fw, 28), 0);
    }

    #[test]
    fn non_nxp_drivers_are_refused() {
        let mut fw = Firmware::parse(vector_image()).unwrap();
        assert_eq!(fw.patch_vector_table("STM32F4xx"), VectorPatch::NotNxp);
    }

    #[test]
    fn short_image_has_no_vector_table() {
        let mut fw = Firmware::parse(vec![0u8; 16]).unwrap();
        assert_eq!(
            fw.patch_vector_table("LPC17xx"),
            VectorPatch::NoVectorTable
        );
    }

    fn crp_image(word: u32) -> Vec<u8> {
        let mut out = vec![0u8; 0x300];
        LittleEndian::write_u32(&mut out[0x2FC..], word);
        out
    }

    #[test]
    fn crp_levels_round_trip() {
        for level in [1u8, 2, 3, 4, 9] {
            let mut fw = Firmware::parse(crp_image(0xFFFF_FFFF)).unwrap();
            fw.set_crp_level(level).unwrap();
            assert_eq!(fw.crp_level(), level);
        }
    }

    #[test]
    fn unrecognized_word_reads_as_zero_and_blocks_set() {
        let mut fw = Firmware::parse(crp_image(0xDEAD_BEEF)).unwrap();
        assert_eq!(fw.crp_level(), 0);
        assert!(matches!(
            fw.set_crp_level(2),
            Err(FirmwareError::NoCrpWord)
        ));
    }

    #[test]
    fn bad_level_is_rejected() {
        let mut fw = Firmware::parse(crp_image(0xFFFF_FFFF)).unwrap();
        assert!(matches!(
            fw.set_crp_level(5),
            Err(FirmwareError::BadCrpLevel(5))
        ));
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("LPC17*", "lpc1769"));
        assert!(wildcard_match("LPC?3*", "LPC4357"));
        assert!(!wildcard_match("LPC17*", "LPC2138"));
    }
}
