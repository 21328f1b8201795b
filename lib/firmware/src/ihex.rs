// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intel-HEX record parsing.
//!
//! Record format, all hex ASCII: `:LL AAAA TT <LL data bytes> CC`, where
//! the checksum `CC` makes the byte sum of the whole record zero modulo
//! 256. Base-address records (types 02 and 04) shift subsequent data
//! records; a data record that does not extend the current section
//! contiguously starts a new one.

use crate::{FirmwareError, Section, SectionKind};

struct Record {
    addr: u16,
    rtype: u8,
    data: Vec<u8>,
}

/// True when the input opens with one well-formed record; used for
/// format detection only.
pub(crate) fn first_record_parses(bytes: &[u8]) -> bool {
    let mut pos = 0;
    skip_ws(bytes, &mut pos);
    parse_record(bytes, &mut pos, 1).is_ok()
}

pub(crate) fn load(bytes: &[u8]) -> Result<Vec<Section>, FirmwareError> {
    let mut sections: Vec<Section> = Vec::new();
    let mut base: u32 = 0;
    let mut pos = 0;
    let mut record = 0;

    loop {
        skip_ws(bytes, &mut pos);
        if pos >= bytes.len() {
            // Ran out of input before the end-of-file record: the image
            // is truncated and nothing of it can be trusted.
            return Err(FirmwareError::HexTruncated);
        }
        record += 1;
        let rec = parse_record(bytes, &mut pos, record)?;
        match rec.rtype {
            0x00 => {
                let full = base.wrapping_add(u32::from(rec.addr));
                if let Some(last) =
                    sections.last_mut().filter(|s| s.end() == full)
                {
                    last.data.extend_from_slice(&rec.data);
                } else if !rec.data.is_empty() {
                    sections.push(Section {
                        address: full,
                        data: rec.data,
                        kind: SectionKind::Unknown,
                    });
                }
            }
            0x01 => break,
            0x02 => {
                base = record_base(&rec, record)? << 4;
            }
            0x04 => {
                base = record_base(&rec, record)? << 16;
            }
            // Start-address records; meaningless for flash programming.
            0x03 | 0x05 => {}
            other => {
                log::warn!(
                    "HEX record {}: ignoring unknown type {:#04x}",
                    record,
                    other
                );
            }
        }
    }

    if sections.is_empty() {
        return Err(FirmwareError::Empty);
    }
    Ok(sections)
}

fn record_base(rec: &Record, record: usize) -> Result<u32, FirmwareError> {
    if rec.data.len() != 2 {
        return Err(FirmwareError::HexSyntax { record });
    }
    Ok(u32::from(rec.data[0]) << 8 | u32::from(rec.data[1]))
}

fn skip_ws(bytes: &[u8], pos: &mut usize) {
    while bytes
        .get(*pos)
        .is_some_and(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
    {
        *pos += 1;
    }
}

fn parse_record(
    bytes: &[u8],
    pos: &mut usize,
    record: usize,
) -> Result<Record, FirmwareError> {
    if bytes.get(*pos) != Some(&b':') {
        return Err(FirmwareError::HexSyntax { record });
    }
    *pos += 1;

    let mut sum: u8 = 0;
    let mut next = |pos: &mut usize| -> Result<u8, FirmwareError> {
        let hi = hex_digit(bytes, *pos)
            .ok_or(FirmwareError::HexSyntax { record })?;
        let lo = hex_digit(bytes, *pos + 1)
            .ok_or(FirmwareError::HexSyntax { record })?;
        *pos += 2;
        let byte = hi << 4 | lo;
        sum = sum.wrapping_add(byte);
        Ok(byte)
    };

    let length = next(pos)?;
    let addr_hi = next(pos)?;
    let addr_lo = next(pos)?;
    let rtype = next(pos)?;
    let mut data = Vec::with_capacity(usize::from(length));
    for _ in 0..length {
        data.push(next(pos)?);
    }
    next(pos)?; // checksum byte folds into the running sum

    if sum != 0 {
        return Err(FirmwareError::HexChecksum { record });
    }
    Ok(Record {
        addr: u16::from(addr_hi) << 8 | u16::from(addr_lo),
        rtype,
        data,
    })
}

fn hex_digit(bytes: &[u8], pos: usize) -> Option<u8> {
    match bytes.get(pos)? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::{FileFormat, Firmware, FirmwareError};

    /// Builds one record with a correct checksum.
    fn rec(addr: u16, rtype: u8, data: &[u8]) -> String {
        let mut sum = data.len() as u8;
        sum = sum
            .wrapping_add((addr >> 8) as u8)
            .wrapping_add(addr as u8)
            .wrapping_add(rtype);
        for &b in data {
            sum = sum.wrapping_add(b);
        }
        let mut out = format!(":{:02X}{:04X}{:02X}", data.len(), addr, rtype);
        for &b in data {
            out.push_str(&format!("{:02X}", b));
        }
        out.push_str(&format!("{:02X}\n", sum.wrapping_neg()));
        out
    }

    const EOF: &str = ":00000001FF\n";

    #[test]
    fn linear_base_jump_makes_two_sections() {
        let payload: Vec<u8> = (0..16).collect();
        let mut text = String::new();
        text += &rec(0, 0x04, &[0x00, 0x00]); // ":020000040000FA"
        text += &rec(0, 0x00, &payload);
        text += &rec(0, 0x04, &[0x00, 0x01]); // ":020000040001F9"
        text += &rec(0, 0x00, &payload);
        text += EOF;

        let fw = Firmware::parse(text.into_bytes()).unwrap();
        assert_eq!(fw.format(), FileFormat::IntelHex);
        assert_eq!(fw.sections().len(), 2);
        assert_eq!(fw.section(0).unwrap().address, 0x0000_0000);
        assert_eq!(fw.section(0).unwrap().data.len(), 16);
        assert_eq!(fw.section(1).unwrap().address, 0x0001_0000);
        assert_eq!(fw.section(1).unwrap().data.len(), 16);
        assert!(fw.section(2).is_none());
    }

    #[test]
    fn contiguous_records_grow_one_section() {
        let mut text = String::new();
        text += &rec(0x0000, 0x00, &[1, 2, 3, 4]);
        text += &rec(0x0004, 0x00, &[5, 6, 7, 8]);
        text += EOF;
        let fw = Firmware::parse(text.into_bytes()).unwrap();
        assert_eq!(fw.sections().len(), 1);
        assert_eq!(fw.section(0).unwrap().data, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn gap_and_regression_start_new_sections() {
        let mut text = String::new();
        text += &rec(0x0000, 0x00, &[1, 2]);
        text += &rec(0x0010, 0x00, &[3, 4]); // gap
        text += &rec(0x0008, 0x00, &[5, 6]); // backwards
        text += EOF;
        let fw = Firmware::parse(text.into_bytes()).unwrap();
        let addrs: Vec<u32> =
            fw.sections().iter().map(|s| s.address).collect();
        assert_eq!(addrs, [0x0, 0x10, 0x8]);
    }

    #[test]
    fn segment_base_shifts_by_four_bits() {
        let mut text = String::new();
        text += &rec(0, 0x02, &[0x10, 0x00]); // base = 0x1000 << 4
        text += &rec(0x0002, 0x00, &[0xAB]);
        text += EOF;
        let fw = Firmware::parse(text.into_bytes()).unwrap();
        assert_eq!(fw.section(0).unwrap().address, 0x0001_0002);
    }

    #[test]
    fn checksum_mismatch_discards_everything() {
        let good = rec(0, 0x00, &[1, 2, 3, 4]);
        // Corrupt one payload nibble; the checksum no longer matches.
        let bad = good.replace("01020304", "01020305");
        let text = format!("{}{}", bad, EOF);
        assert!(matches!(
            Firmware::parse(text.into_bytes()),
            Err(FirmwareError::HexChecksum { record: 1 })
        ));
    }

    #[test]
    fn missing_eof_record_is_an_error() {
        let text = rec(0, 0x00, &[1, 2]);
        assert!(matches!(
            Firmware::parse(text.into_bytes()),
            Err(FirmwareError::HexTruncated)
        ));
    }

    #[test]
    fn unknown_record_types_are_skipped() {
        let mut text = String::new();
        text += &rec(0, 0x00, &[9]);
        text += &rec(0, 0x06, &[1, 2]); // not a defined type
        text += &rec(0x0001, 0x00, &[8]);
        text += EOF;
        let fw = Firmware::parse(text.into_bytes()).unwrap();
        assert_eq!(fw.sections().len(), 1);
        assert_eq!(fw.section(0).unwrap().data, [9, 8]);
    }

    #[test]
    fn start_address_records_are_ignored() {
        let mut text = String::new();
        text += &rec(0, 0x05, &[0, 0, 0, 4]);
        text += &rec(0, 0x00, &[1]);
        text += EOF;
        let fw = Firmware::parse(text.into_bytes()).unwrap();
        assert_eq!(fw.sections().len(), 1);
    }

    #[test]
    fn not_hex_falls_back_to_bin() {
        let fw = Firmware::parse(b":not a record\n".to_vec()).unwrap();
        assert_eq!(fw.format(), FileFormat::Bin);
    }
}
