// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Target memory-map parsing.
//!
//! The probe answers `qXfer:memory-map:read` with a small XML document:
//!
//! ```xml
//! <memory-map>
//!   <memory type="flash" start="0x08000000" length="0x100000">
//!     <property name="blocksize">0x4000</property>
//!   </memory>
//!   <memory type="ram" start="0x20000000" length="0x20000"/>
//! </memory-map>
//! ```
//!
//! Only the flash entries matter here, and the document is machine
//! generated from a handful of templates, so a minimal attribute scanner
//! beats dragging in an XML crate (nothing else in the tool needs one).

/// One contiguous flash extent with a uniform sector size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashRegion {
    pub base: u32,
    pub size: u32,
    pub block_size: u32,
}

impl FlashRegion {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Extracts the flash regions from the memory-map document, sorted by
/// base address. Malformed entries are skipped: a region with no block
/// size or a zero extent cannot be erased and is useless to us.
pub(crate) fn parse_memory_map(xml: &str) -> Vec<FlashRegion> {
    let mut regions = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<memory") {
        rest = &rest[start + "<memory".len()..];
        // Skip the enclosing <memory-map> element itself.
        if rest.starts_with("-map") {
            continue;
        }
        let Some(tag_end) = rest.find('>') else {
            break;
        };
        let tag = &rest[..tag_end];
        let self_closing = tag.trim_end().ends_with('/');
        rest = &rest[tag_end + 1..];

        if attribute(tag, "type") != Some("flash") {
            continue;
        }
        let base = attribute(tag, "start").and_then(parse_number);
        let size = attribute(tag, "length").and_then(parse_number);

        let mut block_size = None;
        if !self_closing {
            if let Some(close) = rest.find("</memory>") {
                let body = &rest[..close];
                block_size = property(body, "blocksize");
                rest = &rest[close + "</memory>".len()..];
            }
        }

        match (base, size, block_size) {
            (Some(base), Some(size), Some(block_size))
                if size > 0
                    && block_size > 0
                    && u64::from(base) + u64::from(size) <= 1 << 32 =>
            {
                regions.push(FlashRegion { base, size, block_size });
            }
            _ => {
                log::warn!("skipping malformed flash entry: <memory{}>", tag);
            }
        }
    }
    regions.sort_by_key(|r| r.base);
    regions
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = tag;
    while let Some(pos) = rest.find(name) {
        let after = &rest[pos + name.len()..];
        // Guard against one attribute name being a suffix of another.
        let standalone = rest[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| c.is_whitespace());
        if standalone {
            if let Some(value) = after.trim_start().strip_prefix('=') {
                let value = value.trim_start();
                let quote = value.chars().next()?;
                if quote == '"' || quote == '\'' {
                    return value[1..].split(quote).next();
                }
            }
        }
        rest = &rest[pos + name.len()..];
    }
    None
}

fn property(body: &str, name: &str) -> Option<u32> {
    let mut rest = body;
    while let Some(pos) = rest.find("<property") {
        rest = &rest[pos + "<property".len()..];
        let tag_end = rest.find('>')?;
        let is_match = attribute(&rest[..tag_end], "name") == Some(name);
        rest = &rest[tag_end + 1..];
        if is_match {
            let text_end = rest.find('<')?;
            return parse_number(rest[..text_end].trim());
        }
    }
    None
}

fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STM32_MAP: &str = r#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "" "">
<memory-map>
  <memory type="flash" start="0x8000000" length="0x10000">
    <property name="blocksize">0x4000</property>
  </memory>
  <memory type="flash" start="0x8010000" length="0x10000">
    <property name="blocksize">0x10000</property>
  </memory>
  <memory type="ram" start="0x20000000" length="0x20000"/>
</memory-map>"#;

    #[test]
    fn flash_entries_are_extracted_sorted() {
        let regions = parse_memory_map(STM32_MAP);
        assert_eq!(
            regions,
            [
                FlashRegion {
                    base: 0x0800_0000,
                    size: 0x1_0000,
                    block_size: 0x4000
                },
                FlashRegion {
                    base: 0x0801_0000,
                    size: 0x1_0000,
                    block_size: 0x1_0000
                },
            ]
        );
    }

    #[test]
    fn ram_entries_are_ignored() {
        let regions = parse_memory_map(STM32_MAP);
        assert!(regions.iter().all(|r| r.base < 0x2000_0000));
    }

    #[test]
    fn unsorted_input_comes_out_sorted() {
        let xml = r#"<memory-map>
            <memory type="flash" start="0x1000" length="0x100">
              <property name="blocksize">0x100</property></memory>
            <memory type="flash" start="0x0" length="0x100">
              <property name="blocksize">0x100</property></memory>
            </memory-map>"#;
        let regions = parse_memory_map(xml);
        assert_eq!(regions[0].base, 0);
        assert_eq!(regions[1].base, 0x1000);
    }

    #[test]
    fn missing_blocksize_is_skipped() {
        let xml = r#"<memory-map>
            <memory type="flash" start="0x0" length="0x100"></memory>
            </memory-map>"#;
        assert!(parse_memory_map(xml).is_empty());
    }

    #[test]
    fn zero_length_is_skipped() {
        let xml = r#"<memory-map><memory type="flash" start="0x0" length="0">
            <property name="blocksize">0x100</property></memory></memory-map>"#;
        assert!(parse_memory_map(xml).is_empty());
    }

    #[test]
    fn wrapping_extent_is_skipped() {
        let xml = r#"<memory-map>
            <memory type="flash" start="0xFFFFF000" length="0x2000">
            <property name="blocksize">0x100</property></memory></memory-map>"#;
        assert!(parse_memory_map(xml).is_empty());
    }
}
