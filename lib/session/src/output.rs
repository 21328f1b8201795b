// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line buffering for streamed console output.
//!
//! The probe streams its console text as O-records interleaved with the
//! request/reply traffic, and a single record may end mid-line. Every
//! high-level operation that reads this stream (target scan, `monitor`
//! help, version query, part-id query) needs the same reassembly, so it
//! lives here once.

/// Reassembles decoded O-record payloads into complete lines.
#[derive(Default)]
pub(crate) struct OutputGather {
    partial: String,
    lines: Vec<String>,
}

impl OutputGather {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded O-record payload (the codec's `o`-sentinel form).
    /// Returns `false` when `payload` is not console output, so callers
    /// can funnel every received packet through here first.
    pub fn push(&mut self, payload: &[u8]) -> bool {
        let Some(text) = payload.strip_prefix(b"o") else {
            return false;
        };
        for &b in text {
            match b {
                b'\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.lines.push(line);
                }
                b'\r' => {}
                _ => self.partial.push(char::from(b)),
            }
        }
        true
    }

    /// Takes the complete lines gathered so far.
    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    /// Flushes a trailing unterminated line, if any, and returns
    /// everything.
    pub fn finish(mut self) -> Vec<String> {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.lines.push(line);
        }
        self.lines
    }
}
