// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SWO capture bring-up on the probe side.
//!
//! `monitor traceswo` switches the probe's trace endpoint on and reports
//! where the capture stream comes out. Old firmware prints a terse
//! `<serial>:<interface>:<endpoint>` triple; newer firmware prints a
//! sentence ending in `... USB EP <n>`, where the direction bit of the
//! endpoint address is implied and has to be OR-ed back in.

use crate::{Session, SessionError, Status, MONITOR_MS};

impl Session {
    /// Enables SWO capture, optionally at an async (NRZ) bitrate, and
    /// returns the USB endpoint the trace stream appears on.
    pub fn enable_trace(
        &mut self,
        async_bitrate: Option<u32>,
    ) -> Result<u8, SessionError> {
        self.enable_trace_inner(async_bitrate)
            .map_err(|e| self.fail(e))
    }

    fn enable_trace_inner(
        &mut self,
        async_bitrate: Option<u32>,
    ) -> Result<u8, SessionError> {
        self.require_open()?;
        let cmd = match async_bitrate {
            Some(bitrate) => format!("qRcmd,traceswo {}", bitrate),
            None => "qRcmd,traceswo".to_string(),
        };

        for attempt in 0..3 {
            if attempt > 0 {
                log::debug!("traceswo retry {}", attempt + 1);
            }
            let reply = self.exchange(cmd.as_bytes(), MONITOR_MS)?;
            for line in &reply.lines {
                self.notify(Status::Notice, line);
            }
            if let Some(ep) = parse_trace_endpoint(&reply.lines) {
                return Ok(ep);
            }
        }
        Err(SessionError::TraceFailed)
    }
}

fn parse_trace_endpoint(lines: &[String]) -> Option<u8> {
    // Legacy form: three colon-separated hex fields, endpoint last.
    for line in lines {
        let parts: Vec<&str> = line.trim().split(':').collect();
        if parts.len() == 3 && !parts.iter().any(|p| p.is_empty()) {
            let all_hex = parts
                .iter()
                .all(|p| p.bytes().all(|b| b.is_ascii_hexdigit()));
            if all_hex {
                if let Ok(ep) = u8::from_str_radix(parts[2], 16) {
                    return Some(ep);
                }
            }
        }
    }
    // New form: "Trace enabled for BMP serial ..., USB EP 5". The
    // direction bit is implied for an IN endpoint.
    for line in lines {
        if !line.contains("Trace enabled") {
            continue;
        }
        let mut tokens = line.split_whitespace().peekable();
        while let Some(tok) = tokens.next() {
            if tok == "EP" {
                if let Some(ep) =
                    tokens.peek().and_then(|n| n.parse::<u8>().ok())
                {
                    return Some(ep | 0x80);
                }
            }
        }
    }
    None
}
