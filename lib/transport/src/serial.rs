// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial-port access and probe discovery.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits,
};

use crate::{Link, TransportError};

/// USB vendor/product of the Black Magic Probe. Interface 0 is the GDB
/// server, interface 2 the auxiliary UART.
const BMP_VID: u16 = 0x1d50;
const BMP_PID: u16 = 0x6018;

/// Modem control lines that can be driven from the host side.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineCode {
    Rts,
    Dtr,
    Break,
}

bitflags::bitflags! {
    /// Modem status lines as reported by the port.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct LineStatus: u8 {
        const CTS = 1 << 0;
        const DSR = 1 << 1;
        const RI  = 1 << 2;
        const CD  = 1 << 3;
    }
}

pub struct SerialLink {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialLink {
    /// Opens `name` at `baud`, 8N1, no flow control: the configuration the
    /// probe's GDB interface expects.
    pub fn open(name: &str, baud: u32) -> Result<Self, TransportError> {
        Self::open_config(
            name,
            baud,
            DataBits::Eight,
            StopBits::One,
            Parity::None,
            FlowControl::None,
        )
    }

    pub fn open_config(
        name: &str,
        baud: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        flow: FlowControl,
    ) -> Result<Self, TransportError> {
        let build = |name: &str| {
            serialport::new(name, baud)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .flow_control(flow)
                // A zero timeout makes reads return immediately with
                // whatever the driver has buffered.
                .timeout(Duration::from_millis(0))
                .open()
        };

        let port = match build(name) {
            Ok(port) => port,
            // COM10 and up cannot be opened under their plain name on
            // Windows; retry through the device namespace.
            Err(first) => {
                if cfg!(windows) && !name.starts_with(r"\\.\") {
                    build(&format!(r"\\.\{}", name)).map_err(|_| {
                        TransportError::PortAccess {
                            name: name.to_string(),
                            source: first,
                        }
                    })?
                } else {
                    return Err(TransportError::PortAccess {
                        name: name.to_string(),
                        source: first,
                    });
                }
            }
        };

        log::debug!("opened {} at {} baud", name, baud);
        Ok(Self {
            port,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_line(
        &mut self,
        line: LineCode,
        on: bool,
    ) -> Result<(), TransportError> {
        match line {
            LineCode::Rts => self.port.write_request_to_send(on)?,
            LineCode::Dtr => self.port.write_data_terminal_ready(on)?,
            LineCode::Break => {
                if on {
                    self.port.set_break()?
                } else {
                    self.port.clear_break()?
                }
            }
        }
        Ok(())
    }

    pub fn lines(&mut self) -> Result<LineStatus, TransportError> {
        let mut status = LineStatus::empty();
        status.set(LineStatus::CTS, self.port.read_clear_to_send()?);
        status.set(LineStatus::DSR, self.port.read_data_set_ready()?);
        status.set(LineStatus::RI, self.port.read_ring_indicator()?);
        status.set(LineStatus::CD, self.port.read_carrier_detect()?);
        Ok(status)
    }
}

impl Link for SerialLink {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        Ok(self.port.write(data)?)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn pending(&self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(self.port.flush()?)
    }
}

/// A discovered Black Magic Probe: the GDB-server serial device plus the
/// USB serial number (shown to the user so multiple probes can be told
/// apart).
#[derive(Clone, Debug)]
pub struct ProbeInfo {
    pub port: String,
    pub serial: Option<String>,
}

/// Lists BMP GDB-server ports, in enumeration order. The returned index is
/// what `--probe N` selects.
pub fn find_probes() -> Vec<ProbeInfo> {
    let Ok(ports) = serialport::available_ports() else {
        return Vec::new();
    };
    let mut probes = Vec::new();
    for info in ports {
        let SerialPortType::UsbPort(usb) = &info.port_type else {
            continue;
        };
        if usb.vid != BMP_VID || usb.pid != BMP_PID {
            continue;
        }
        // Only the GDB-server interface; the same VID:PID also covers the
        // probe's target-UART function.
        if usb.interface.unwrap_or(0) != 0 {
            continue;
        }
        probes.push(ProbeInfo {
            port: info.port_name,
            serial: usb.serial_number.clone(),
        });
    }
    probes.sort_by(|a, b| port_order(&a.port, &b.port));
    probes
}

/// Lists every serial port on the system, sorted for presentation:
/// legacy `ttyS*` ports last, numeric suffixes in numeric order within a
/// common prefix.
pub fn collect_ports() -> Vec<String> {
    let mut names: Vec<String> = serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default();
    names.sort_by(|a, b| port_order(a, b));
    names
}

fn port_order(a: &str, b: &str) -> std::cmp::Ordering {
    fn key(name: &str) -> (bool, &str, u64) {
        let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
        let is_legacy = base.starts_with("ttyS");
        let digits = name.len() - name
            .bytes()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let (prefix, num) = name.split_at(digits);
        (is_legacy, prefix, num.parse().unwrap_or(0))
    }
    key(a).cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffixes_sort_numerically() {
        let mut ports = vec![
            "/dev/ttyACM10".to_string(),
            "/dev/ttyACM2".to_string(),
            "/dev/ttyACM1".to_string(),
        ];
        ports.sort_by(|a, b| port_order(a, b));
        assert_eq!(ports, ["/dev/ttyACM1", "/dev/ttyACM2", "/dev/ttyACM10"]);
    }

    #[test]
    fn legacy_ports_sort_last() {
        let mut ports = vec![
            "/dev/ttyS0".to_string(),
            "/dev/ttyUSB0".to_string(),
            "/dev/ttyACM0".to_string(),
        ];
        ports.sort_by(|a, b| port_order(a, b));
        assert_eq!(ports, ["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0"]);
    }

    #[test]
    fn mixed_prefixes_group_before_numbering() {
        let mut ports = vec![
            "COM12".to_string(),
            "COM3".to_string(),
            "COM1".to_string(),
        ];
        ports.sort_by(|a, b| port_order(a, b));
        assert_eq!(ports, ["COM1", "COM3", "COM12"]);
    }
}
