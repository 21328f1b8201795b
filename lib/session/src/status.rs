// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The status bus: the one channel through which the core reports to its
//! host. Negative codes are errors, zero is informational, positive is
//! success. The core never writes to stdout itself.

/// Status codes delivered to the host's callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Status {
    Notice = 0,
    Success = 1,
    PortAccess = -1,
    NoDetect = -2,
    NoResponse = -3,
    NoConnect = -4,
    MonitorFailed = -5,
    AttachFailed = -6,
    AllocFailed = -7,
    NoFlash = -8,
    EraseFailed = -9,
    WriteFailed = -10,
    DoneFailed = -11,
    CrcMismatch = -12,
    FileIo = -13,
    General = -14,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }
}

/// The host-installed callback. Installed once per session; every notice,
/// progress message and error report goes through it.
pub type StatusHandler = Box<dyn FnMut(Status, &str) + Send>;
