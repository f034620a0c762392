//! The crate-wide error type.

/// Low-level failure modes of a probe transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Fewer bytes were accepted by the probe than submitted.
    ShortWrite {
        /// Bytes submitted.
        expected: usize,
        /// Bytes the probe accepted.
        written: usize,
    },
    /// Fewer bytes came back from the probe than requested.
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually received.
        read: usize,
    },
    /// The probe did not answer in time.
    Timeout,
    /// The USB device disappeared mid-operation.
    Disconnected,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::ShortWrite { expected, written } => {
                write!(f, "short write ({written}/{expected} bytes)")
            }
            TransportErrorKind::ShortRead { expected, read } => {
                write!(f, "short read ({read}/{expected} bytes)")
            }
            TransportErrorKind::Timeout => f.write_str("timeout"),
            TransportErrorKind::Disconnected => f.write_str("device disconnected"),
        }
    }
}

/// The overarching error type which contains all possible errors as variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// A USB transfer failed.
    #[error("USB error")]
    Usb(#[from] rusb::Error),
    /// A HID transfer failed.
    #[error("HID error")]
    Hid(#[from] hidapi::HidError),
    /// The probe transport misbehaved.
    #[error("{context}: {kind}")]
    Transport {
        /// What went wrong on the wire.
        kind: TransportErrorKind,
        /// The operation that was running.
        context: &'static str,
    },
    /// A bitstream file could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
    /// The bitstream was built for a different device than the chain reports.
    #[error(
        "IDCODE mismatch: bitstream targets 0x{expected:08x} but the device reports 0x{actual:08x}"
    )]
    IdcodeMismatch {
        /// IDCODE embedded in the bitstream.
        expected: u32,
        /// IDCODE read from the chain.
        actual: u32,
    },
    /// A device on the chain is not in any lookup table.
    #[error("unknown device with IDCODE 0x{idcode:08x}")]
    UnsupportedDevice {
        /// The IDCODE that failed lookup.
        idcode: u32,
    },
    /// Block-protect bits are set and clearing them was not allowed.
    #[error("flash is write-protected; pass --unprotect-flash to clear the protection")]
    ProtectedFlash,
    /// The flash write-in-progress flag never cleared.
    #[error("timeout waiting for flash WIP to clear (last status 0x{last_status:02x})")]
    WipTimeout {
        /// Status register value from the final poll.
        last_status: u8,
    },
    /// The device busy flag never cleared.
    #[error("{operation}: device busy flag never cleared")]
    JtagBusy {
        /// The operation that was polling.
        operation: &'static str,
    },
    /// Read-back data differs from what was written.
    #[error("verify failed at offset 0x{offset:08x}: expected 0x{expected:02x}, read 0x{actual:02x}")]
    VerifyMismatch {
        /// Byte offset of the first mismatch.
        offset: u32,
        /// Byte that was written.
        expected: u8,
        /// Byte that was read back.
        actual: u8,
    },
    /// A file-embedded checksum does not match the recomputed one.
    #[error("checksum mismatch: computed 0x{computed:04x}, file says 0x{expected:04x}")]
    ChecksumMismatch {
        /// Checksum computed over the payload.
        computed: u32,
        /// Checksum stored in the file.
        expected: u32,
    },
    /// A DFU transaction failed; carries the device-reported state and status.
    #[error("DFU error in state {state} with status {status}")]
    DfuStatus {
        /// `bState` at the time of failure.
        state: crate::dfu::State,
        /// `bStatus` reported by the device.
        status: crate::dfu::Status,
    },
    /// A public API was driven through an illegal sequence of calls.
    #[error("state machine misuse: {0}")]
    StateMachineMisuse(&'static str),
    /// An instruction opcode is not valid for the selected device.
    #[error("unknown IR opcode 0x{op:02x}")]
    UnknownIR {
        /// The rejected opcode.
        op: u32,
    },
    /// A caller-provided buffer cannot hold the requested transfer.
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall {
        /// Bytes the operation requires.
        needed: usize,
        /// Bytes available.
        have: usize,
    },
    /// A non-fatal condition the caller may choose to ignore.
    #[error("{0}")]
    SoftFail(String),
}

impl Error {
    /// Shorthand for a [`Error::Transport`] timeout.
    pub(crate) fn timeout(context: &'static str) -> Self {
        Error::Transport {
            kind: TransportErrorKind::Timeout,
            context,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
