//! CH552-based probes (Sipeed Tang boards). The firmware emulates an
//! FT2232 MPSSE closely enough to reuse that transport, but only services
//! shifts that also read, so every TDI write forces a capture.

use crate::config::Cable;
use crate::error::Result;
use crate::probe::mpsse::FtdiJtagMpsse;
use crate::probe::{JtagTransport, ProbeOptions};

/// CH552 JTAG probe.
pub struct Ch552Jtag {
    inner: FtdiJtagMpsse,
}

impl Ch552Jtag {
    /// Opens the emulated MPSSE interface with the mandatory-read quirk.
    pub fn open(cable: &Cable, opts: &ProbeOptions) -> Result<Self> {
        let mut inner = FtdiJtagMpsse::open(cable, opts)?;
        inner.force_read = true;
        Ok(Self { inner })
    }
}

impl JtagTransport for Ch552Jtag {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        // The emulation tops out well below the FT2232H it impersonates.
        self.inner.set_clock(hz.min(6_000_000))
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        self.inner.write_tms(tms, bits, flush)
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()> {
        self.inner.write_tdi(tx, rx, bits, end_is_tms)
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        self.inner.toggle_clk(tms, tdi, cycles)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn buffer_size(&self) -> usize {
        self.inner.buffer_size()
    }

    fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}
