//! The uniform SPI access layer.
//!
//! Two kinds of providers implement [`SpiInterface`]: the direct FTDI-SPI
//! transport, and per-vendor bscan tunnels that ferry SPI bytes through the
//! FPGA's user JTAG register (with the bit-reversal conventions documented
//! on each driver).

mod flash;
mod flash_db;

pub use flash::SpiFlash;
pub use flash_db::{flash_by_jedec_id, FlashDescriptor, FLASH_LIST};

use std::time::Duration;

use crate::error::{Error, Result};

/// Polling interval inside [`SpiInterface::spi_wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Uniform `spi_put`/`spi_wait` access to a serial flash bus.
pub trait SpiInterface {
    /// Emits `cmd` then clocks `tx` while optionally capturing the bytes
    /// returned during the data phase. The opcode is not part of `tx` and
    /// produces no `rx` byte.
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()>;

    /// Same as [`SpiInterface::spi_put`] without the implicit opcode; used
    /// for multi-part transfers carrying address and data together.
    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()>;

    /// Polls by issuing `cmd` until `(response & mask) == cond` or the
    /// iteration budget runs out.
    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        let mut last = 0u8;
        for i in 0..timeout {
            let mut rx = [0u8];
            self.spi_put(cmd, None, Some(&mut rx))?;
            last = rx[0];
            if last & mask == cond {
                return Ok(());
            }
            // Accept early completion; only sleep once the fast path missed.
            if i > 2 {
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
        }
        Err(Error::WipTimeout { last_status: last })
    }
}
