//! The Anlogic USB cable (Cypress FX2 based).
//!
//! One payload byte per TCK period: the low nibble drives TMS/TDI/TCK for
//! the first half-period, the high nibble for the second. Frames are
//! padded to 512 bytes; readback arrives bit-packed on a separate
//! endpoint.

use std::time::Duration;

use crate::config::Cable;
use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::{open_usb_device, JtagTransport};
use crate::util::{bit_get, bit_set};

const CONF_EP: u8 = 0x08;
const WRITE_EP: u8 = 0x06;
const READ_EP: u8 = 0x82;

const FREQ_CMD: u8 = 0x01;

const TMS_PIN: u8 = 1 << 0;
const TDI_PIN: u8 = 1 << 1;
const TCK_PIN: u8 = 1 << 2;

const FRAME: usize = 512;
const USB_TIMEOUT: Duration = Duration::from_secs(1);

/// Anlogic JTAG cable.
pub struct AnlogicCable {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    clk_hz: u32,
}

impl AnlogicCable {
    /// Opens the cable and programs the default clock.
    pub fn open(cable: &Cable) -> Result<Self> {
        let handle = open_usb_device(cable.vid, cable.pid, 0)?;
        let mut probe = Self {
            handle,
            clk_hz: 6_000_000,
        };
        probe.set_clock(6_000_000)?;
        Ok(probe)
    }

    /// Writes a full frame and optionally reads `read_bits` of TDO back.
    fn frame(&mut self, frame: &[u8; FRAME], rx: Option<(&mut [u8], usize, usize)>) -> Result<()> {
        let n = self.handle.write_bulk(WRITE_EP, frame, USB_TIMEOUT)?;
        if n != FRAME {
            return Err(Error::Transport {
                kind: TransportErrorKind::ShortWrite {
                    expected: FRAME,
                    written: n,
                },
                context: "anlogic cable write",
            });
        }
        if let Some((rx, bit_offset, read_bits)) = rx {
            let mut packed = [0u8; FRAME / 8];
            let n = self.handle.read_bulk(READ_EP, &mut packed, USB_TIMEOUT)?;
            if n * 8 < read_bits {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortRead {
                        expected: read_bits.div_ceil(8),
                        read: n,
                    },
                    context: "anlogic cable read",
                });
            }
            for i in 0..read_bits {
                bit_set(rx, bit_offset + i, bit_get(&packed, i));
            }
        }
        Ok(())
    }

    fn run_bits<F>(&mut self, bits: usize, rx: Option<&mut [u8]>, mut pin_state: F) -> Result<()>
    where
        F: FnMut(usize) -> u8,
    {
        let mut rx = rx;
        let mut done = 0usize;
        while done < bits {
            let chunk = (bits - done).min(FRAME);
            let mut frame = [0u8; FRAME];
            for (i, slot) in frame.iter_mut().enumerate().take(chunk) {
                let pins = pin_state(done + i);
                // Low phase then high phase with TCK raised.
                *slot = pins | ((pins | TCK_PIN) << 4);
            }
            // Park trailing slots at the final level, clock high.
            let last = frame[chunk - 1];
            for slot in frame.iter_mut().skip(chunk) {
                *slot = last | (TCK_PIN << 4);
            }
            match rx.as_deref_mut() {
                Some(out) => self.frame(&frame, Some((out, done, chunk)))?,
                None => self.frame(&frame, None)?,
            }
            done += chunk;
        }
        Ok(())
    }
}

impl JtagTransport for AnlogicCable {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        // Discrete divider codes; pick the fastest not above the request.
        let table: [(u32, u8); 8] = [
            (6_000_000, 0x00),
            (3_000_000, 0x04),
            (2_000_000, 0x08),
            (1_000_000, 0x14),
            (600_000, 0x24),
            (400_000, 0x38),
            (200_000, 0x70),
            (100_000, 0xe8),
        ];
        let (actual, code) = table
            .iter()
            .find(|(rate, _)| *rate <= hz.max(100_000))
            .copied()
            .unwrap_or((100_000, 0xe8));
        self.handle
            .write_bulk(CONF_EP, &[FREQ_CMD, code], USB_TIMEOUT)?;
        self.clk_hz = actual;
        Ok(self.clk_hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        let tms_bits: Vec<bool> = (0..bits).map(|i| bit_get(tms, i)).collect();
        self.run_bits(bits, None, |i| if tms_bits[i] { TMS_PIN } else { 0 })
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()> {
        let tx: Vec<bool> = (0..bits)
            .map(|i| tx.map(|t| bit_get(t, i)).unwrap_or(true))
            .collect();
        let last = bits - 1;
        self.run_bits(bits, rx, |i| {
            let mut pins = 0u8;
            if tx[i] {
                pins |= TDI_PIN;
            }
            if end_is_tms && i == last {
                pins |= TMS_PIN;
            }
            pins
        })
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        let mut pins = 0u8;
        if tms {
            pins |= TMS_PIN;
        }
        if tdi {
            pins |= TDI_PIN;
        }
        self.run_bits(cycles as usize, None, |_| pins)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        FRAME
    }
}
