//! WCH CH347 high-speed USB bridge in JTAG mode.
//!
//! Commands are framed `{opcode, len_lo, len_hi, payload…}` on a bulk
//! pair. Byte-oriented shifts move TDI through `DATA_SHIFT`; state walking
//! and single bits use `BIT_OP`, where each payload byte encodes the pin
//! levels for one clock phase.

use std::time::Duration;

use crate::config::Cable;
use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::{open_usb_device, JtagTransport};
use crate::util::{bit_get, bit_set};

const CMD_JTAG_INIT: u8 = 0xd0;
const CMD_JTAG_BIT_OP: u8 = 0xd2;
const CMD_JTAG_BIT_OP_RD: u8 = 0xd3;
const CMD_JTAG_DATA_SHIFT: u8 = 0xd4;
const CMD_JTAG_DATA_SHIFT_RD: u8 = 0xd5;

// Pin bits inside a BIT_OP payload byte.
const PIN_TCK: u8 = 1 << 0;
const PIN_TMS: u8 = 1 << 1;
const PIN_TDI: u8 = 1 << 4;
const PIN_TDO: u8 = 1 << 7;

const EP_OUT: u8 = 0x06;
const EP_IN: u8 = 0x86;
const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum payload bytes per command frame.
const MAX_FRAME: usize = 507;

/// CH347 JTAG probe.
pub struct Ch347Jtag {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    clk_hz: u32,
    /// TMS/TDI levels held between operations.
    level: u8,
}

impl Ch347Jtag {
    /// Opens the bridge and selects the slowest JTAG clock.
    pub fn open(cable: &Cable) -> Result<Self> {
        let handle = open_usb_device(cable.vid, cable.pid, 2)?;
        let mut probe = Self {
            handle,
            clk_hz: 0,
            level: 0,
        };
        probe.set_clock(6_000_000)?;
        Ok(probe)
    }

    fn command(&mut self, opcode: u8, payload: &[u8], response: Option<&mut [u8]>) -> Result<()> {
        let mut frame = Vec::with_capacity(3 + payload.len());
        frame.push(opcode);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        self.handle.write_bulk(EP_OUT, &frame, USB_TIMEOUT)?;

        if let Some(response) = response {
            let mut packet = vec![0u8; 3 + response.len() + 16];
            let n = self.handle.read_bulk(EP_IN, &mut packet, USB_TIMEOUT)?;
            if n < 3 + response.len() {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortRead {
                        expected: 3 + response.len(),
                        read: n,
                    },
                    context: "ch347 response",
                });
            }
            response.copy_from_slice(&packet[3..3 + response.len()]);
        }
        Ok(())
    }

    /// One clock period via BIT_OP: low phase then high phase, optionally
    /// sampling TDO on the rising edge.
    fn clock_bits(&mut self, pairs: &[(bool, bool)], capture: Option<&mut [u8]>) -> Result<()> {
        let mut payload = Vec::with_capacity(pairs.len() * 2);
        for (tms, tdi) in pairs {
            let mut level = 0u8;
            if *tms {
                level |= PIN_TMS;
            }
            if *tdi {
                level |= PIN_TDI;
            }
            self.level = level;
            payload.push(level);
            payload.push(level | PIN_TCK);
        }

        match capture {
            Some(out) => {
                let mut echo = vec![0u8; payload.len()];
                self.command(CMD_JTAG_BIT_OP_RD, &payload, Some(&mut echo))?;
                for (i, states) in echo.chunks(2).enumerate() {
                    bit_set(out, i, states[1] & PIN_TDO != 0);
                }
            }
            None => self.command(CMD_JTAG_BIT_OP, &payload, None)?,
        }
        Ok(())
    }
}

impl JtagTransport for Ch347Jtag {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        // The bridge exposes discrete rates, index 0..=5 doubling from
        // about 1.875 MHz.
        let rates = [1_875_000u32, 3_750_000, 7_500_000, 15_000_000, 30_000_000, 60_000_000];
        let index = rates
            .iter()
            .rposition(|r| *r <= hz)
            .unwrap_or(0);
        self.command(CMD_JTAG_INIT, &[0, index as u8, 0, 0, 0, 0], None)?;
        self.clk_hz = rates[index];
        Ok(self.clk_hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        let tdi = self.level & PIN_TDI != 0;
        let pairs: Vec<(bool, bool)> = (0..bits).map(|i| (bit_get(tms, i), tdi)).collect();
        for chunk in pairs.chunks(MAX_FRAME / 2) {
            self.clock_bits(chunk, None)?;
        }
        Ok(())
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()> {
        if bits == 0 {
            return Ok(());
        }
        let body_bits = if end_is_tms { bits - 1 } else { bits };
        let full_bytes = body_bits / 8;

        let mut rx = rx;
        let capture = rx.is_some();

        // Byte-aligned bulk of the payload through DATA_SHIFT.
        let mut offset = 0usize;
        while offset < full_bytes {
            let chunk = (full_bytes - offset).min(MAX_FRAME);
            let mut payload = vec![0xffu8; chunk];
            if let Some(tx) = tx {
                payload.copy_from_slice(&tx[offset..offset + chunk]);
            }
            if capture {
                let mut part = vec![0u8; chunk];
                self.command(CMD_JTAG_DATA_SHIFT_RD, &payload, Some(&mut part))?;
                if let Some(rx) = rx.as_deref_mut() {
                    rx[offset..offset + chunk].copy_from_slice(&part);
                }
            } else {
                self.command(CMD_JTAG_DATA_SHIFT, &payload, None)?;
            }
            offset += chunk;
        }

        // Remaining bits (and the TMS-coupled final bit) go bit by bit.
        let mut pairs = Vec::new();
        for i in full_bytes * 8..bits {
            let tdi = tx.map(|t| bit_get(t, i)).unwrap_or(true);
            let tms = end_is_tms && i == bits - 1;
            pairs.push((tms, tdi));
        }
        if !pairs.is_empty() {
            if capture {
                let mut tail = vec![0u8; pairs.len().div_ceil(8)];
                self.clock_bits(&pairs, Some(&mut tail))?;
                if let Some(rx) = rx.as_deref_mut() {
                    for (i, _) in pairs.iter().enumerate() {
                        bit_set(rx, full_bytes * 8 + i, bit_get(&tail, i));
                    }
                }
            } else {
                self.clock_bits(&pairs, None)?;
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        let pairs = vec![(tms, tdi); cycles as usize];
        for chunk in pairs.chunks(MAX_FRAME / 2) {
            self.clock_bits(chunk, None)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        MAX_FRAME
    }
}
