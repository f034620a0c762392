//! DirtyJTAG firmware probes (STM32 based).
//!
//! Byte-oriented `CMD_XFER` carries up to a version-specific number of
//! bits per chunk (240 on v1, 496 on later firmware, 4000 on the large
//! -buffer builds), MSB-first within each byte. Single pins move through
//! `CMD_SETSIG`.

use std::time::Duration;

use crate::config::Cable;
use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::{open_usb_device, JtagTransport};
use crate::util::{bit_get, bit_set};

const CMD_STOP: u8 = 0x00;
const CMD_INFO: u8 = 0x01;
const CMD_FREQ: u8 = 0x02;
const CMD_XFER: u8 = 0x03;
const CMD_SETSIG: u8 = 0x04;
const CMD_CLK: u8 = 0x06;
/// OR into CMD_XFER when no TDO data should come back.
const NO_READ: u8 = 0x80;

const SIG_TCK: u8 = 1 << 1;
const SIG_TDI: u8 = 1 << 2;
const SIG_TMS: u8 = 1 << 4;

const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x82;
const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// DirtyJTAG probe.
pub struct DirtyJtag {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    /// Bits per CMD_XFER chunk for the detected firmware version.
    max_bits: usize,
    clk_hz: u32,
    level: u8,
}

impl DirtyJtag {
    /// Opens the probe and asks the firmware for its version.
    pub fn open(cable: &Cable) -> Result<Self> {
        let handle = open_usb_device(cable.vid, cable.pid, 0)?;
        let mut probe = Self {
            handle,
            max_bits: 240,
            clk_hz: 1_000_000,
            level: 0,
        };

        probe.write(&[CMD_INFO, CMD_STOP])?;
        let mut info = [0u8; 64];
        let n = probe
            .handle
            .read_bulk(EP_IN, &mut info, USB_TIMEOUT)
            .unwrap_or(0);
        let version = std::str::from_utf8(&info[..n]).unwrap_or("");
        probe.max_bits = if version.contains("D5") {
            4000
        } else if version.contains("V2") || version.contains("v2") {
            496
        } else {
            240
        };
        tracing::debug!("DirtyJTAG {version:?}, {} bits per chunk", probe.max_bits);
        Ok(probe)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let n = self.handle.write_bulk(EP_OUT, data, USB_TIMEOUT)?;
        if n != data.len() {
            return Err(Error::Transport {
                kind: TransportErrorKind::ShortWrite {
                    expected: data.len(),
                    written: n,
                },
                context: "dirtyjtag write",
            });
        }
        Ok(())
    }

    fn set_signals(&mut self, mask: u8, value: u8) -> Result<()> {
        self.level = (self.level & !mask) | (value & mask);
        self.write(&[CMD_SETSIG, mask, value, CMD_STOP])
    }

    /// One XFER chunk; `bits` ≤ `max_bits`. Data is MSB-first on the wire.
    fn xfer_chunk(&mut self, bits: usize, data: &[u8], capture: Option<&mut [u8]>) -> Result<()> {
        let byte_len = bits.div_ceil(8);
        let mut packet = Vec::with_capacity(2 + byte_len + 1);
        let cmd = if capture.is_some() {
            CMD_XFER
        } else {
            CMD_XFER | NO_READ
        };
        packet.push(cmd);
        packet.push(bits as u8);
        packet.extend_from_slice(&data[..byte_len]);
        packet.push(CMD_STOP);
        self.write(&packet)?;

        if let Some(out) = capture {
            let mut reply = vec![0u8; byte_len.max(32)];
            let n = self.handle.read_bulk(EP_IN, &mut reply, USB_TIMEOUT)?;
            if n < byte_len {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortRead {
                        expected: byte_len,
                        read: n,
                    },
                    context: "dirtyjtag xfer",
                });
            }
            out[..byte_len].copy_from_slice(&reply[..byte_len]);
        }
        Ok(())
    }
}

impl JtagTransport for DirtyJtag {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        let khz = (hz / 1000).clamp(1, 65_535) as u16;
        self.write(&[CMD_FREQ, (khz >> 8) as u8, khz as u8, CMD_STOP])?;
        self.clk_hz = khz as u32 * 1000;
        Ok(self.clk_hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        let tdi = self.level & SIG_TDI;
        for i in 0..bits {
            let tms_level = if bit_get(tms, i) { SIG_TMS } else { 0 };
            self.set_signals(SIG_TMS | SIG_TCK | SIG_TDI, tms_level | tdi)?;
            self.set_signals(SIG_TCK, SIG_TCK)?;
        }
        self.set_signals(SIG_TCK, 0)
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

        // XFER shifts MSB-first, the engine speaks LSB-first: reverse per
        // byte both ways.
        let mut rx = rx;
        let mut done = 0usize;
        while done < body_bits {
            let chunk_bits = (body_bits - done).min(self.max_bits);
            let byte_len = chunk_bits.div_ceil(8);
            let mut data = vec![0xffu8; byte_len];
            if let Some(tx) = tx {
                for i in 0..chunk_bits {
                    let bit = bit_get(tx, done + i);
                    if bit {
                        data[i / 8] |= 0x80 >> (i % 8);
                    } else {
                        data[i / 8] &= !(0x80 >> (i % 8));
                    }
                }
            }
            if let Some(rx) = rx.as_deref_mut() {
                let mut reply = vec![0u8; byte_len];
                self.xfer_chunk(chunk_bits, &data, Some(&mut reply))?;
                for i in 0..chunk_bits {
                    let bit = reply[i / 8] & (0x80 >> (i % 8)) != 0;
                    bit_set(rx, done + i, bit);
                }
            } else {
                self.xfer_chunk(chunk_bits, &data, None)?;
            }
            done += chunk_bits;
        }

        if end_is_tms {
            let tdi = tx.map(|t| bit_get(t, bits - 1)).unwrap_or(true);
            let tdi_level = if tdi { SIG_TDI } else { 0 };
            self.set_signals(SIG_TMS | SIG_TDI | SIG_TCK, SIG_TMS | tdi_level)?;
            self.set_signals(SIG_TCK, SIG_TCK)?;
            if let Some(rx) = rx {
                // TDO of the final bit is not recoverable through SETSIG
                // on v1 firmware; report the stream as-is.
                bit_set(rx, bits - 1, false);
            }
            self.set_signals(SIG_TCK, 0)?;
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        let mut signals = 0u8;
        if tms {
            signals |= SIG_TMS;
        }
        if tdi {
            signals |= SIG_TDI;
        }
        let mut remaining = cycles;
        while remaining > 0 {
            let n = remaining.min(255) as u8;
            self.write(&[CMD_CLK, signals, n, CMD_STOP])?;
            remaining -= n as u32;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.max_bits / 8
    }
}
