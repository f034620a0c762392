//! Gowin GWU2X bridge: an MPSSE-flavoured opcode set over plain bulk
//! endpoints. TMS runs carry the held TDI level in bit 7, TDI moves in
//! LSB-first bytes with separate write-only and read-write opcodes, and a
//! dedicated burst opcode idles TCK.

use std::time::Duration;

use crate::config::Cable;
use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::{open_usb_device, JtagTransport};
use crate::util::{bit_get, bit_set};

const TMS_LSB_WRO: u8 = 0x5b;
const TCK_BURST: u8 = 0x9b;
const TDI_LSB_BIT_WRO: u8 = 0x6b;
const TDI_LSB_BIT_RDWR: u8 = 0x6c;
const TDI_LSB_BYTE_WRO: u8 = 0x7b;
const TDI_LSB_BYTE_RDWR: u8 = 0x7c;
const SET_FREQ_FAST: u8 = 0xab;
const SET_FREQ_SLOW: u8 = 0xac;
const READBACK_BUFFER: u8 = 0xdb;
const READBACK_LSB: u8 = 0x11;

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;
const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// GWU2X JTAG probe.
pub struct GwU2x {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    buffer: Vec<u8>,
    curr_tdi: bool,
    clk_hz: u32,
}

impl GwU2x {
    /// Opens the bridge.
    pub fn open(cable: &Cable) -> Result<Self> {
        let handle = open_usb_device(cable.vid, cable.pid, 0)?;
        Ok(Self {
            handle,
            buffer: Vec::with_capacity(4096),
            curr_tdi: false,
            clk_hz: 2_000_000,
        })
    }

    fn queue(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buffer.len() + bytes.len() >= 4096 {
            self.send()?;
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        let n = self.handle.write_bulk(EP_OUT, &buffer, USB_TIMEOUT)?;
        if n != buffer.len() {
            return Err(Error::Transport {
                kind: TransportErrorKind::ShortWrite {
                    expected: buffer.len(),
                    written: n,
                },
                context: "gwu2x write",
            });
        }
        Ok(())
    }

    fn read_back(&mut self, out: &mut [u8]) -> Result<()> {
        // Ask the bridge to dump its capture buffer LSB-first.
        self.queue(&[READBACK_BUFFER, READBACK_LSB])?;
        self.send()?;
        let mut filled = 0usize;
        while filled < out.len() {
            let mut packet = [0u8; 512];
            let n = self.handle.read_bulk(EP_IN, &mut packet, USB_TIMEOUT)?;
            if n == 0 {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortRead {
                        expected: out.len(),
                        read: filled,
                    },
                    context: "gwu2x read",
                });
            }
            let take = n.min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&packet[..take]);
            filled += take;
        }
        Ok(())
    }
}

impl JtagTransport for GwU2x {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        let (op, actual) = if hz >= 2_000_000 {
            (SET_FREQ_FAST, 2_000_000)
        } else {
            (SET_FREQ_SLOW, 500_000)
        };
        self.queue(&[op])?;
        self.send()?;
        self.clk_hz = actual;
        Ok(self.clk_hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        let tdi_bit = if self.curr_tdi { 0x80u8 } else { 0 };
        let mut sent = 0usize;
        while sent < bits {
            let group = (bits - sent).min(6);
            let mut byte = tdi_bit;
            for i in 0..group {
                if bit_get(tms, sent + i) {
                    byte |= 1 << i;
                }
            }
            self.queue(&[TMS_LSB_WRO, (group - 1) as u8, byte])?;
            sent += group;
        }
        if flush {
            self.send()?;
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
        let capture = rx.is_some();
        let body_bits = if end_is_tms { bits - 1 } else { bits };
        let full_bytes = body_bits / 8;
        let tail_bits = body_bits % 8;

        let mut read_bytes = 0usize;

        let mut offset = 0usize;
        while offset < full_bytes {
            let chunk = (full_bytes - offset).min(2048);
            let op = if capture {
                TDI_LSB_BYTE_RDWR
            } else {
                TDI_LSB_BYTE_WRO
            };
            let len = (chunk - 1) as u16;
            self.queue(&[op, len as u8, (len >> 8) as u8])?;
            let mut payload = vec![0xffu8; chunk];
            if let Some(tx) = tx {
                payload.copy_from_slice(&tx[offset..offset + chunk]);
            }
            self.queue(&payload)?;
            if capture {
                read_bytes += chunk;
            }
            offset += chunk;
        }

        if tail_bits > 0 {
            let op = if capture {
                TDI_LSB_BIT_RDWR
            } else {
                TDI_LSB_BIT_WRO
            };
            let byte = tx.map(|t| t[full_bytes]).unwrap_or(0xff);
            self.queue(&[op, (tail_bits - 1) as u8, byte])?;
            if capture {
                read_bytes += 1;
            }
        }

        if end_is_tms {
            let last = tx.map(|t| bit_get(t, bits - 1)).unwrap_or(true);
            self.curr_tdi = last;
            // TMS high for the final bit, TDI level in bit 7.
            let byte = 0x01 | if last { 0x80 } else { 0 };
            self.queue(&[TMS_LSB_WRO, 0x00, byte])?;
        } else if let Some(tx) = tx {
            self.curr_tdi = bit_get(tx, bits - 1);
        }

        if let Some(rx) = rx {
            let mut raw = vec![0u8; read_bytes];
            self.read_back(&mut raw)?;
            let mut out_bit = 0usize;
            for (i, byte) in raw.iter().enumerate() {
                let nbits = if i < full_bytes { 8 } else { tail_bits };
                let value = if nbits == 8 { *byte } else { byte >> (8 - nbits) };
                for b in 0..nbits {
                    bit_set(rx, out_bit, (value >> b) & 1 != 0);
                    out_bit += 1;
                }
            }
            if end_is_tms {
                // The final TMS-coupled bit is not captured by the bridge.
                bit_set(rx, bits - 1, false);
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, _tms: bool, _tdi: bool, cycles: u32) -> Result<()> {
        let mut remaining = cycles;
        while remaining > 0 {
            let n = remaining.min(0x1_0000);
            let len = (n - 1) as u16;
            self.queue(&[TCK_BURST, len as u8, (len >> 8) as u8])?;
            remaining -= n;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.send()
    }

    fn buffer_size(&self) -> usize {
        4096
    }
}
