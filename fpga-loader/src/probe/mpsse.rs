//! FTDI MPSSE JTAG transport.
//!
//! Opcode batching: commands accumulate in a host-side buffer sized to the
//! chip's FIFO; a `SEND_IMMEDIATE` tail flushes responses back. TDI bytes
//! shift LSB-first on the falling edge; TMS groups travel through the
//! dedicated `WRITE_TMS` opcode in runs of up to six bits with the held
//! TDI level in bit 7.

use crate::config::Cable;
use crate::error::{Error, Result};
use crate::probe::ftdi::{BitMode, FtdiDevice};
use crate::probe::{JtagTransport, ProbeOptions};
use crate::util::{bit_get, bit_set};

// Opcode building blocks (AN_108).
const MPSSE_WRITE_NEG: u8 = 0x01;
const MPSSE_BITMODE: u8 = 0x02;
const MPSSE_READ_NEG: u8 = 0x04;
const MPSSE_LSB: u8 = 0x08;
const MPSSE_DO_WRITE: u8 = 0x10;
const MPSSE_DO_READ: u8 = 0x20;
const MPSSE_WRITE_TMS: u8 = 0x40;

const SET_BITS_LOW: u8 = 0x80;
const SET_BITS_HIGH: u8 = 0x82;
const LOOPBACK_END: u8 = 0x85;
const TCK_DIVISOR: u8 = 0x86;
const SEND_IMMEDIATE: u8 = 0x87;
const DISABLE_CLK_DIV5: u8 = 0x8a;
const ENABLE_CLK_DIV5: u8 = 0x8b;
const CLOCK_N_CYCLES: u8 = 0x8e;
const CLOCK_N8_CYCLES: u8 = 0x8f;

/// How many TDO bits one queued response byte carries.
#[derive(Debug, Clone, Copy)]
struct PendingRead {
    bits: u8,
}

/// MPSSE-based JTAG probe (FT2232/FT232H/FT4232 and compatibles).
pub struct FtdiJtagMpsse {
    device: FtdiDevice,
    commands: Vec<u8>,
    pending: Vec<PendingRead>,
    /// Response bytes drained so far for the transfer in flight; a long
    /// shift can flush the command buffer several times mid-way.
    collected: Vec<u8>,
    buffer_size: usize,
    clk_hz: u32,
    /// TDI level held while TMS shifts.
    curr_tdi: bool,
    /// Sample TDO on the falling edge; Digilent adapters need this above
    /// 15 MHz to absorb their level-shifter delay.
    invert_read_edge: bool,
    /// Digilent-style VID/product detection for the read-edge override.
    is_digilent: bool,
    /// Some bridges (CH552) only answer when every shift also reads.
    pub(crate) force_read: bool,
    low_value: u8,
    low_dir: u8,
}

impl FtdiJtagMpsse {
    /// Opens the cable's FTDI interface and brings up the MPSSE engine
    /// with the cable's initial pin state.
    pub fn open(cable: &Cable, opts: &ProbeOptions) -> Result<Self> {
        let interface = opts
            .ftdi_channel
            .map(|c| c + 1)
            .unwrap_or(cable.mpsse.interface);
        let mut device = FtdiDevice::open(
            cable.vid,
            cable.pid,
            interface,
            opts.ftdi_serial.as_deref(),
        )?;

        device.usb_reset()?;
        device.set_bitmode(0x0b, BitMode::Mpsse)?;
        device.set_latency_timer(1)?;
        device.purge_buffers()?;

        let buffer_size = device.tx_fifo_size();
        let mut probe = Self {
            device,
            commands: Vec::with_capacity(buffer_size),
            pending: Vec::new(),
            collected: Vec::new(),
            buffer_size,
            clk_hz: 6_000_000,
            curr_tdi: false,
            invert_read_edge: false,
            is_digilent: cable.name.starts_with("digilent"),
            force_read: false,
            low_value: cable.mpsse.low_value,
            low_dir: cable.mpsse.low_dir,
        };

        probe.queue(&[
            SET_BITS_LOW,
            cable.mpsse.low_value,
            cable.mpsse.low_dir,
            SET_BITS_HIGH,
            cable.mpsse.high_value,
            cable.mpsse.high_dir,
            LOOPBACK_END,
        ])?;
        probe.flush()?;
        Ok(probe)
    }

    fn queue(&mut self, bytes: &[u8]) -> Result<()> {
        // One byte stays reserved for SEND_IMMEDIATE.
        if self.commands.len() + bytes.len() + 1 >= self.buffer_size {
            self.flush_with_reads()?;
        }
        self.commands.extend_from_slice(bytes);
        Ok(())
    }

    fn drain_reads(&mut self) -> Result<Vec<u8>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut raw = vec![0u8; self.pending.len()];
        self.device.read_data(&mut raw)?;
        Ok(raw)
    }

    /// Sends queued opcodes and appends the raw response bytes (one per
    /// pending read entry) to the accumulator.
    fn flush_with_reads(&mut self) -> Result<()> {
        if !self.commands.is_empty() {
            self.commands.push(SEND_IMMEDIATE);
            let commands = std::mem::take(&mut self.commands);
            self.device.write_data(&commands)?;
        }
        let raw = self.drain_reads()?;
        self.pending.clear();
        self.collected.extend_from_slice(&raw);
        Ok(())
    }

    fn read_opcode_bits(&self) -> u8 {
        if self.invert_read_edge {
            MPSSE_READ_NEG
        } else {
            0
        }
    }

    /// Raises the read-edge override when a Digilent adapter runs fast.
    fn update_read_edge(&mut self) {
        self.invert_read_edge = self.is_digilent && self.clk_hz >= 15_000_000;
    }

    /// Changes the ADBUS side-band pins, keeping TCK/TDI/TDO/TMS (the
    /// low nibble) exactly as the cable configured them.
    pub fn set_gpio_low(&mut self, value: u8, dir: u8) -> Result<()> {
        self.low_value = (self.low_value & 0x0f) | (value & 0xf0);
        self.low_dir = (self.low_dir & 0x0f) | (dir & 0xf0);
        let (value, dir) = (self.low_value, self.low_dir);
        self.queue(&[SET_BITS_LOW, value, dir])?;
        self.flush()
    }
}

impl JtagTransport for FtdiJtagMpsse {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        let (base, div5_cmd) = if self.device.is_h_series() {
            (30_000_000u32, DISABLE_CLK_DIV5)
        } else {
            (6_000_000u32, ENABLE_CLK_DIV5)
        };
        let divisor = (base / hz.max(1)).saturating_sub(1).min(0xffff) as u16;
        let actual = base / (divisor as u32 + 1);

        self.queue(&[
            div5_cmd,
            TCK_DIVISOR,
            divisor as u8,
            (divisor >> 8) as u8,
        ])?;
        self.flush()?;
        self.clk_hz = actual;
        self.update_read_edge();
        tracing::debug!("TCK {hz} Hz requested, {actual} Hz configured");
        Ok(actual)
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
            // Replicate the last level one position up: the engine drives
            // the state after the final clock from that bit.
            if byte & (1 << (group - 1)) != 0 {
                byte |= 1 << group;
            }
            self.queue(&[
                MPSSE_WRITE_TMS | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG,
                (group - 1) as u8,
                byte,
            ])?;
            sent += group;
        }
        if flush {
            self.flush()?;
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
        let capture = rx.is_some() || self.force_read;
        let read_bits = self.read_opcode_bits();

        // The last bit may need the TMS coupling, so keep it out of the
        // byte/bit shifts.
        let body_bits = if end_is_tms { bits - 1 } else { bits };
        let full_bytes = body_bits / 8;
        let tail_bits = body_bits % 8;

        let mut reads_expected = 0usize;

        let mut offset = 0usize;
        while offset < full_bytes {
            let chunk = (full_bytes - offset).min(self.buffer_size - 16);
            let mut op = MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_WRITE_NEG;
            if capture {
                op |= MPSSE_DO_READ | read_bits;
            }
            let len = (chunk - 1) as u16;
            self.queue(&[op, len as u8, (len >> 8) as u8])?;
            let mut payload = vec![0xffu8; chunk];
            if let Some(tx) = tx {
                payload.copy_from_slice(&tx[offset..offset + chunk]);
            }
            self.queue(&payload)?;
            if capture {
                for _ in 0..chunk {
                    self.pending.push(PendingRead { bits: 8 });
                    reads_expected += 1;
                }
            }
            offset += chunk;
        }

        if tail_bits > 0 {
            let mut op = MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG;
            if capture {
                op |= MPSSE_DO_READ | read_bits;
            }
            let mut byte = 0xffu8;
            if let Some(tx) = tx {
                byte = tx[full_bytes];
            }
            self.queue(&[op, (tail_bits - 1) as u8, byte])?;
            if capture {
                self.pending.push(PendingRead {
                    bits: tail_bits as u8,
                });
                reads_expected += 1;
            }
        }

        if end_is_tms {
            let last = tx.map(|t| bit_get(t, bits - 1)).unwrap_or(true);
            self.curr_tdi = last;
            let mut op = MPSSE_WRITE_TMS | MPSSE_LSB | MPSSE_BITMODE | MPSSE_WRITE_NEG;
            if capture {
                op |= MPSSE_DO_READ | read_bits;
            }
            let byte = 0x01u8 | if last { 0x80 } else { 0 };
            self.queue(&[op, 0x00, byte])?;
            if capture {
                self.pending.push(PendingRead { bits: 1 });
                reads_expected += 1;
            }
        } else if let Some(tx) = tx {
            self.curr_tdi = bit_get(tx, bits - 1);
        }

        if let Some(rx) = rx {
            self.flush_with_reads()?;
            let raw = std::mem::take(&mut self.collected);
            let responses = &raw[raw.len() - reads_expected..];
            // Bit responses arrive left-aligned from the MSB side.
            let mut out_bit = 0usize;
            for (byte, pending) in responses.iter().zip(
                std::iter::repeat(PendingRead { bits: 8 })
                    .take(full_bytes)
                    .chain(
                        (tail_bits > 0)
                            .then_some(PendingRead {
                                bits: tail_bits as u8,
                            })
                            .into_iter(),
                    )
                    .chain(
                        end_is_tms
                            .then_some(PendingRead { bits: 1 })
                            .into_iter(),
                    ),
            ) {
                let value = if pending.bits == 8 {
                    *byte
                } else {
                    byte >> (8 - pending.bits)
                };
                for i in 0..pending.bits as usize {
                    bit_set(rx, out_bit, (value >> i) & 1 != 0);
                    out_bit += 1;
                }
            }
        } else if self.force_read {
            // Discard the mandatory response bytes.
            self.flush_with_reads()?;
            self.collected.clear();
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, _tdi: bool, cycles: u32) -> Result<()> {
        if tms {
            // Stay in the current looped state by clocking with TMS held;
            // group through the TMS opcode.
            let tms_bytes = vec![0xffu8; cycles.div_ceil(8) as usize];
            return self.write_tms(&tms_bytes, cycles as usize, false);
        }
        let mut remaining = cycles;
        let full_bytes = remaining / 8;
        if full_bytes > 0 {
            let mut chunk = full_bytes;
            while chunk > 0 {
                let n = chunk.min(0x1_0000);
                let len = (n - 1) as u16;
                self.queue(&[CLOCK_N8_CYCLES, len as u8, (len >> 8) as u8])?;
                chunk -= n;
            }
            remaining -= full_bytes * 8;
        }
        if remaining > 0 {
            self.queue(&[CLOCK_N_CYCLES, (remaining - 1) as u8])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_with_reads()?;
        self.collected.clear();
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn is_full(&self) -> bool {
        self.commands.len() + 16 >= self.buffer_size
    }
}

impl Drop for FtdiJtagMpsse {
    fn drop(&mut self) {
        // Loopback flush: make sure everything queued reaches the probe
        // before the interface is released.
        let _ = self.flush();
        let _ = self.device.set_bitmode(0, BitMode::Reset);
    }
}
