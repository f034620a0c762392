//! CMSIS-DAP probes over HID.
//!
//! JTAG runs through `DAP_JTAG_Sequence`: each sequence element clocks up
//! to 64 bits with a fixed TMS level and optional TDO capture. Reports are
//! padded to the HID packet size; responses echo the command byte followed
//! by a status byte.

use crate::config::Cable;
use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::JtagTransport;
use crate::util::{bit_get, bit_set};

const DAP_INFO: u8 = 0x00;
const DAP_CONNECT: u8 = 0x02;
const DAP_DISCONNECT: u8 = 0x03;
const DAP_SWJ_CLOCK: u8 = 0x11;
const DAP_SWJ_SEQUENCE: u8 = 0x12;
const DAP_JTAG_SEQUENCE: u8 = 0x14;

const DAP_OK: u8 = 0x00;
const CONNECT_JTAG: u8 = 0x02;

const INFO_PACKET_SIZE: u8 = 0xff;

// Sequence info byte layout.
const SEQ_TMS: u8 = 1 << 6;
const SEQ_TDO_CAPTURE: u8 = 1 << 7;

/// CMSIS-DAP HID probe.
pub struct CmsisDap {
    device: hidapi::HidDevice,
    packet_size: usize,
    clk_hz: u32,
}

impl CmsisDap {
    /// Opens the first HID interface matching the cable and connects in
    /// JTAG mode.
    pub fn open(cable: &Cable) -> Result<Self> {
        let api = hidapi::HidApi::new()?;
        let device = api.open(cable.vid, cable.pid)?;

        let mut probe = Self {
            device,
            packet_size: 64,
            clk_hz: 1_000_000,
        };

        // Ask the probe for its real packet size before anything else.
        let info = probe.command(DAP_INFO, &[INFO_PACKET_SIZE])?;
        if info.len() >= 3 && info[0] == 2 {
            probe.packet_size = u16::from_le_bytes([info[1], info[2]]) as usize;
        }

        let reply = probe.command(DAP_CONNECT, &[CONNECT_JTAG])?;
        if reply.first() != Some(&CONNECT_JTAG) {
            return Err(Error::SoftFail(
                "probe refused to connect in JTAG mode".into(),
            ));
        }
        probe.set_clock(1_000_000)?;
        Ok(probe)
    }

    /// One command/response exchange; returns the payload after the echoed
    /// command byte.
    fn command(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        // Report id 0 + command + payload, padded to the packet size.
        let mut report = vec![0u8; self.packet_size + 1];
        report[1] = cmd;
        report[2..2 + payload.len()].copy_from_slice(payload);
        self.device.write(&report)?;

        let mut response = vec![0u8; self.packet_size];
        let n = self.device.read_timeout(&mut response, 5000)?;
        if n == 0 || response[0] != cmd {
            return Err(Error::Transport {
                kind: TransportErrorKind::Timeout,
                context: "cmsis-dap response",
            });
        }
        response.truncate(n);
        response.remove(0);
        Ok(response)
    }

    /// Runs one JTAG sequence batch: `(tms, bits, tdi_bits, capture)`.
    fn jtag_sequence(
        &mut self,
        sequences: &[(bool, usize, Vec<u8>, bool)],
    ) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.packet_size);
        payload.push(sequences.len() as u8);
        for (tms, bits, tdi, capture) in sequences {
            let mut info = (*bits & 0x3f) as u8; // 64 encodes as 0
            if *tms {
                info |= SEQ_TMS;
            }
            if *capture {
                info |= SEQ_TDO_CAPTURE;
            }
            payload.push(info);
            payload.extend_from_slice(&tdi[..bits.div_ceil(8)]);
        }

        let reply = self.command(DAP_JTAG_SEQUENCE, &payload)?;
        if reply.first() != Some(&DAP_OK) {
            return Err(Error::Transport {
                kind: TransportErrorKind::Timeout,
                context: "DAP_JTAG_Sequence failed",
            });
        }
        Ok(reply[1..].to_vec())
    }

    /// Bytes of TDI payload that fit alongside headers in one packet.
    fn chunk_budget(&self) -> usize {
        self.packet_size.saturating_sub(4)
    }
}

impl JtagTransport for CmsisDap {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        let reply = self.command(DAP_SWJ_CLOCK, &hz.to_le_bytes())?;
        if reply.first() != Some(&DAP_OK) {
            return Err(Error::SoftFail(format!("probe rejected {hz} Hz")));
        }
        self.clk_hz = hz;
        Ok(self.clk_hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        // SWJ_Sequence clocks raw TMS bits, which is exactly a TMS walk.
        let mut sent = 0usize;
        while sent < bits {
            let chunk = (bits - sent).min(256);
            let mut payload = Vec::with_capacity(2 + chunk.div_ceil(8));
            payload.push((chunk & 0xff) as u8); // 256 encodes as 0
            let mut packed = vec![0u8; chunk.div_ceil(8)];
            for i in 0..chunk {
                bit_set(&mut packed, i, bit_get(tms, sent + i));
            }
            payload.extend_from_slice(&packed);
            let reply = self.command(DAP_SWJ_SEQUENCE, &payload)?;
            if reply.first() != Some(&DAP_OK) {
                return Err(Error::Transport {
                    kind: TransportErrorKind::Timeout,
                    context: "DAP_SWJ_Sequence failed",
                });
            }
            sent += chunk;
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

        let mut rx = rx;
        let mut done = 0usize;
        while done < body_bits {
            let chunk = (body_bits - done).min(self.chunk_budget() * 8).min(64);
            let mut tdi = vec![0xffu8; chunk.div_ceil(8)];
            if let Some(tx) = tx {
                for i in 0..chunk {
                    bit_set(&mut tdi, i, bit_get(tx, done + i));
                }
            }
            let reply = self.jtag_sequence(&[(false, chunk, tdi, capture)])?;
            if let Some(rx) = rx.as_deref_mut() {
                for i in 0..chunk {
                    bit_set(rx, done + i, bit_get(&reply, i));
                }
            }
            done += chunk;
        }

        if end_is_tms {
            let last = tx.map(|t| bit_get(t, bits - 1)).unwrap_or(true);
            let tdi = vec![if last { 0x01 } else { 0x00 }];
            let reply = self.jtag_sequence(&[(true, 1, tdi, capture)])?;
            if let Some(rx) = rx.as_deref_mut() {
                bit_set(rx, bits - 1, !reply.is_empty() && reply[0] & 1 != 0);
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        let mut remaining = cycles as usize;
        while remaining > 0 {
            let chunk = remaining.min(64);
            let fill = if tdi { 0xffu8 } else { 0x00 };
            let payload = vec![fill; chunk.div_ceil(8)];
            self.jtag_sequence(&[(tms, chunk, payload, false)])?;
            remaining -= chunk;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.packet_size
    }
}

impl Drop for CmsisDap {
    fn drop(&mut self) {
        let _ = self.command(DAP_DISCONNECT, &[]);
    }
}
