//! Xilinx Virtual Cable client: tunnels shifts to a remote `xvcServer`
//! over TCP with the `shift:<len><tms><tdi>` framing.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::JtagTransport;
use crate::util::bit_get;

/// XVC 1.0 client transport.
pub struct XvcClient {
    stream: TcpStream,
    /// Server-advertised vector limit in bytes.
    max_vector: usize,
    clk_hz: u32,
}

impl XvcClient {
    /// Connects and runs `getinfo:` to learn the server's buffer size.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            stream,
            max_vector: 2048,
            clk_hz: 10_000_000,
        };

        client.stream.write_all(b"getinfo:")?;
        let mut info = [0u8; 64];
        let n = client.stream.read(&mut info)?;
        let reply = String::from_utf8_lossy(&info[..n]);
        if let Some(size) = reply.trim_end().rsplit(':').next() {
            if let Ok(size) = size.parse::<usize>() {
                client.max_vector = size;
            }
        }
        tracing::debug!("XVC server: {} ({} byte vectors)", reply.trim(), client.max_vector);
        Ok(client)
    }

    /// One `shift:` transaction; both vectors must hold `bits`.
    fn shift(&mut self, tms: &[u8], tdi: &[u8], tdo: &mut [u8], bits: usize) -> Result<()> {
        let nr_bytes = bits.div_ceil(8);
        let mut request = Vec::with_capacity(10 + nr_bytes * 2);
        request.extend_from_slice(b"shift:");
        request.extend_from_slice(&(bits as u32).to_le_bytes());
        request.extend_from_slice(&tms[..nr_bytes]);
        request.extend_from_slice(&tdi[..nr_bytes]);
        self.stream.write_all(&request)?;

        let mut filled = 0usize;
        while filled < nr_bytes {
            let n = self.stream.read(&mut tdo[filled..nr_bytes])?;
            if n == 0 {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortRead {
                        expected: nr_bytes,
                        read: filled,
                    },
                    context: "xvc shift reply",
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Splits an arbitrarily long vector pair into server-sized shifts.
    fn shift_chunked(
        &mut self,
        tms: &[bool],
        tdi: &[bool],
        mut rx: Option<&mut [u8]>,
    ) -> Result<()> {
        let max_bits = (self.max_vector / 2) * 8;
        let mut done = 0usize;
        while done < tms.len() {
            let chunk = (tms.len() - done).min(max_bits);
            let nr_bytes = chunk.div_ceil(8);
            let mut tms_vec = vec![0u8; nr_bytes];
            let mut tdi_vec = vec![0u8; nr_bytes];
            for i in 0..chunk {
                crate::util::bit_set(&mut tms_vec, i, tms[done + i]);
                crate::util::bit_set(&mut tdi_vec, i, tdi[done + i]);
            }
            let mut tdo = vec![0u8; nr_bytes];
            self.shift(&tms_vec, &tdi_vec, &mut tdo, chunk)?;
            if let Some(rx) = rx.as_deref_mut() {
                for i in 0..chunk {
                    crate::util::bit_set(rx, done + i, bit_get(&tdo, i));
                }
            }
            done += chunk;
        }
        Ok(())
    }
}

impl JtagTransport for XvcClient {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        let period_ns = 1_000_000_000u32 / hz.max(1);
        let mut request = Vec::with_capacity(11);
        request.extend_from_slice(b"settck:");
        request.extend_from_slice(&period_ns.to_le_bytes());
        self.stream.write_all(&request)?;
        let mut reply = [0u8; 4];
        self.stream.read_exact(&mut reply)?;
        let actual_period = u32::from_le_bytes(reply).max(1);
        self.clk_hz = 1_000_000_000 / actual_period;
        Ok(self.clk_hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        let tms_bits: Vec<bool> = (0..bits).map(|i| bit_get(tms, i)).collect();
        let tdi_bits = vec![false; bits];
        self.shift_chunked(&tms_bits, &tdi_bits, None)
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()> {
        let tdi_bits: Vec<bool> = (0..bits)
            .map(|i| tx.map(|t| bit_get(t, i)).unwrap_or(true))
            .collect();
        let mut tms_bits = vec![false; bits];
        if end_is_tms {
            tms_bits[bits - 1] = true;
        }
        self.shift_chunked(&tms_bits, &tdi_bits, rx)
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        let tms_bits = vec![tms; cycles as usize];
        let tdi_bits = vec![tdi; cycles as usize];
        self.shift_chunked(&tms_bits, &tdi_bits, None)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.max_vector
    }

    fn write_tms_tdi(
        &mut self,
        tms: &[u8],
        tdi: &[u8],
        tdo: &mut [u8],
        bits: usize,
    ) -> Result<()> {
        // The native primitive: forward as-is.
        let tms_bits: Vec<bool> = (0..bits).map(|i| bit_get(tms, i)).collect();
        let tdi_bits: Vec<bool> = (0..bits).map(|i| bit_get(tdi, i)).collect();
        self.shift_chunked(&tms_bits, &tdi_bits, Some(tdo))
    }
}
