//! OpenOCD `remote_bitbang` client.
//!
//! ASCII protocol: `'0'..'7'` encode one TCK/TMS/TDI triple, `R` samples
//! TDO, `Q` quits. Writes batch until a read forces a round trip.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::{Error, Result, TransportErrorKind};
use crate::probe::JtagTransport;
use crate::util::{bit_get, bit_set};

/// Remote bit-bang transport.
pub struct RemoteBitbang {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl RemoteBitbang {
    /// Connects to `host:port`.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buffer: Vec::with_capacity(4096),
        })
    }

    fn encode(tck: bool, tms: bool, tdi: bool) -> u8 {
        b'0' + ((tck as u8) << 2 | (tms as u8) << 1 | tdi as u8)
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        if self.buffer.len() + 1 >= 4096 {
            self.send()?;
        }
        self.buffer.push(byte);
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.stream.write_all(&buffer)?;
        Ok(())
    }

    /// One full clock with an optional TDO sample on the high phase.
    fn clock(&mut self, tms: bool, tdi: bool, read: bool) -> Result<Option<bool>> {
        self.push(Self::encode(false, tms, tdi))?;
        self.push(Self::encode(true, tms, tdi))?;
        if !read {
            return Ok(None);
        }
        self.push(b'R')?;
        self.send()?;
        let mut reply = [0u8; 1];
        let n = self.stream.read(&mut reply)?;
        if n == 0 {
            return Err(Error::Transport {
                kind: TransportErrorKind::Disconnected,
                context: "remote_bitbang read",
            });
        }
        Ok(Some(reply[0] == b'1'))
    }
}

impl JtagTransport for RemoteBitbang {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        // The remote end sets its own pace.
        Ok(hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        for i in 0..bits {
            self.clock(bit_get(tms, i), false, false)?;
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
        let mut rx = rx;
        for i in 0..bits {
            let tdi = tx.map(|t| bit_get(t, i)).unwrap_or(true);
            let tms = end_is_tms && i == bits - 1;
            let sample = self.clock(tms, tdi, rx.is_some())?;
            if let (Some(rx), Some(bit)) = (rx.as_deref_mut(), sample) {
                bit_set(rx, i, bit);
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        for _ in 0..cycles {
            self.clock(tms, tdi, false)?;
        }
        self.send()
    }

    fn flush(&mut self) -> Result<()> {
        self.send()
    }

    fn buffer_size(&self) -> usize {
        4096
    }
}

impl Drop for RemoteBitbang {
    fn drop(&mut self) {
        let _ = self.send();
        let _ = self.stream.write_all(b"Q");
    }
}
