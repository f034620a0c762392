//! Xilinx Virtual Cable 1.0 server.
//!
//! Serves `getinfo:`, `settck:` and `shift:` over TCP, forwarding shifts to
//! the local probe. One client at a time; the accept loop owns the socket
//! and the transport is never shared.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::probe::JtagTransport;

const VECTOR_BUFFER_SIZE: usize = 2048;

/// The XVC server; owns the transport for its lifetime.
pub struct XvcServer {
    listener: TcpListener,
    transport: Box<dyn JtagTransport>,
}

impl XvcServer {
    /// Binds `port` on all interfaces.
    pub fn bind(port: u16, transport: Box<dyn JtagTransport>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        tracing::info!("XVC server listening on :{port}");
        Ok(Self {
            listener,
            transport,
        })
    }

    /// Accepts clients forever, one at a time.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            tracing::info!("XVC client {peer}");
            stream.set_nodelay(true)?;
            match serve_client(stream, self.transport.as_mut()) {
                Ok(()) => tracing::info!("XVC client {peer} disconnected"),
                Err(e) => tracing::warn!("XVC client {peer}: {e}"),
            }
        }
    }

    /// Serves exactly one client connection; used by the CLI's `--xvc`
    /// one-shot mode and by tests.
    pub fn serve_one(&mut self) -> Result<()> {
        let (stream, _) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        serve_client(stream, self.transport.as_mut())
    }

    /// The bound local port (useful when binding port 0).
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }
}

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Handles one client until it disconnects.
pub fn serve_client(mut stream: TcpStream, transport: &mut dyn JtagTransport) -> Result<()> {
    loop {
        let mut cmd = [0u8; 2];
        if !read_exact(&mut stream, &mut cmd)? {
            return Ok(());
        }

        match &cmd {
            b"ge" => {
                // Remainder of "getinfo:"
                let mut rest = [0u8; 6];
                read_exact(&mut stream, &mut rest)?;
                let info = format!("xvcServer_v1.0:{VECTOR_BUFFER_SIZE}\n");
                stream.write_all(info.as_bytes())?;
            }
            b"se" => {
                // Remainder of "settck:" plus the 4-byte period.
                let mut rest = [0u8; 9];
                read_exact(&mut stream, &mut rest)?;
                let period = u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]);
                if period > 0 {
                    let hz = 1_000_000_000u32 / period;
                    let actual = transport.set_clock(hz)?;
                    tracing::debug!("settck {period} ns -> {actual} Hz");
                }
                stream.write_all(&rest[5..9])?;
            }
            b"sh" => {
                // Remainder of "shift:"
                let mut rest = [0u8; 4];
                read_exact(&mut stream, &mut rest)?;

                let mut len_bytes = [0u8; 4];
                if !read_exact(&mut stream, &mut len_bytes)? {
                    return Err(Error::timeout("xvc shift length"));
                }
                let bits = u32::from_le_bytes(len_bytes) as usize;
                let nr_bytes = bits.div_ceil(8);
                if nr_bytes * 2 > VECTOR_BUFFER_SIZE {
                    return Err(Error::BufferTooSmall {
                        needed: nr_bytes * 2,
                        have: VECTOR_BUFFER_SIZE,
                    });
                }

                let mut vectors = vec![0u8; nr_bytes * 2];
                if !read_exact(&mut stream, &mut vectors)? {
                    return Err(Error::timeout("xvc shift vectors"));
                }
                let (tms, tdi) = vectors.split_at(nr_bytes);

                let mut tdo = vec![0u8; nr_bytes];
                transport.write_tms_tdi(tms, tdi, &mut tdo, bits)?;
                stream.write_all(&tdo)?;
            }
            other => {
                return Err(Error::Parse(format!(
                    "invalid XVC command {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockTransport;
    use std::net::TcpStream;

    fn roundtrip(requests: &[&[u8]]) -> (Vec<Vec<u8>>, crate::probe::mock::MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut server = XvcServer::bind(0, Box::new(probe)).unwrap();
        let port = server.local_port().unwrap();

        let requests: Vec<Vec<u8>> = requests.iter().map(|r| r.to_vec()).collect();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let mut replies = Vec::new();
            for request in requests {
                stream.write_all(&request).unwrap();
                let mut reply = vec![0u8; 64];
                let n = stream.read(&mut reply).unwrap();
                reply.truncate(n);
                replies.push(reply);
            }
            replies
        });

        server.serve_one().unwrap();
        (client.join().unwrap(), handle)
    }

    #[test]
    fn getinfo_reports_buffer_size() {
        let (replies, _) = roundtrip(&[b"getinfo:"]);
        assert_eq!(replies[0], b"xvcServer_v1.0:2048\n");
    }

    #[test]
    fn settck_echoes_period() {
        let mut request = b"settck:".to_vec();
        request.extend_from_slice(&100u32.to_le_bytes());
        let (replies, mock) = roundtrip(&[&request]);
        assert_eq!(replies[0], 100u32.to_le_bytes());
        // 100 ns -> 10 MHz
        assert_eq!(mock.borrow().clock_hz, 10_000_000);
    }

    /// A 32-bit shift forwards the TMS/TDI vectors untouched and returns
    /// 4 bytes of TDO in the client's bit order.
    #[test]
    fn shift_forwards_vectors() {
        let mut request = b"shift:".to_vec();
        request.extend_from_slice(&32u32.to_le_bytes());
        request.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // TMS
        request.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // TDI
        let (replies, mock) = roundtrip(&[&request]);

        // Mock loops TDI back to TDO when no canned bytes are queued.
        assert_eq!(replies[0], vec![0xde, 0xad, 0xbe, 0xef]);

        let m = mock.borrow();
        assert_eq!(m.tms_log.len(), 32);
        assert!(m.tms_log.iter().all(|b| !b));
        let tdi: Vec<bool> = (0..32)
            .map(|i| (u32::from_le_bytes([0xde, 0xad, 0xbe, 0xef]) >> i) & 1 != 0)
            .collect();
        assert_eq!(m.tdi_bits, tdi);
    }
}
