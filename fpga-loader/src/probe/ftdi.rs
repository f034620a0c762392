//! Minimal FTDI driver over rusb: reset, bit modes, baud/latency plumbing
//! and bulk transfers with the status-byte framing stripped.

use std::time::{Duration, Instant};

use crate::error::{Error, Result, TransportErrorKind};

// Vendor requests.
const SIO_RESET: u8 = 0x00;
const SIO_SET_BAUDRATE: u8 = 0x03;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0b;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// FTDI pin/bit modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    /// Reset back to serial.
    Reset = 0x00,
    /// Asynchronous bit-bang.
    Bitbang = 0x01,
    /// MPSSE engine (FT2232/FT232H).
    Mpsse = 0x02,
    /// Synchronous bit-bang (reads sample written bytes).
    SyncBb = 0x04,
}

/// One claimed FTDI interface.
pub struct FtdiDevice {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    /// FTDI interface index, 1-based (A=1).
    index: u16,
    ep_in: u8,
    ep_out: u8,
    max_packet: usize,
    /// bcdDevice, identifies the chip generation.
    bcd_device: u16,
}

impl FtdiDevice {
    /// Opens `vid:pid`, optionally filtered by serial string, and claims
    /// interface `interface` (1..=4).
    pub fn open(vid: u16, pid: u16, interface: u8, serial: Option<&str>) -> Result<Self> {
        for device in rusb::devices()?.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() != vid || desc.product_id() != pid {
                continue;
            }
            let handle = device.open()?;
            if let Some(wanted) = serial {
                let got = desc
                    .serial_number_string_index()
                    .and_then(|i| handle.read_string_descriptor_ascii(i).ok());
                if got.as_deref() != Some(wanted) {
                    continue;
                }
            }

            let iface = interface.clamp(1, 4) as u16;
            let claim = (iface - 1) as u8;
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(claim)?;

            // Endpoint numbering is fixed per interface.
            let ep_out = 0x02 + 2 * (iface as u8 - 1);
            let ep_in = 0x81 + 2 * (iface as u8 - 1);

            let max_packet = device
                .active_config_descriptor()
                .ok()
                .and_then(|c| {
                    c.interfaces()
                        .nth(claim as usize)
                        .and_then(|i| i.descriptors().next())
                        .and_then(|d| d.endpoint_descriptors().next().map(|e| e.max_packet_size()))
                })
                .unwrap_or(512) as usize;

            let version = desc.device_version();
            let bcd_device = (u16::from(version.major()) << 8)
                | (u16::from(version.minor()) << 4)
                | u16::from(version.sub_minor());
            tracing::debug!(
                "FTDI {vid:04x}:{pid:04x} interface {iface} bcdDevice {bcd_device:04x}"
            );
            return Ok(Self {
                handle,
                index: iface,
                ep_in,
                ep_out,
                max_packet,
                bcd_device,
            });
        }
        Err(Error::SoftFail(format!(
            "no FTDI device {vid:04x}:{pid:04x} found"
        )))
    }

    fn control(&self, request: u8, value: u16) -> Result<()> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.handle
            .write_control(request_type, request, value, self.index, &[], USB_TIMEOUT)?;
        Ok(())
    }

    /// Full port reset.
    pub fn usb_reset(&mut self) -> Result<()> {
        self.control(SIO_RESET, SIO_RESET_SIO)
    }

    /// Drops both FIFO directions.
    pub fn purge_buffers(&mut self) -> Result<()> {
        self.control(SIO_RESET, SIO_RESET_PURGE_RX)?;
        self.control(SIO_RESET, SIO_RESET_PURGE_TX)
    }

    /// Selects a bit mode; `mask` sets the output pins for bit-bang modes.
    pub fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        self.control(SIO_SET_BITMODE, ((mode as u16) << 8) | mask as u16)
    }

    /// Read-latency timer in milliseconds; 1 keeps turnaround tight.
    pub fn set_latency_timer(&mut self, ms: u8) -> Result<()> {
        self.control(SIO_SET_LATENCY_TIMER, ms as u16)
    }

    /// Baud rate for bit-bang modes (the byte clock runs at 16x this).
    pub fn set_baudrate(&mut self, encoded_divisor: u16) -> Result<()> {
        self.control(SIO_SET_BAUDRATE, encoded_divisor)
    }

    /// True on the 60 MHz-core parts (FT2232H/FT4232H/FT232H).
    pub fn is_h_series(&self) -> bool {
        matches!(self.bcd_device, 0x0700 | 0x0800 | 0x0900)
    }

    /// Transmit FIFO size for chunking.
    pub fn tx_fifo_size(&self) -> usize {
        match self.bcd_device {
            0x0700 | 0x0900 => 4096,
            0x0800 => 2048,
            _ => 128,
        }
    }

    /// Bulk-writes the whole buffer.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let n = self
                .handle
                .write_bulk(self.ep_out, &data[written..], USB_TIMEOUT)?;
            if n == 0 {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortWrite {
                        expected: data.len(),
                        written,
                    },
                    context: "ftdi bulk write",
                });
            }
            written += n;
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` payload bytes, stripping the two modem
    /// status bytes leading every packet. Short reads retry until the
    /// timeout elapses.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0usize;
        let mut packet = vec![0u8; self.max_packet];
        let deadline = Instant::now() + USB_TIMEOUT;

        while filled < buf.len() {
            let n = self
                .handle
                .read_bulk(self.ep_in, &mut packet, Duration::from_millis(100))
                .unwrap_or(0);
            if n > 2 {
                let payload = &packet[2..n];
                let take = payload.len().min(buf.len() - filled);
                buf[filled..filled + take].copy_from_slice(&payload[..take]);
                filled += take;
            }
            if Instant::now() > deadline {
                return Err(Error::Transport {
                    kind: TransportErrorKind::ShortRead {
                        expected: buf.len(),
                        read: filled,
                    },
                    context: "ftdi bulk read",
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FtdiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtdiDevice")
            .field("interface", &self.index)
            .field("bcd_device", &self.bcd_device)
            .finish_non_exhaustive()
    }
}
