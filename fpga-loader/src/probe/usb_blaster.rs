//! Altera USB-Blaster (I and II).
//!
//! Byte protocol: bit 7 selects shift mode (`1` = the next `count` bytes
//! are whole TDI bytes), bit 6 enables readback. In bit-bang mode the low
//! bits drive the pins directly. The Blaster II is a Cypress FX2 that
//! needs its firmware uploaded before the FT245-style interface appears.

use std::time::Duration;

use crate::config::Cable;
use crate::error::{Error, Result, TransportErrorKind};
use crate::parser::intel_hex;
use crate::probe::{open_usb_device, JtagTransport, ProbeOptions};
use crate::util::{bit_get, bit_set};

const PIN_TCK: u8 = 1 << 0;
const PIN_TMS: u8 = 1 << 1;
const PIN_NCE: u8 = 1 << 2;
const PIN_NCS: u8 = 1 << 3;
const PIN_TDI: u8 = 1 << 4;
const PIN_LED: u8 = 1 << 5;
const DO_READ: u8 = 1 << 6;
const DO_SHIFT: u8 = 1 << 7;

/// Idle level: nCE/nCS deasserted, LED on.
const DEFAULT_PINS: u8 = PIN_NCE | PIN_NCS | PIN_LED;

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;
const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// USB-Blaster probe.
pub struct UsbBlaster {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    buffer: Vec<u8>,
    /// Expected TDO bytes after the next flush.
    pending_reads: usize,
    read_data: Vec<u8>,
    curr_tdi: bool,
    /// FT245-style framing puts two status bytes in front of each packet.
    ftdi_framing: bool,
}

impl UsbBlaster {
    /// Opens the probe, uploading FX2 firmware first for a Blaster II.
    pub fn open(cable: &Cable, opts: &ProbeOptions) -> Result<Self> {
        if cable.pid == 0x6810 {
            let path = opts.firmware_path.as_deref().ok_or(Error::SoftFail(
                "USB-Blaster II needs --probe-firmware <blaster_6810.hex>".into(),
            ))?;
            load_fx2_firmware(cable.vid, cable.pid, path)?;
            // Give the device time to renumerate with the new firmware.
            std::thread::sleep(Duration::from_millis(2000));
        }

        let handle = open_usb_device(cable.vid, cable.pid, 0)?;
        let mut probe = Self {
            handle,
            buffer: Vec::with_capacity(4096),
            pending_reads: 0,
            read_data: Vec::new(),
            curr_tdi: false,
            ftdi_framing: cable.pid == 0x6001,
        };
        probe.push(DEFAULT_PINS)?;
        probe.flush()?;
        Ok(probe)
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
        let n = self.handle.write_bulk(EP_OUT, &buffer, USB_TIMEOUT)?;
        if n != buffer.len() {
            return Err(Error::Transport {
                kind: TransportErrorKind::ShortWrite {
                    expected: buffer.len(),
                    written: n,
                },
                context: "usb-blaster write",
            });
        }
        self.collect_reads()?;
        Ok(())
    }

    fn collect_reads(&mut self) -> Result<()> {
        while self.read_data.len() < self.pending_reads {
            let mut packet = [0u8; 512];
            let n = self.handle.read_bulk(EP_IN, &mut packet, USB_TIMEOUT)?;
            let payload = if self.ftdi_framing && n >= 2 {
                &packet[2..n]
            } else {
                &packet[..n]
            };
            self.read_data.extend_from_slice(payload);
        }
        Ok(())
    }

    fn bitbang(&mut self, tms: bool, tdi: bool, read: bool) -> Result<()> {
        let mut low = DEFAULT_PINS;
        if tms {
            low |= PIN_TMS;
        }
        if tdi {
            low |= PIN_TDI;
        }
        self.push(low)?;
        let mut high = low | PIN_TCK;
        if read {
            high |= DO_READ;
            self.pending_reads += 1;
        }
        self.push(high)?;
        self.curr_tdi = tdi;
        Ok(())
    }
}

impl JtagTransport for UsbBlaster {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        // The blaster clocks at a fixed rate set by its CPLD/FX2 firmware.
        let actual = hz.min(6_000_000);
        tracing::debug!("USB-Blaster clock fixed by firmware, reporting {actual} Hz");
        Ok(actual)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        let tdi = self.curr_tdi;
        for i in 0..bits {
            self.bitbang(bit_get(tms, i), tdi, false)?;
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

        self.read_data.clear();
        self.pending_reads = 0;

        // Whole bytes ride the shift mode, 63 bytes per header.
        let mut offset = 0usize;
        while offset < full_bytes {
            let chunk = (full_bytes - offset).min(63);
            let mut header = DO_SHIFT | chunk as u8;
            if capture {
                header |= DO_READ;
                self.pending_reads += chunk;
            }
            self.push(header)?;
            for i in 0..chunk {
                let byte = tx.map(|t| t[offset + i]).unwrap_or(0xff);
                self.push(byte)?;
            }
            offset += chunk;
        }

        // Tail bits and the TMS-coupled last bit in bit-bang mode.
        for i in full_bytes * 8..bits {
            let tdi = tx.map(|t| bit_get(t, i)).unwrap_or(true);
            let tms = end_is_tms && i == bits - 1;
            self.bitbang(tms, tdi, capture)?;
        }

        self.send()?;

        if let Some(rx) = rx {
            let data = std::mem::take(&mut self.read_data);
            let mut bit_pos = 0usize;
            let mut iter = data.iter();
            // Shift-mode responses are whole TDO bytes.
            for _ in 0..full_bytes {
                let byte = iter.next().copied().unwrap_or(0);
                for i in 0..8 {
                    bit_set(rx, bit_pos, (byte >> i) & 1 != 0);
                    bit_pos += 1;
                }
            }
            // Bit-bang responses carry TDO in bit 0.
            for byte in iter {
                bit_set(rx, bit_pos, byte & 0x01 != 0);
                bit_pos += 1;
                if bit_pos >= bits {
                    break;
                }
            }
        }
        self.pending_reads = 0;
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        for _ in 0..cycles {
            self.bitbang(tms, tdi, false)?;
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

// Cypress FX2 firmware upload: hold the 8051 in reset through CPUCS
// (0xE600), write the image with vendor request 0xA0, release reset.
const FX2_REQUEST_FIRMWARE: u8 = 0xa0;
const FX2_CPUCS: u16 = 0xe600;

fn load_fx2_firmware(vid: u16, pid: u16, path: &str) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let (image, start) = intel_hex::parse(&text)?;

    let handle = open_usb_device(vid, pid, 0)?;
    let request_type = rusb::request_type(
        rusb::Direction::Out,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    );

    // CPU into reset.
    handle.write_control(
        request_type,
        FX2_REQUEST_FIRMWARE,
        FX2_CPUCS,
        0,
        &[1],
        USB_TIMEOUT,
    )?;
    for (i, chunk) in image.chunks(1024).enumerate() {
        let addr = start as usize + i * 1024;
        handle.write_control(
            request_type,
            FX2_REQUEST_FIRMWARE,
            addr as u16,
            0,
            chunk,
            USB_TIMEOUT,
        )?;
    }
    // Release reset; the device drops off and renumerates.
    let _ = handle.write_control(
        request_type,
        FX2_REQUEST_FIRMWARE,
        FX2_CPUCS,
        0,
        &[0],
        USB_TIMEOUT,
    );
    tracing::info!("FX2 firmware loaded ({} bytes)", image.len());
    Ok(())
}
