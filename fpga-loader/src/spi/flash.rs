//! Commodity SPI NOR flash protocol on top of [`SpiInterface`].

use std::io::Write as _;
use std::path::Path;

use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::spi::{flash_by_jedec_id, FlashDescriptor, SpiInterface};

// Status register
const FLASH_WRSR: u8 = 0x01;
const FLASH_RDSR: u8 = 0x05;
const RDSR_WIP: u8 = 0x01;
const RDSR_WEL: u8 = 0x02;
// Program / erase
const FLASH_PP: u8 = 0x02;
const FLASH_SE: u8 = 0xd8;
const FLASH_SSE: u8 = 0x20;
const FLASH_BE: u8 = 0xc7;
// Write latch
const FLASH_WRDIS: u8 = 0x04;
const FLASH_WREN: u8 = 0x06;
// Identification / power
const FLASH_READ: u8 = 0x03;
const FLASH_RDID: u8 = 0x9f;
const FLASH_POWER_UP: u8 = 0xab;
const FLASH_POWER_DOWN: u8 = 0xb9;
// Microchip SST26 block protection
const FLASH_RBPR: u8 = 0x72;
const FLASH_ULBPR: u8 = 0x98;

const SECTOR_SIZE: u32 = 0x10000;
const SUBSECTOR_SIZE: u32 = 0x1000;
const PAGE_SIZE: u32 = 256;

/// Driver for the flash behind an [`SpiInterface`]; ephemeral, created per
/// access.
pub struct SpiFlash<'a> {
    spi: &'a mut dyn SpiInterface,
    unprotect: bool,
    jedec_id: u32,
    descriptor: Option<&'static FlashDescriptor>,
}

impl<'a> SpiFlash<'a> {
    /// Wraps an SPI provider. `unprotect` is the policy flag allowing block
    /// protection to be cleared on demand.
    pub fn new(spi: &'a mut dyn SpiInterface, unprotect: bool) -> Self {
        Self {
            spi,
            unprotect,
            jedec_id: 0,
            descriptor: None,
        }
    }

    /// The last JEDEC ID read by [`SpiFlash::read_id`].
    pub fn jedec_id(&self) -> u32 {
        self.jedec_id
    }

    /// The descriptor resolved from the JEDEC ID, when the model is known.
    pub fn descriptor(&self) -> Option<&'static FlashDescriptor> {
        self.descriptor
    }

    /// Issues RDID and resolves the flash model.
    ///
    /// When the fourth byte advertises an extended ID the full ID string is
    /// fetched and logged; lookup uses the leading three bytes either way.
    pub fn read_id(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.spi.spi_put(FLASH_RDID, None, Some(&mut rx))?;

        self.jedec_id = u32::from_be_bytes([0, rx[0], rx[1], rx[2]]);
        tracing::info!(
            "JEDEC ID 0x{:06x} (type 0x{:02x}, capacity 0x{:02x})",
            self.jedec_id,
            rx[1],
            rx[2]
        );

        if rx[3] != 0 {
            let len = 4 + rx[3] as usize;
            let mut full = vec![0u8; len];
            self.spi.spi_put(FLASH_RDID, None, Some(&mut full))?;
            tracing::debug!("extended ID: {full:02x?}");
        }

        self.descriptor = flash_by_jedec_id(self.jedec_id);
        match self.descriptor {
            Some(d) => tracing::info!("detected {} {}", d.manufacturer, d.model),
            None => tracing::warn!("flash 0x{:06x} not in database, using defaults", self.jedec_id),
        }
        Ok(self.jedec_id)
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<u8> {
        let mut rx = [0u8];
        self.spi.spi_put(FLASH_RDSR, None, Some(&mut rx))?;
        Ok(rx[0])
    }

    /// Combined mask of the block-protect bits for this model.
    fn bp_mask(&self) -> u8 {
        match self.descriptor {
            Some(d) => d.bp_offset.iter().take(d.bp_len as usize).fold(0, |m, b| m | b),
            // BP0..BP2 at their near-universal position.
            None => 0x1c,
        }
    }

    /// Sets the write-enable latch and waits for WEL.
    pub fn write_enable(&mut self) -> Result<()> {
        self.spi.spi_put(FLASH_WREN, None, None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WEL, RDSR_WEL, 1000)
    }

    /// Clears the write-enable latch and waits for WEL to drop.
    pub fn write_disable(&mut self) -> Result<()> {
        self.spi.spi_put(FLASH_WRDIS, None, None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WEL, 0x00, 1000)
    }

    /// Clears the status register, dropping all block-protect bits.
    pub fn disable_protection(&mut self) -> Result<()> {
        self.write_enable()?;
        self.spi.spi_put(FLASH_WRSR, Some(&[0x00]), None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WIP, 0x00, 1000)?;

        if self.read_status()? & self.bp_mask() != 0 {
            return Err(Error::ProtectedFlash);
        }
        Ok(())
    }

    /// Protects the first `len` bytes by setting block-protect bits.
    pub fn enable_protection(&mut self, len: u32) -> Result<()> {
        let descriptor = self
            .descriptor
            .ok_or_else(|| Error::SoftFail("cannot derive protection bits: unknown flash".into()))?;
        if descriptor.dedicated_protection {
            return Err(Error::SoftFail(
                "per-block protection registers not supported for write".into(),
            ));
        }

        let sectors = len.div_ceil(SECTOR_SIZE);
        // Protected area doubles with each BP code: code n covers 2^(n-1)
        // sectors.
        let mut code = 0u8;
        while code < (1 << descriptor.bp_len) - 1 {
            let covered = if code == 0 { 0 } else { 1u32 << (code - 1) };
            if covered >= sectors {
                break;
            }
            code += 1;
        }

        let mut status = 0u8;
        for (bit, mask) in descriptor.bp_offset.iter().enumerate() {
            if code & (1 << bit) != 0 {
                status |= mask;
            }
        }
        // Protect from the bottom of the array.
        if descriptor.tb_otp {
            tracing::warn!("top/bottom bit is OTP on this flash, leaving it untouched");
        } else {
            status |= descriptor.tb_offset;
        }

        self.write_enable()?;
        self.spi.spi_put(FLASH_WRSR, Some(&[status]), None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WIP, 0x00, 1000)?;

        let readback = self.read_status()?;
        if readback & self.bp_mask() != status & self.bp_mask() {
            return Err(Error::SoftFail(format!(
                "protection readback 0x{readback:02x} does not match 0x{status:02x}"
            )));
        }
        Ok(())
    }

    fn erase_cmd(&mut self, cmd: u8, addr: u32) -> Result<()> {
        let tx = [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8];
        self.spi.spi_put(cmd, Some(&tx), None)
    }

    /// Erases every sector covering `[base, base + size)`, using 64 KiB
    /// commands where possible and 4 KiB commands for small tails.
    pub fn sectors_erase(&mut self, base: u32, size: u32, progress: &Progress) -> Result<()> {
        let (use_se, use_sse) = match self.descriptor {
            Some(d) => (d.sector_erase, d.subsector_erase),
            None => (true, false),
        };

        progress.started("Erasing", size as usize);
        let end = base + size;
        let mut addr = base;
        while addr < end {
            self.write_enable()?;
            let remaining = end - addr;
            if use_se && (remaining > SECTOR_SIZE / 2 || !use_sse) {
                self.erase_cmd(FLASH_SE, addr)?;
                addr = (addr & !(SECTOR_SIZE - 1)) + SECTOR_SIZE;
            } else {
                self.erase_cmd(FLASH_SSE, addr)?;
                addr = (addr & !(SUBSECTOR_SIZE - 1)) + SUBSECTOR_SIZE;
            }
            if let Err(e) = self.spi.spi_wait(FLASH_RDSR, RDSR_WIP, 0x00, 100_000) {
                progress.failed();
                return Err(e);
            }
            progress.progressed((addr.min(end) - base) as usize);
        }
        progress.finished();
        Ok(())
    }

    /// Erases the whole array.
    pub fn bulk_erase(&mut self) -> Result<()> {
        self.write_enable()?;
        self.spi.spi_put(FLASH_BE, None, None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WIP, 0x00, 100_000)
    }

    /// Programs one page (≤ 256 bytes, must not cross a page boundary).
    pub fn write_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= PAGE_SIZE as usize);
        let mut tx = Vec::with_capacity(3 + data.len());
        tx.extend_from_slice(&[(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]);
        tx.extend_from_slice(data);

        self.write_enable()?;
        self.spi.spi_put(FLASH_PP, Some(&tx), None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WIP, 0x00, 1000)
    }

    /// Checks protection, erases the covered range and programs `data`.
    pub fn erase_and_prog(&mut self, base: u32, data: &[u8], progress: &Progress) -> Result<()> {
        if self.jedec_id == 0 {
            self.read_id()?;
        }

        if self.descriptor.is_some_and(|d| d.dedicated_protection) {
            self.global_unlock()?;
        } else if self.read_status()? & self.bp_mask() != 0 {
            if !self.unprotect {
                return Err(Error::ProtectedFlash);
            }
            self.disable_protection()?;
        }

        self.sectors_erase(base, data.len() as u32, progress)?;

        progress.started("Writing", data.len());
        let mut offset = 0u32;
        while (offset as usize) < data.len() {
            let addr = base + offset;
            // Stay inside the current 256-byte page.
            let len = (PAGE_SIZE - (addr & (PAGE_SIZE - 1)))
                .min(data.len() as u32 - offset) as usize;
            if let Err(e) = self.write_page(addr, &data[offset as usize..offset as usize + len]) {
                progress.failed();
                return Err(e);
            }
            offset += len as u32;
            if offset % (SECTOR_SIZE / 4) < PAGE_SIZE {
                progress.progressed(offset as usize);
            }
        }
        progress.finished();
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `base`, in `burst`-sized chunks.
    pub fn read(&mut self, base: u32, buf: &mut [u8], burst: usize) -> Result<()> {
        let burst = if burst == 0 { 4096 } else { burst };
        let mut offset = 0usize;
        while offset < buf.len() {
            let len = burst.min(buf.len() - offset);
            let addr = base + offset as u32;
            let mut tx = vec![0u8; len + 3];
            tx[0] = (addr >> 16) as u8;
            tx[1] = (addr >> 8) as u8;
            tx[2] = addr as u8;
            let mut rx = vec![0u8; len + 3];
            self.spi.spi_put(FLASH_READ, Some(&tx), Some(&mut rx))?;
            buf[offset..offset + len].copy_from_slice(&rx[3..]);
            offset += len;
        }
        Ok(())
    }

    /// Reads back and compares against `data`; the first mismatch is fatal.
    pub fn verify(
        &mut self,
        base: u32,
        data: &[u8],
        burst: usize,
        progress: &Progress,
    ) -> Result<()> {
        let burst = if burst == 0 { 4096 } else { burst };
        progress.started("Verifying", data.len());

        let mut offset = 0usize;
        let mut chunk = vec![0u8; burst];
        while offset < data.len() {
            let len = burst.min(data.len() - offset);
            self.read(base + offset as u32, &mut chunk[..len], burst)?;
            for i in 0..len {
                if chunk[i] != data[offset + i] {
                    progress.failed();
                    return Err(Error::VerifyMismatch {
                        offset: base + (offset + i) as u32,
                        expected: data[offset + i],
                        actual: chunk[i],
                    });
                }
            }
            offset += len;
            progress.progressed(offset);
        }
        progress.finished();
        Ok(())
    }

    /// Dumps `len` bytes starting at `base` into `path`.
    pub fn dump(
        &mut self,
        path: &Path,
        base: u32,
        len: u32,
        burst: usize,
        progress: &Progress,
    ) -> Result<()> {
        let burst = if burst == 0 { 4096 } else { burst };
        let mut file = std::fs::File::create(path)?;
        progress.started("Dumping", len as usize);

        let mut offset = 0u32;
        let mut chunk = vec![0u8; burst];
        while offset < len {
            let n = burst.min((len - offset) as usize);
            self.read(base + offset, &mut chunk[..n], burst)?;
            file.write_all(&chunk[..n])?;
            offset += n as u32;
            progress.progressed(offset as usize);
        }
        file.flush()?;
        progress.finished();
        Ok(())
    }

    /// Releases the flash from deep power-down.
    pub fn power_up(&mut self) -> Result<()> {
        self.spi.spi_put(FLASH_POWER_UP, None, None)
    }

    /// Enters deep power-down.
    pub fn power_down(&mut self) -> Result<()> {
        self.spi.spi_put(FLASH_POWER_DOWN, None, None)
    }

    /// Clocks out dummy all-ones bytes to resynchronize a wedged flash.
    pub fn reset(&mut self) -> Result<()> {
        self.spi.spi_put(0xff, Some(&[0xff; 8]), None)
    }

    /// Microchip SST26: clear every per-block write lock and confirm via
    /// the block-protection register.
    pub fn global_unlock(&mut self) -> Result<()> {
        self.write_enable()?;
        self.spi.spi_put(FLASH_ULBPR, None, None)?;
        self.spi.spi_wait(FLASH_RDSR, RDSR_WIP, 0x00, 1000)?;

        let mut rbpr = [0u8; 10];
        self.spi.spi_put(FLASH_RBPR, None, Some(&mut rbpr))?;
        if rbpr.iter().any(|b| *b != 0) {
            return Err(Error::ProtectedFlash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A behavioural NOR flash model: 128 KiB array, WEL/WIP semantics and
    /// BP bits in the status register.
    struct SimFlash {
        memory: Vec<u8>,
        status: u8,
        jedec: [u8; 3],
    }

    impl SimFlash {
        fn new(jedec: [u8; 3]) -> Self {
            Self {
                memory: vec![0xff; 128 * 1024],
                status: 0,
                jedec,
            }
        }

        fn addr(tx: &[u8]) -> usize {
            ((tx[0] as usize) << 16) | ((tx[1] as usize) << 8) | tx[2] as usize
        }
    }

    impl SpiInterface for SimFlash {
        fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
            let tx = tx.unwrap_or(&[]);
            match cmd {
                FLASH_RDID => {
                    if let Some(rx) = rx {
                        for (i, byte) in rx.iter_mut().enumerate() {
                            *byte = *self.jedec.get(i).unwrap_or(&0);
                        }
                    }
                }
                FLASH_RDSR => {
                    if let Some(rx) = rx {
                        rx[0] = self.status;
                    }
                }
                FLASH_WREN => self.status |= RDSR_WEL,
                FLASH_WRDIS => self.status &= !RDSR_WEL,
                FLASH_WRSR => {
                    assert!(self.status & RDSR_WEL != 0, "WRSR without WREN");
                    self.status = tx[0] & !RDSR_WEL & !RDSR_WIP;
                }
                FLASH_SE => {
                    assert!(self.status & RDSR_WEL != 0, "erase without WREN");
                    let base = Self::addr(tx) & !0xffff;
                    self.memory[base..base + 0x10000].fill(0xff);
                    self.status &= !RDSR_WEL;
                }
                FLASH_SSE => {
                    assert!(self.status & RDSR_WEL != 0, "erase without WREN");
                    let base = Self::addr(tx) & !0xfff;
                    self.memory[base..base + 0x1000].fill(0xff);
                    self.status &= !RDSR_WEL;
                }
                FLASH_PP => {
                    assert!(self.status & RDSR_WEL != 0, "program without WREN");
                    let base = Self::addr(tx);
                    for (i, byte) in tx[3..].iter().enumerate() {
                        // NOR programming only clears bits.
                        self.memory[base + i] &= *byte;
                    }
                    self.status &= !RDSR_WEL;
                }
                FLASH_READ => {
                    let base = Self::addr(tx);
                    if let Some(rx) = rx {
                        for (i, byte) in rx.iter_mut().enumerate().skip(3) {
                            *byte = self.memory[base + i - 3];
                        }
                    }
                }
                FLASH_BE => {
                    assert!(self.status & RDSR_WEL != 0);
                    self.memory.fill(0xff);
                    self.status &= !RDSR_WEL;
                }
                _ => {}
            }
            Ok(())
        }

        fn spi_put_raw(&mut self, _tx: &[u8], _rx: Option<&mut [u8]>) -> Result<()> {
            unimplemented!("SimFlash only models framed commands")
        }
    }

    #[test]
    fn read_id_resolves_descriptor() {
        let mut sim = SimFlash::new([0x20, 0xba, 0x18]);
        let mut flash = SpiFlash::new(&mut sim, false);
        assert_eq!(flash.read_id().unwrap(), 0x0020ba18);
        assert_eq!(flash.descriptor().unwrap().model, "N25Q128");
    }

    #[test]
    fn program_and_verify_roundtrip() {
        let mut sim = SimFlash::new([0x20, 0xba, 0x18]);
        let mut flash = SpiFlash::new(&mut sim, false);

        let data: Vec<u8> = (0..70_000u32).map(|i| (i * 7) as u8).collect();
        flash.erase_and_prog(0, &data, &Progress::silent()).unwrap();
        flash.verify(0, &data, 4096, &Progress::silent()).unwrap();
    }

    #[test]
    fn verify_reports_first_corrupt_offset() {
        let mut sim = SimFlash::new([0x20, 0xba, 0x18]);
        let mut flash = SpiFlash::new(&mut sim, false);

        let data = vec![0xa5u8; 600];
        flash.erase_and_prog(0, &data, &Progress::silent()).unwrap();

        sim.memory[123] ^= 0x10;
        let mut flash = SpiFlash::new(&mut sim, false);
        match flash.verify(0, &data, 256, &Progress::silent()) {
            Err(Error::VerifyMismatch { offset, expected, actual }) => {
                assert_eq!(offset, 123);
                assert_eq!(expected, 0xa5);
                assert_eq!(actual, 0xa5 ^ 0x10);
            }
            other => panic!("expected VerifyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn protected_flash_is_refused_without_policy() {
        let mut sim = SimFlash::new([0x20, 0xba, 0x18]);
        sim.status = 0x1c; // BP0..2 set
        let mut flash = SpiFlash::new(&mut sim, false);
        let err = flash
            .erase_and_prog(0, &[0u8; 16], &Progress::silent())
            .unwrap_err();
        assert!(matches!(err, Error::ProtectedFlash));
    }

    #[test]
    fn protected_flash_cleared_with_policy() {
        let mut sim = SimFlash::new([0x20, 0xba, 0x18]);
        sim.status = 0x1c;
        let mut flash = SpiFlash::new(&mut sim, true);
        flash
            .erase_and_prog(0, &[0x42u8; 16], &Progress::silent())
            .unwrap();
        flash.verify(0, &[0x42u8; 16], 64, &Progress::silent()).unwrap();
    }

    #[test]
    fn unaligned_write_respects_page_boundaries() {
        let mut sim = SimFlash::new([0x20, 0xba, 0x18]);
        let mut flash = SpiFlash::new(&mut sim, false);

        let data = vec![0x5au8; 600];
        flash.erase_and_prog(0x80, &data, &Progress::silent()).unwrap();
        flash.verify(0x80, &data, 4096, &Progress::silent()).unwrap();
    }
}
