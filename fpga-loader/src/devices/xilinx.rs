//! Xilinx drivers: 7-series/Spartan-6 SRAM and external flash, XCF serial
//! PROMs, XC9500XL and CoolRunner-II CPLDs.
//!
//! External flash goes through the SPI-over-JTAG bridge: the `USER1`
//! register fronts a SPI master in fabric, shifting LSB-first. Every byte
//! is bit-reversed on the way in, and responses come back with a one-bit
//! pipeline delay that [`SpiInterface`] implementations below realign.

use std::path::Path;
use std::time::Duration;

use super::{bridge_bitstream, check_idcode, Device, DeviceOptions};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{jed, mcs, raw, xilinx_bit, FileKind};
use crate::spi::{SpiFlash, SpiInterface};
use crate::util::reverse_byte;

// 6-bit IR opcodes (7-series / Spartan-6).
const USER1: u8 = 0x02;
const CFG_IN: u8 = 0x05;
const JPROGRAM: u8 = 0x0b;
const JSTART: u8 = 0x0c;
const JSHUTDOWN: u8 = 0x0d;
const BYPASS: u8 = 0x3f;

// XC9500XL 8-bit opcodes.
const XC95_BYPASS: u8 = 0xff;
const XC95_ISC_ENABLE: u8 = 0xe9;
const XC95_ISC_DISABLE: u8 = 0xf0;
const XC95_ISC_ERASE: u8 = 0xed;
const XC95_ISC_PROGRAM: u8 = 0xea;
const XC95_ISC_READ: u8 = 0xee;
const XC95_XSC_BLANK_CHECK: u8 = 0xe5;

// XCF PROM 8-bit opcodes.
const XCF_ISCTESTSTATUS: u8 = 0xe3;
const XCF_ISC_ENABLE: u8 = 0xe8;
const XCF_ISC_PROGRAM: u8 = 0xea;
const XCF_ISC_ADDR_SHIFT: u8 = 0xeb;
const XCF_ISC_ERASE: u8 = 0xec;
const XCF_ISC_DATA_SHIFT: u8 = 0xed;
const XCF_CONFIG: u8 = 0xee;
const XCF_ISC_READ: u8 = 0xef;
const XCF_ISC_DISABLE: u8 = 0xf0;
const XCF_BYPASS: u8 = 0xff;

// CoolRunner-II 8-bit opcodes.
const XC2C_ISC_DISABLE: u8 = 0xc0;
const XC2C_ISC_ENABLE_OTF: u8 = 0xe4;
const XC2C_ISC_PROGRAM: u8 = 0xea;
const XC2C_ISC_ERASE: u8 = 0xed;
const XC2C_ISC_READ: u8 = 0xee;
const XC2C_ISC_INIT: u8 = 0xf0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Series7,
    Spartan6,
    Xcf,
    Xc95,
    Xc2c,
}

/// Driver for all supported Xilinx devices.
pub struct Xilinx<'a> {
    jtag: &'a mut Jtag,
    model: &'static FpgaModel,
    family: Family,
    options: DeviceOptions,
    /// XC95 section line length in bytes (part dependent).
    xc95_line_len: usize,
    /// CoolRunner-II matrix geometry.
    cpld_nb_row: usize,
    cpld_nb_col: usize,
    cpld_addr_size: usize,
}

/// `reverse_byte(i ^ (i >> 1))`: the Gray sequence as it shifts LSB-first,
/// so consecutive rows differ in exactly one wire bit.
pub(crate) fn gray_code(row: usize) -> u8 {
    let row = row as u8;
    reverse_byte(row ^ (row >> 1))
}

impl<'a> Xilinx<'a> {
    /// Prepares a driver for the selected chain device.
    pub fn new(
        jtag: &'a mut Jtag,
        model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        let family = match model.family {
            "xcf" => Family::Xcf,
            "xc95" => Family::Xc95,
            "xc2c" => Family::Xc2c,
            "spartan6" => Family::Spartan6,
            _ => Family::Series7,
        };

        let xc95_line_len = match model.model {
            "xc9536xl" => 2,
            "xc9572xl" => 4,
            "xc95144xl" => 8,
            _ => 16,
        };

        let (cpld_nb_row, cpld_nb_col, cpld_addr_size) = match (model.idcode >> 16) & 0x3f {
            0x01 | 0x11 | 0x21 => (48, 260, 6),
            0x05 | 0x25 => (96, 274, 7),
            0x18 => (80, 752, 7),
            0x14 => (96, 1364, 7),
            0x15 => (120, 1868, 7),
            0x17 => (160, 1980, 8),
            _ => (0, 0, 0),
        };

        Ok(Self {
            jtag,
            model,
            family,
            options,
            xc95_line_len,
            // Two extra rows hold the done/security bits and the usercode.
            cpld_nb_row: cpld_nb_row + 2,
            cpld_nb_col,
            cpld_addr_size,
        })
    }

    fn selected_idcode(&self) -> u32 {
        self.jtag.devices()[self.jtag.selected_index()]
    }

    /// Polls the IR capture value until the ISC-done flag (bit 0) rises.
    fn wait_init_complete(&mut self) -> Result<()> {
        for _ in 0..1000 {
            let mut rx = [0u8];
            self.jtag
                .shift_ir(&[BYPASS], Some(&mut rx), 6, TapState::RunTestIdle)?;
            if rx[0] & 0x01 != 0 {
                return Ok(());
            }
            std::thread::sleep(Duration::from_micros(500));
        }
        Err(Error::JtagBusy {
            operation: "waiting for configuration logic init",
        })
    }

    /// The documented JTAG configuration flow (UG470 table 6-2).
    fn program_mem(&mut self, data: &[u8]) -> Result<()> {
        self.jtag.go_test_logic_reset()?;
        self.jtag.shift_ir_u8(JPROGRAM, TapState::RunTestIdle)?;
        self.wait_init_complete()?;

        // House-cleaning takes at least 10000 cycles on the largest parts.
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(12_000)?;

        self.jtag.shift_ir_u8(CFG_IN, TapState::RunTestIdle)?;

        self.options.progress.started("Loading SRAM", data.len());
        let burst = (data.len() / 100).max(1024);
        let mut sent = 0usize;
        while sent < data.len() {
            let chunk = burst.min(data.len() - sent);
            let end = if sent + chunk == data.len() {
                TapState::UpdateDr
            } else {
                TapState::ShiftDr
            };
            self.jtag
                .shift_dr(Some(&data[sent..sent + chunk]), None, chunk * 8, end)?;
            sent += chunk;
            self.options.progress.progressed(sent);
        }
        self.jtag.flush()?;
        self.options.progress.finished();

        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.shift_ir_u8(JSTART, TapState::UpdateIr)?;
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(2000)?;
        self.jtag.go_test_logic_reset()?;
        Ok(())
    }

    /// Loads the SPI-over-JTAG bridge unless the caller says the fabric
    /// already runs it.
    fn load_bridge(&mut self) -> Result<()> {
        if self.options.skip_load_bridge {
            return Ok(());
        }
        let part = self
            .options
            .part_name
            .clone()
            .ok_or(Error::SoftFail(
                "external flash access needs --fpga-part to pick the bridge bitstream".into(),
            ))?;
        let path = bridge_bitstream(&part, "bit")?;
        tracing::info!("loading bridge {}", path.display());
        let bit = xilinx_bit::parse_file(&path, false)?;
        check_idcode(bit.idcode(), self.selected_idcode())?;
        self.program_mem(&bit.data)
    }

    // -- XC9500XL internal flash ------------------------------------------

    fn xc95_flow_enable(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(XC95_ISC_ENABLE, TapState::RunTestIdle)?;
        self.jtag
            .shift_dr(Some(&[0x15]), None, 6, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)
    }

    fn xc95_flow_disable(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(XC95_ISC_DISABLE, TapState::RunTestIdle)?;
        let cycles = (self.jtag.clock_frequency() as u64 * 100 / 1_000_000).max(1) as u32;
        self.jtag.toggle_clk(cycles)?;
        self.jtag.shift_ir_u8(XC95_BYPASS, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)
    }

    fn xc95_flow_erase(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(XC95_ISC_ERASE, TapState::RunTestIdle)?;
        self.jtag
            .shift_dr(Some(&[0x03, 0x00, 0x00]), None, 18, TapState::RunTestIdle)?;
        let cycles = (self.jtag.clock_frequency() as u64 * 400 / 1000) as u32;
        self.jtag.toggle_clk(cycles)?;
        let mut rx = [0u8; 3];
        self.jtag.shift_dr(None, Some(&mut rx), 18, TapState::RunTestIdle)?;
        if rx[0] & 0x03 != 0x01 {
            return Err(Error::JtagBusy {
                operation: "XC95 erase",
            });
        }

        if self.options.verify {
            self.jtag
                .shift_ir_u8(XC95_XSC_BLANK_CHECK, TapState::RunTestIdle)?;
            self.jtag
                .shift_dr(Some(&[0x03, 0x00, 0x00]), None, 18, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(500)?;
            self.jtag.shift_dr(None, Some(&mut rx), 18, TapState::RunTestIdle)?;
            if rx[0] & 0x03 != 0x01 {
                return Err(Error::VerifyMismatch {
                    offset: 0,
                    expected: 0xff,
                    actual: rx[0],
                });
            }
        }
        Ok(())
    }

    /// Sector-at-a-time programming: 15 JED sections per sector; the 15th
    /// write commits the sector to flash and is polled to completion.
    fn xc95_program(&mut self, jed: &jed::JedFile) -> Result<()> {
        self.xc95_flow_enable()?;
        self.xc95_flow_erase()?;

        let line_len = self.xc95_line_len;
        let nb_sector = jed.sections.len() / 15;
        self.options.progress.started("Writing flash", nb_sector);

        for sector in 0..nb_sector {
            let mut addr: u16 = (sector * 32) as u16;
            for line in 0..15 {
                let section = &jed.sections[sector * 15 + line];
                let mode: u8 = if line == 14 { 0x3 } else { 0x1 };

                let mut wr_buf = vec![0u8; line_len + 2];
                let n = line_len.min(section.data.len());
                wr_buf[..n].copy_from_slice(&section.data[..n]);
                wr_buf[line_len] = addr as u8;
                wr_buf[line_len + 1] = (addr >> 8) as u8;

                self.jtag.shift_ir_u8(XC95_ISC_PROGRAM, TapState::RunTestIdle)?;
                self.jtag.shift_dr(Some(&[mode]), None, 2, TapState::ShiftDr)?;
                self.jtag
                    .shift_dr(Some(&wr_buf), None, 8 * (line_len + 2), TapState::RunTestIdle)?;

                if line == 14 {
                    self.jtag.toggle_clk(20_000)?;
                    let mut done = false;
                    let mut rd_buf = vec![0u8; line_len + 3];
                    for _ in 0..32 {
                        self.jtag.shift_ir_u8(XC95_ISC_PROGRAM, TapState::RunTestIdle)?;
                        self.jtag
                            .shift_dr(Some(&[0x00]), None, 2, TapState::ShiftDr)?;
                        self.jtag.shift_dr(
                            Some(&wr_buf),
                            None,
                            8 * (line_len + 2),
                            TapState::RunTestIdle,
                        )?;
                        let cycles =
                            (self.jtag.clock_frequency() as u64 * 50 / 1000) as u32;
                        self.jtag.toggle_clk(cycles)?;
                        self.jtag.shift_dr(
                            None,
                            Some(&mut rd_buf),
                            8 * (line_len + 2) + 2,
                            TapState::RunTestIdle,
                        )?;
                        if rd_buf[0] & 0x03 == 0x01 {
                            done = true;
                            break;
                        }
                    }
                    if !done {
                        self.options.progress.failed();
                        return Err(Error::JtagBusy {
                            operation: "XC95 sector program",
                        });
                    }
                } else {
                    self.jtag.toggle_clk(1)?;
                }

                // Address stride is 1, except every fifth line jumps by 4.
                addr += if (line + 1) % 5 != 0 { 1 } else { 4 };
            }
            self.options.progress.progressed(sector + 1);
        }
        self.options.progress.finished();

        if self.options.verify {
            let flash = self.xc95_read()?;
            let mut pos = 0usize;
            for section in jed.sections.iter() {
                for col in 0..line_len.min(section.data.len()) {
                    if flash.get(pos).copied() != Some(section.data[col]) {
                        self.xc95_flow_disable()?;
                        return Err(Error::VerifyMismatch {
                            offset: pos as u32,
                            expected: section.data[col],
                            actual: flash.get(pos).copied().unwrap_or(0),
                        });
                    }
                    pos += 1;
                }
            }
        }

        self.xc95_flow_disable()
    }

    fn xc95_read(&mut self) -> Result<Vec<u8>> {
        if self.jtag.clock_frequency() > 1_000_000 {
            self.jtag.set_clock(1_000_000)?;
        }
        let line_len = self.xc95_line_len;
        let mut buffer = Vec::new();
        let mut wr_buf = vec![0xffu8; line_len + 2];

        for sector in 0..108usize {
            let mut addr: u16 = (sector * 32) as u16;
            for line in 0..15 {
                wr_buf[line_len] = addr as u8;
                wr_buf[line_len + 1] = (addr >> 8) as u8;

                self.jtag.shift_ir_u8(XC95_ISC_READ, TapState::RunTestIdle)?;
                self.jtag.shift_dr(Some(&[0x03]), None, 2, TapState::ShiftDr)?;
                self.jtag
                    .shift_dr(Some(&wr_buf), None, 8 * (line_len + 2), TapState::RunTestIdle)?;
                self.jtag.toggle_clk(1)?;

                let mut rd_buf = vec![0u8; line_len + 2];
                self.jtag.shift_dr(Some(&[0x00]), None, 2, TapState::ShiftDr)?;
                self.jtag.shift_dr(
                    None,
                    Some(&mut rd_buf),
                    8 * (line_len + 2),
                    TapState::RunTestIdle,
                )?;
                buffer.extend_from_slice(&rd_buf[..line_len]);

                addr += if (line + 1) % 5 != 0 { 1 } else { 4 };
            }
        }
        Ok(buffer)
    }

    // -- XCF serial PROM ---------------------------------------------------

    fn xcf_flow_enable(&mut self, mode: u8) -> Result<()> {
        self.jtag.shift_ir_u8(XCF_ISC_ENABLE, TapState::RunTestIdle)?;
        self.jtag.shift_dr(Some(&[mode]), None, 6, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)
    }

    fn xcf_flow_disable(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(XCF_ISC_DISABLE, TapState::RunTestIdle)?;
        std::thread::sleep(Duration::from_millis(110));
        self.jtag.shift_ir_u8(XCF_BYPASS, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)
    }

    fn xcf_wait_status(&mut self, tries: u32, delay: Duration) -> Result<()> {
        for _ in 0..tries {
            self.jtag.shift_ir_u8(XCF_ISCTESTSTATUS, TapState::RunTestIdle)?;
            std::thread::sleep(delay);
            let mut rx = [0u8];
            self.jtag.shift_dr(None, Some(&mut rx), 8, TapState::RunTestIdle)?;
            if rx[0] & 0x04 != 0 {
                return Ok(());
            }
        }
        Err(Error::JtagBusy {
            operation: "XCF status poll",
        })
    }

    fn xcf_erase(&mut self) -> Result<()> {
        self.xcf_flow_enable(0x34)?;
        self.jtag.shift_ir_u8(XCF_ISC_ADDR_SHIFT, TapState::RunTestIdle)?;
        self.jtag
            .shift_dr(Some(&[0x01, 0x00]), None, 16, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)?;

        self.jtag.shift_ir_u8(XCF_ISC_ERASE, TapState::RunTestIdle)?;
        std::thread::sleep(Duration::from_millis(500));
        self.xcf_wait_status(32, Duration::from_millis(500))?;
        self.xcf_flow_disable()
    }

    /// Page size is 2048 bits on the XCF01S, 4096 bits on larger parts.
    fn xcf_page_len(&self) -> usize {
        if self.selected_idcode() == 0x05044093 {
            2048 / 8
        } else {
            4096 / 8
        }
    }

    fn xcf_program(&mut self, data: &[u8]) -> Result<()> {
        if self.jtag.clock_frequency() > 15_000_000 {
            self.jtag.set_clock(15_000_000)?;
        }
        self.xcf_erase()?;
        self.xcf_flow_enable(0x34)?;

        let pkt_len = self.xcf_page_len();
        self.options.progress.started("Writing PROM", data.len());

        let mut addr: u32 = 0;
        for page in data.chunks(pkt_len) {
            self.jtag.shift_ir_u8(XCF_ISC_DATA_SHIFT, TapState::RunTestIdle)?;
            if page.len() == pkt_len {
                self.jtag
                    .shift_dr(Some(page), None, page.len() * 8, TapState::RunTestIdle)?;
            } else {
                // Short tail: pad the page out with erased bytes.
                self.jtag
                    .shift_dr(Some(page), None, page.len() * 8, TapState::ShiftDr)?;
                let pad = vec![0xffu8; pkt_len - page.len()];
                self.jtag
                    .shift_dr(Some(&pad), None, pad.len() * 8, TapState::RunTestIdle)?;
            }
            self.jtag.toggle_clk(1)?;

            self.jtag.shift_ir_u8(XCF_ISC_ADDR_SHIFT, TapState::RunTestIdle)?;
            self.jtag.shift_dr(
                Some(&[addr as u8, (addr >> 8) as u8]),
                None,
                16,
                TapState::RunTestIdle,
            )?;
            self.jtag.toggle_clk(1)?;

            self.jtag.shift_ir_u8(XCF_ISC_PROGRAM, TapState::RunTestIdle)?;
            std::thread::sleep(Duration::from_micros(if addr == 0 { 14_000 } else { 500 }));
            self.xcf_wait_status(29, Duration::from_micros(500))?;

            addr += 32;
            self.options
                .progress
                .progressed(((addr / 32) as usize * pkt_len).min(data.len()));
        }
        self.options.progress.finished();

        self.jtag.shift_ir_u8(XCF_BYPASS, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)?;

        if self.options.verify {
            let flash = self.xcf_read(data.len())?;
            for (pos, (want, got)) in data.iter().zip(flash.iter()).enumerate() {
                if want != got {
                    self.xcf_flow_disable()?;
                    return Err(Error::VerifyMismatch {
                        offset: pos as u32,
                        expected: *want,
                        actual: *got,
                    });
                }
            }
        }

        self.jtag.go_test_logic_reset()?;
        self.xcf_flow_disable()?;

        // Kick the FPGA into reconfiguring from the PROM.
        self.jtag.shift_ir_u8(XCF_CONFIG, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)?;
        self.jtag.shift_ir_u8(XCF_BYPASS, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)
    }

    fn xcf_read(&mut self, len: usize) -> Result<Vec<u8>> {
        let pkt_len = self.xcf_page_len();
        let mut buffer = Vec::with_capacity(len);
        let mut addr: u32 = 0;
        self.xcf_flow_enable(0x34)?;
        while buffer.len() < len {
            self.jtag.shift_ir_u8(XCF_ISC_ADDR_SHIFT, TapState::RunTestIdle)?;
            self.jtag.shift_dr(
                Some(&[addr as u8, (addr >> 8) as u8]),
                None,
                16,
                TapState::RunTestIdle,
            )?;
            self.jtag.toggle_clk(1)?;

            self.jtag.shift_ir_u8(XCF_ISC_READ, TapState::RunTestIdle)?;
            std::thread::sleep(Duration::from_micros(50));
            let mut page = vec![0u8; pkt_len];
            self.jtag
                .shift_dr(None, Some(&mut page), pkt_len * 8, TapState::RunTestIdle)?;
            buffer.extend_from_slice(&page);
            addr += 32;
        }
        buffer.truncate(len);
        self.xcf_flow_disable()?;
        Ok(buffer)
    }

    // -- CoolRunner-II -----------------------------------------------------

    fn xc2c_flow_reinit(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(XC2C_ISC_ENABLE_OTF, TapState::RunTestIdle)?;
        self.jtag.shift_ir_u8(XC2C_ISC_INIT, TapState::RunTestIdle)?;
        let f = self.jtag.clock_frequency() as u64;
        self.jtag.toggle_clk((f * 20 / 1000) as u32)?;
        self.jtag.shift_ir_u8(XC2C_ISC_INIT, TapState::RunTestIdle)?;
        self.jtag.shift_dr(Some(&[0x00]), None, 8, TapState::RunTestIdle)?;
        self.jtag.toggle_clk((f * 800 / 1000) as u32)?;
        self.jtag.shift_ir_u8(XC2C_ISC_DISABLE, TapState::RunTestIdle)?;
        self.jtag.shift_ir_u8(XC95_BYPASS, TapState::RunTestIdle)
    }

    fn xc2c_erase(&mut self) -> Result<()> {
        self.jtag.shift_ir_u8(XC2C_ISC_ENABLE_OTF, TapState::UpdateIr)?;
        self.jtag.shift_ir_u8(XC2C_ISC_ERASE, TapState::RunTestIdle)?;
        // tERASE is 100 ms.
        let cycles = (self.jtag.clock_frequency() as u64 * 100 / 1000) as u32;
        self.jtag.toggle_clk(cycles)?;
        self.jtag.shift_ir_u8(XC2C_ISC_DISABLE, TapState::RunTestIdle)?;

        if self.options.verify {
            let content = self.xc2c_read()?;
            if content.iter().any(|b| *b != 0xff) {
                return Err(Error::VerifyMismatch {
                    offset: content.iter().position(|b| *b != 0xff).unwrap_or(0) as u32,
                    expected: 0xff,
                    actual: 0,
                });
            }
        }
        Ok(())
    }

    fn xc2c_read(&mut self) -> Result<Vec<u8>> {
        let delay = (self.jtag.clock_frequency() as u64 * 20 / 1_000_000).max(1) as u32;
        let addr_shift = 8 - self.cpld_addr_size;
        let row_bytes = self.cpld_nb_col.div_ceil(8);
        let mut buffer = vec![0u8; (self.cpld_nb_col * self.cpld_nb_row).div_ceil(8)];

        self.jtag.shift_ir_u8(XC95_BYPASS, TapState::RunTestIdle)?;
        self.jtag.shift_ir_u8(XC2C_ISC_ENABLE_OTF, TapState::RunTestIdle)?;
        self.jtag.shift_ir_u8(XC2C_ISC_READ, TapState::RunTestIdle)?;

        let addr = gray_code(0) >> addr_shift;
        self.jtag
            .shift_dr(Some(&[addr]), None, self.cpld_addr_size, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(delay)?;

        let mut pos = 0usize;
        for row in 1..=self.cpld_nb_row {
            let mut rx = vec![0u8; row_bytes];
            self.jtag
                .shift_dr(None, Some(&mut rx), self.cpld_nb_col, TapState::ShiftDr)?;
            let addr = gray_code(row) >> addr_shift;
            self.jtag
                .shift_dr(Some(&[addr]), None, self.cpld_addr_size, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(delay)?;

            for i in 0..self.cpld_nb_col {
                crate::util::bit_set(&mut buffer, pos, crate::util::bit_get(&rx, i));
                pos += 1;
            }
        }

        self.jtag.shift_ir_u8(XC2C_ISC_DISABLE, TapState::TestLogicReset)?;
        Ok(buffer)
    }

    /// Programs the row/column matrix; rows include the done and usercode
    /// rows, and addresses step through the Gray sequence so consecutive
    /// accesses differ in one bit.
    fn xc2c_program(&mut self, jed: &jed::JedFile) -> Result<()> {
        if self.cpld_nb_col == 0 {
            return Err(Error::UnsupportedDevice {
                idcode: self.model.idcode,
            });
        }
        self.xc2c_erase()?;

        let delay = (self.jtag.clock_frequency() as u64 * 20 / 1000).max(1) as u32;
        let addr_shift = 8 - self.cpld_addr_size;
        let row_bytes = self.cpld_nb_col.div_ceil(8);

        self.options.progress.started("Writing flash", self.cpld_nb_row);
        self.jtag.shift_ir_u8(XC2C_ISC_ENABLE_OTF, TapState::RunTestIdle)?;
        self.jtag.shift_ir_u8(XC2C_ISC_PROGRAM, TapState::RunTestIdle)?;

        let fuses = &jed.bitstream.data;
        for row in 0..self.cpld_nb_row {
            let mut wr = vec![0xffu8; row_bytes];
            for col in 0..self.cpld_nb_col {
                let fuse = row * self.cpld_nb_col + col;
                let bit = fuses
                    .get(fuse >> 3)
                    .map(|b| b >> (fuse & 7) & 1 != 0)
                    .unwrap_or(true);
                crate::util::bit_set(&mut wr, col, bit);
            }
            let addr = gray_code(row) >> addr_shift;
            self.jtag
                .shift_dr(Some(&wr), None, self.cpld_nb_col, TapState::ShiftDr)?;
            self.jtag
                .shift_dr(Some(&[addr]), None, self.cpld_addr_size, TapState::RunTestIdle)?;
            // Datasheet tPROG.
            self.jtag.toggle_clk(delay)?;
            self.options.progress.progressed(row + 1);
        }
        self.options.progress.finished();

        self.jtag.shift_ir_u8(XC2C_ISC_DISABLE, TapState::RunTestIdle)?;

        if self.options.verify {
            let content = self.xc2c_read()?;
            let total = self.cpld_nb_row * self.cpld_nb_col;
            for bit in 0..total {
                let want = fuses
                    .get(bit >> 3)
                    .map(|b| b >> (bit & 7) & 1 != 0)
                    .unwrap_or(true);
                if crate::util::bit_get(&content, bit) != want {
                    return Err(Error::VerifyMismatch {
                        offset: (bit / 8) as u32,
                        expected: fuses.get(bit >> 3).copied().unwrap_or(0xff),
                        actual: content[bit >> 3],
                    });
                }
            }
        }

        self.xc2c_flow_reinit()
    }

    fn write_external_flash(&mut self, data: &[u8]) -> Result<()> {
        self.load_bridge()?;

        let offset = self.options.offset;
        let unprotect = self.options.unprotect_flash;
        let verify = self.options.verify;
        let rd_burst = self.options.rd_burst;
        let progress = std::mem::take(&mut self.options.progress);

        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(self, unprotect);
            flash.read_id()?;
            flash.erase_and_prog(offset, data, &progress)?;
            if verify {
                flash.verify(offset, data, rd_burst, &progress)?;
            }
            Ok(())
        })();
        self.options.progress = progress;
        result?;

        if !self.options.skip_reset {
            self.reset()?;
        }
        Ok(())
    }
}

impl Device for Xilinx<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        let bitstream = match FileKind::from_path(path) {
            FileKind::XilinxBit => xilinx_bit::parse_file(path, false)?,
            FileKind::Mcs => mcs::parse_file(path, false)?,
            _ => raw::parse_file(path, false)?,
        };
        check_idcode(bitstream.idcode(), self.selected_idcode())?;
        match self.family {
            Family::Series7 | Family::Spartan6 => self.program_mem(&bitstream.data),
            _ => Err(Error::SoftFail(
                "this device has no volatile configuration memory".into(),
            )),
        }
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        match self.family {
            Family::Xc95 => {
                let jed = jed::parse_file(path)?;
                self.xc95_program(&jed)
            }
            Family::Xc2c => {
                let jed = jed::parse_file(path)?;
                self.xc2c_program(&jed)
            }
            Family::Xcf => {
                let bitstream = match FileKind::from_path(path) {
                    FileKind::Mcs => mcs::parse_file(path, true)?,
                    FileKind::XilinxBit => xilinx_bit::parse_file(path, false)?,
                    _ => raw::parse_file(path, false)?,
                };
                self.xcf_program(&bitstream.data)
            }
            Family::Series7 | Family::Spartan6 => {
                let bitstream = match FileKind::from_path(path) {
                    // External SPI flash stores the stream MSB-first.
                    FileKind::XilinxBit => xilinx_bit::parse_file(path, true)?,
                    FileKind::Mcs => mcs::parse_file(path, true)?,
                    _ => raw::parse_file(path, true)?,
                };
                self.write_external_flash(&bitstream.data)
            }
        }
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        match self.family {
            Family::Xc95 => {
                self.xc95_flow_enable()?;
                let buffer = self.xc95_read()?;
                self.xc95_flow_disable()?;
                std::fs::write(output, buffer)?;
                Ok(())
            }
            Family::Xcf => {
                let buffer = self.xcf_read(len as usize)?;
                std::fs::write(output, buffer)?;
                Ok(())
            }
            Family::Xc2c => {
                let buffer = self.xc2c_read()?;
                std::fs::write(output, buffer)?;
                Ok(())
            }
            Family::Series7 | Family::Spartan6 => {
                self.load_bridge()?;
                let unprotect = self.options.unprotect_flash;
                let rd_burst = self.options.rd_burst;
                let progress = std::mem::take(&mut self.options.progress);
                let output = output.to_path_buf();
                let result = (|| -> Result<()> {
                    let mut flash = SpiFlash::new(self, unprotect);
                    flash.read_id()?;
                    flash.dump(&output, offset, len, rd_burst, &progress)
                })();
                self.options.progress = progress;
                result?;
                if !self.options.skip_reset {
                    self.reset()?;
                }
                Ok(())
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        match self.family {
            Family::Series7 | Family::Spartan6 => {
                self.jtag.shift_ir_u8(JSHUTDOWN, TapState::RunTestIdle)?;
                self.jtag.shift_ir_u8(JPROGRAM, TapState::RunTestIdle)?;
                self.jtag.set_state(TapState::RunTestIdle)?;
                self.jtag.toggle_clk(10_000)?;
                self.wait_init_complete()?;
                self.jtag.go_test_logic_reset()
            }
            Family::Xc2c => self.xc2c_flow_reinit(),
            _ => self.jtag.go_test_logic_reset(),
        }
    }
}

impl SpiInterface for Xilinx<'_> {
    /// Tunnel framing: every byte bit-reversed, one response byte of
    /// pipeline slack appended, and the answer realigned by shifting right
    /// one bit and borrowing the next byte's LSB.
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let has_rx = rx.is_some();
        let xfer_len = len + 1 + usize::from(has_rx);

        let mut jtx = vec![0u8; xfer_len];
        jtx[0] = reverse_byte(cmd);
        if let Some(tx) = tx {
            for (dst, src) in jtx[1..1 + tx.len()].iter_mut().zip(tx) {
                *dst = reverse_byte(*src);
            }
        }

        self.jtag.shift_ir_u8(USER1, TapState::RunTestIdle)?;
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * xfer_len, TapState::RunTestIdle)?;
            for i in 0..rx.len() {
                rx[i] = reverse_byte(jrx[i + 1] >> 1) | (jrx[i + 2] & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * xfer_len, TapState::RunTestIdle)?;
        }
        Ok(())
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        let has_rx = rx.is_some();
        let xfer_len = tx.len() + usize::from(has_rx);
        let mut jtx = vec![0u8; xfer_len];
        for (dst, src) in jtx.iter_mut().zip(tx) {
            *dst = reverse_byte(*src);
        }

        self.jtag.shift_ir_u8(USER1, TapState::RunTestIdle)?;
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * xfer_len, TapState::RunTestIdle)?;
            for i in 0..rx.len().min(tx.len()) {
                rx[i] = reverse_byte(jrx[i] >> 1) | (jrx[i + 1] & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * xfer_len, TapState::RunTestIdle)?;
        }
        Ok(())
    }

    /// Polls entirely inside Shift-DR: the command byte is shifted once,
    /// then two-byte reads keep sampling the status register.
    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        let tx = [reverse_byte(cmd)];
        self.jtag.shift_ir_u8(USER1, TapState::UpdateIr)?;
        self.jtag.shift_dr(Some(&tx), None, 8, TapState::ShiftDr)?;

        let dummy = [0u8; 2];
        let mut rx = [0u8; 2];
        let mut status = 0u8;
        let mut ok = false;
        for _ in 0..timeout {
            self.jtag
                .shift_dr(Some(&dummy), Some(&mut rx), 16, TapState::ShiftDr)?;
            status = reverse_byte(rx[0] >> 1) | (rx[1] & 0x01);
            if status & mask == cond {
                ok = true;
                break;
            }
        }
        self.jtag
            .shift_dr(Some(&dummy), Some(&mut rx), 16, TapState::Exit1Dr)?;
        self.jtag.go_test_logic_reset()?;

        if ok {
            Ok(())
        } else {
            Err(Error::WipTimeout {
                last_status: status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fpga_by_idcode;
    use crate::probe::mock::{MockHandle, MockTransport};
    use crate::util::bit_set;

    fn engine_for(idcode: u32) -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        jtag.insert_first(idcode, fpga_by_idcode(idcode).unwrap().irlength);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    /// First sixteen entries of the programmer-qualification Gray table,
    /// checked against the generated sequence.
    #[test]
    fn gray_table_matches_qualification_spec() {
        let reference: [u8; 16] = [
            0x00, 0x80, 0xc0, 0x40, 0x60, 0xe0, 0xa0, 0x20, 0x30, 0xb0, 0xf0, 0x70, 0x50,
            0xd0, 0x90, 0x10,
        ];
        for (i, want) in reference.iter().enumerate() {
            assert_eq!(gray_code(i), *want, "row {i}");
        }
        // Consecutive entries differ in exactly one bit, across the full range.
        for i in 1..256usize {
            let diff = gray_code(i) ^ gray_code(i - 1);
            assert_eq!(diff.count_ones(), 1, "rows {} -> {}", i - 1, i);
        }
    }

    #[test]
    fn sram_flow_issues_documented_sequence() {
        let (mut jtag, mock) = engine_for(0x0362c093);
        let model = fpga_by_idcode(0x0362c093).unwrap();
        let mut xilinx = Xilinx::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        // Init-complete poll answers on the first BYPASS capture.
        mock.borrow_mut().queue_read(&[0x01]);

        xilinx.program_mem(&[0xaa, 0x99, 0x55, 0x66]).unwrap();

        let m = mock.borrow();
        // House-cleaning idle and startup clocks are present.
        assert!(m.clk_log.contains(&(false, false, 12_000)));
        assert!(m.clk_log.contains(&(false, false, 2000)));
    }

    /// Builds the TDO byte stream a bscan tunnel produces for `response`:
    /// one bit of pipeline delay, then each byte MSB-first.
    fn tunnel_tdo(total_bytes: usize, data_phase_offset: usize, response: &[u8]) -> Vec<u8> {
        let mut bits = vec![false; total_bytes * 8];
        for (k, byte) in response.iter().enumerate() {
            for j in 0..8 {
                let wire = 8 * (data_phase_offset + k) + 1 + j;
                if wire < bits.len() && (byte >> (7 - j)) & 1 != 0 {
                    bits[wire] = true;
                }
            }
        }
        let mut bytes = vec![0u8; total_bytes];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                bit_set(&mut bytes, i, true);
            }
        }
        bytes
    }

    /// A READ through the tunnel recovers the flash bytes exactly after
    /// the one-bit pipeline correction.
    #[test]
    fn bscan_read_alignment() {
        let (mut jtag, mock) = engine_for(0x0362c093);
        let model = fpga_by_idcode(0x0362c093).unwrap();
        let mut xilinx = Xilinx::new(&mut jtag, model, DeviceOptions::default()).unwrap();

        let flash_bytes = [0xa5, 0x5a, 0xff, 0x00];
        // spi_put(READ, tx, rx) with len = 3 + 4: wire bytes are
        // cmd + addr(3) + data(4) + pipeline slack.
        let xfer_len = 7 + 1 + 1;
        // Data phase starts after cmd + 3 address bytes.
        mock.borrow_mut()
            .queue_read(&tunnel_tdo(xfer_len, 4, &flash_bytes));

        let mut flash = SpiFlash::new(&mut xilinx, false);
        let mut out = [0u8; 4];
        flash.read(0, &mut out, 4096).unwrap();
        assert_eq!(out, flash_bytes);
    }

    /// The command byte reaches the wire bit-reversed (MSB-first).
    #[test]
    fn tunnel_reverses_command_byte() {
        let (mut jtag, mock) = engine_for(0x0362c093);
        let model = fpga_by_idcode(0x0362c093).unwrap();
        let mut xilinx = Xilinx::new(&mut jtag, model, DeviceOptions::default()).unwrap();

        xilinx.spi_put(0x9f, None, None).unwrap();

        let m = mock.borrow();
        // Last 8 TDI bits are the reversed RDID opcode (0x9f -> 0xf9).
        let tail: Vec<bool> = m.tdi_bits[m.tdi_bits.len() - 8..].to_vec();
        let value = tail
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, b)| acc | ((*b as u8) << i));
        assert_eq!(value, reverse_byte(0x9f));
    }
}
