//! Per-vendor programming flows.
//!
//! A driver borrows the JTAG engine for the duration of one operation and
//! implements [`Device`]; flows needing external flash implement
//! [`crate::spi::SpiInterface`] on top of their vendor's bscan tunnel.

pub mod altera;
pub mod anlogic;
pub mod colognechip;
pub mod efinix;
pub mod gowin;
pub mod ice40;
pub mod lattice;
pub mod xilinx;

use std::path::{Path, PathBuf};

use crate::config::{fpga_by_idcode, FpgaModel};
use crate::error::{Error, Result};
use crate::jtag::Jtag;
use crate::progress::Progress;

/// Named flash sectors of parts with split configuration memory
/// (MachXO3D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FlashSector {
    Cfg0,
    Cfg1,
    Ufm0,
    Ufm1,
    Ufm2,
    Ufm3,
    Fea,
    Pkey,
}

impl std::str::FromStr for FlashSector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "CFG0" => FlashSector::Cfg0,
            "CFG1" => FlashSector::Cfg1,
            "UFM0" => FlashSector::Ufm0,
            "UFM1" => FlashSector::Ufm1,
            "UFM2" => FlashSector::Ufm2,
            "UFM3" => FlashSector::Ufm3,
            "FEA" => FlashSector::Fea,
            "PKEY" => FlashSector::Pkey,
            other => {
                return Err(Error::Parse(format!("unknown flash sector {other:?}")));
            }
        })
    }
}

/// Options shared by every driver, sourced from the CLI.
#[derive(Debug, Default)]
pub struct DeviceOptions {
    /// Verify after write.
    pub verify: bool,
    /// Allow clearing flash block protection.
    pub unprotect_flash: bool,
    /// Base offset for flash writes/dumps.
    pub offset: u32,
    /// Package-qualified part name (selects the bridge bitstream).
    pub part_name: Option<String>,
    /// Skip loading the SPI-over-JTAG bridge (already configured).
    pub skip_load_bridge: bool,
    /// Skip the post-flash reload.
    pub skip_reset: bool,
    /// Target sector on split-flash parts.
    pub flash_sector: Option<FlashSector>,
    /// Force the external SPI flash on parts that default to internal.
    pub external_flash: bool,
    /// Read burst size for verify/dump.
    pub rd_burst: usize,
    /// Progress sink.
    pub progress: Progress,
}

/// A programmable device on the chain.
pub trait Device {
    /// Loads a bitstream into volatile configuration memory.
    fn write_sram(&mut self, path: &Path) -> Result<()>;

    /// Writes a bitstream into configuration flash (internal or external).
    fn write_flash(&mut self, path: &Path) -> Result<()>;

    /// Dumps `len` bytes of configuration flash starting at `offset`.
    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()>;

    /// Reloads the device from its configuration memory.
    fn reset(&mut self) -> Result<()>;
}

/// Builds the driver matching the selected chain device.
pub fn open<'a>(jtag: &'a mut Jtag, options: DeviceOptions) -> Result<Box<dyn Device + 'a>> {
    let idcode = jtag.devices()[jtag.selected_index()];
    let model = fpga_by_idcode(idcode).ok_or(Error::UnsupportedDevice { idcode })?;

    build(jtag, model, options)
}

fn build<'a>(
    jtag: &'a mut Jtag,
    model: &'static FpgaModel,
    options: DeviceOptions,
) -> Result<Box<dyn Device + 'a>> {
    Ok(match model.manufacturer {
        "xilinx" => Box::new(xilinx::Xilinx::new(jtag, model, options)?),
        "lattice" => Box::new(lattice::Lattice::new(jtag, model, options)?),
        "gowin" => Box::new(gowin::Gowin::new(jtag, model, options)?),
        "altera" => Box::new(altera::Altera::new(jtag, model, options)?),
        "efinix" => Box::new(efinix::Efinix::new(jtag, model, options)?),
        "colognechip" => Box::new(colognechip::CologneChip::new(jtag, model, options)?),
        "anlogic" => Box::new(anlogic::Anlogic::new(jtag, model, options)?),
        other => {
            tracing::error!("no driver for manufacturer {other}");
            return Err(Error::UnsupportedDevice {
                idcode: model.idcode,
            });
        }
    })
}

/// Compile-time default for the bridge bitstream directory.
const DATA_DIR: &str = "/usr/local/share/fpga-loader";

/// Locates `spiOverJtag_<part>.<ext>[.gz]` under the data directory
/// (`FPGA_LOADER_DATA_DIR` overrides the built-in default).
pub(crate) fn bridge_bitstream(part: &str, ext: &str) -> Result<PathBuf> {
    let dir = std::env::var("FPGA_LOADER_DATA_DIR").unwrap_or_else(|_| DATA_DIR.to_string());
    let base = PathBuf::from(dir);
    for name in [
        format!("spiOverJtag_{part}.{ext}.gz"),
        format!("spiOverJtag_{part}.{ext}"),
    ] {
        let candidate = base.join(&name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::SoftFail(format!(
        "no SPI-over-JTAG bridge for part {part} under {}",
        base.display()
    )))
}

/// Checks that the image targets the silicon on the chain; version nibble
/// ignored on both sides.
pub(crate) fn check_idcode(expected: Option<u32>, actual: u32) -> Result<()> {
    let Some(expected) = expected else {
        tracing::warn!("bitstream carries no IDCODE, skipping the hardware cross-check");
        return Ok(());
    };
    if expected & 0x0fff_ffff != actual & 0x0fff_ffff {
        return Err(Error::IdcodeMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idcode_check_masks_version() {
        check_idcode(Some(0x1362_c093), 0x0362_c093).unwrap();
        let err = check_idcode(Some(0x0362_c093), 0x0362_d093).unwrap_err();
        assert!(matches!(err, Error::IdcodeMismatch { .. }));
        check_idcode(None, 0x0362_c093).unwrap();
    }
}
