//! Silicon lookup tables keyed by JTAG IDCODE.
//!
//! The IR length column is the only source of IR lengths in the whole tool:
//! chain scanning fails closed when a discovered IDCODE is in neither table.

/// One supported FPGA/CPLD/PROM model.
#[derive(Debug, Clone, Copy)]
pub struct FpgaModel {
    /// JTAG IDCODE with the version nibble masked off (except GateMate).
    pub idcode: u32,
    /// Silicon vendor.
    pub manufacturer: &'static str,
    /// Device family, drives driver selection.
    pub family: &'static str,
    /// Human-readable model name.
    pub model: &'static str,
    /// Instruction register length in bits.
    pub irlength: usize,
}

const fn fpga(
    idcode: u32,
    manufacturer: &'static str,
    family: &'static str,
    model: &'static str,
    irlength: usize,
) -> FpgaModel {
    FpgaModel {
        idcode,
        manufacturer,
        family,
        model,
        irlength,
    }
}

/// All devices the programming flows know how to drive.
pub static FPGA_LIST: &[FpgaModel] = &[
    fpga(0x0a014c35, "anlogic", "eagle s20", "EG4S20BG256", 8),
    // Xilinx 7-series
    fpga(0x0362d093, "xilinx", "artix a7 35t", "xc7a35t", 6),
    fpga(0x0362c093, "xilinx", "artix a7 50t", "xc7a50t", 6),
    fpga(0x03632093, "xilinx", "artix a7 75t", "xc7a75t", 6),
    fpga(0x03631093, "xilinx", "artix a7 100t", "xc7a100t", 6),
    fpga(0x03636093, "xilinx", "artix a7 200t", "xc7a200t", 6),
    fpga(0x03651093, "xilinx", "kintex7", "xc7k325t", 6),
    fpga(0x03620093, "xilinx", "spartan7", "xc7s15", 6),
    fpga(0x037c4093, "xilinx", "spartan7", "xc7s25", 6),
    fpga(0x0362f093, "xilinx", "spartan7", "xc7s50", 6),
    fpga(0x03727093, "xilinx", "zynq", "xc7z020", 6),
    // Xilinx Spartan-6
    fpga(0x04001093, "xilinx", "spartan6", "xc6slx9", 6),
    fpga(0x04002093, "xilinx", "spartan6", "xc6slx16", 6),
    fpga(0x04004093, "xilinx", "spartan6", "xc6slx25", 6),
    fpga(0x04008093, "xilinx", "spartan6", "xc6slx45", 6),
    fpga(0x04011093, "xilinx", "spartan6", "xc6slx100", 6),
    // Xilinx XCF serial PROMs
    fpga(0x05044093, "xilinx", "xcf", "xcf01s", 8),
    fpga(0x05045093, "xilinx", "xcf", "xcf02s", 8),
    fpga(0x05046093, "xilinx", "xcf", "xcf04s", 8),
    // Xilinx XC9500XL CPLDs
    fpga(0x09602093, "xilinx", "xc95", "xc9536xl", 8),
    fpga(0x09604093, "xilinx", "xc95", "xc9572xl", 8),
    fpga(0x09608093, "xilinx", "xc95", "xc95144xl", 8),
    fpga(0x09616093, "xilinx", "xc95", "xc95288xl", 8),
    // Xilinx CoolRunner-II CPLDs
    fpga(0x06e1c093, "xilinx", "xc2c", "xc2c32a", 8),
    fpga(0x06e5c093, "xilinx", "xc2c", "xc2c64a", 8),
    fpga(0x06d8a093, "xilinx", "xc2c", "xc2c128", 8),
    fpga(0x06d1c093, "xilinx", "xc2c", "xc2c256", 8),
    // Intel/Altera
    fpga(0x020f20dd, "altera", "cyclone III", "EP3C16", 10),
    fpga(0x020f30dd, "altera", "cyclone 10 LP", "10CL025", 10),
    fpga(0x02b150dd, "altera", "cyclone V", "5CEA2", 10),
    fpga(0x02b050dd, "altera", "cyclone V", "5CEBA4", 10),
    fpga(0x02d020dd, "altera", "cyclone V Soc", "5CSEBA6", 10),
    fpga(0x02d010dd, "altera", "cyclone V Soc", "5CSEMA4", 10),
    fpga(0x031820dd, "altera", "MAX 10", "10M08SA", 10),
    fpga(0x031050dd, "altera", "MAX 10", "10M50DA", 10),
    // Lattice Nexus
    fpga(0x010f0043, "lattice", "CrosslinkNX", "LIFCL-17", 8),
    fpga(0x010f1043, "lattice", "CrosslinkNX", "LIFCL-40", 8),
    fpga(0x010f0443, "lattice", "CertusNX", "LFD2NX-17", 8),
    fpga(0x010f1443, "lattice", "CertusNX", "LFD2NX-40", 8),
    // Lattice MachXO2/XO3
    fpga(0x012b9043, "lattice", "MachXO2", "LCMXO2-640HC", 8),
    fpga(0x012ba043, "lattice", "MachXO2", "LCMXO2-1200HC", 8),
    fpga(0x012bb043, "lattice", "MachXO2", "LCMXO2-2000HC", 8),
    fpga(0x012bc043, "lattice", "MachXO2", "LCMXO2-4000HC", 8),
    fpga(0x012bd043, "lattice", "MachXO2", "LCMXO2-7000HC", 8),
    fpga(0x012b5043, "lattice", "MachXO2", "LCMXO2-7000HE", 8),
    fpga(0x012b2043, "lattice", "MachXO3LF", "LCMXO3LF-1300", 8),
    fpga(0x012b3043, "lattice", "MachXO3LF", "LCMXO3LF-2100", 8),
    fpga(0x012b4043, "lattice", "MachXO3LF", "LCMXO3LF-4300", 8),
    fpga(0x012e3043, "lattice", "MachXO3D", "LCMXO3D-9400HC", 8),
    // Lattice ECP5
    fpga(0x01111043, "lattice", "ECP5", "LFE5UM-25", 8),
    fpga(0x01112043, "lattice", "ECP5", "LFE5UM-45", 8),
    fpga(0x01113043, "lattice", "ECP5", "LFE5UM-85", 8),
    // Gowin
    fpga(0x0100581b, "gowin", "GW1N", "GW1NR-9", 8),
    fpga(0x0900281b, "gowin", "GW1N", "GW1N-1", 8),
    fpga(0x0100381b, "gowin", "GW1N", "GW1N-4", 8),
    fpga(0x0300181b, "gowin", "GW1NS", "GW1NS-2C", 8),
    fpga(0x0100981b, "gowin", "GW1NSR", "GW1NSR-4C", 8),
    fpga(0x0000081b, "gowin", "GW2A", "GW2A-18", 8),
    // Efinix; Trion T4/T8 share the masked value of the GateMate IDCODE,
    // hence the full-width GateMate key below.
    fpga(0x00000001, "efinix", "trion", "T4/T8", 4),
    fpga(0x00210a79, "efinix", "trion", "T13/T20", 4),
    fpga(0x00240a79, "efinix", "trion", "T55/T85/T120", 4),
    // Cologne Chip GateMate, stored with its version nibble intact.
    fpga(0x20000001, "colognechip", "gatemate", "GM1Ax", 6),
];

/// A device that may sit in a chain without being programmable by this tool.
#[derive(Debug, Clone, Copy)]
pub struct MiscDevice {
    /// Masked IDCODE.
    pub idcode: u32,
    /// What it is.
    pub name: &'static str,
    /// Instruction register length in bits.
    pub irlength: usize,
}

/// Known chain neighbours (debug TAPs and the like).
pub static MISC_DEV_LIST: &[MiscDevice] = &[
    MiscDevice {
        idcode: 0x0ba00477,
        name: "ARM cortex A9",
        irlength: 4,
    },
    MiscDevice {
        idcode: 0x0ba00471,
        name: "ARM DAP (Zynq)",
        irlength: 4,
    },
];

/// Looks up a programmable device by (masked) IDCODE.
pub fn fpga_by_idcode(idcode: u32) -> Option<&'static FpgaModel> {
    FPGA_LIST.iter().find(|m| m.idcode == idcode)
}

/// Looks up a device by part-name prefix, e.g. `xc7a50tcsg324` matches
/// the `xc7a50t` entry.
pub fn fpga_by_part_name(name: &str) -> Option<&'static FpgaModel> {
    let lower = name.to_ascii_lowercase();
    FPGA_LIST
        .iter()
        .filter(|m| lower.starts_with(&m.model.to_ascii_lowercase()))
        .max_by_key(|m| m.model.len())
}

/// IR length for a chain member, consulting both tables.
pub fn irlength_for(idcode: u32) -> Option<usize> {
    fpga_by_idcode(idcode)
        .map(|m| m.irlength)
        .or_else(|| {
            MISC_DEV_LIST
                .iter()
                .find(|d| d.idcode == idcode)
                .map(|d| d.irlength)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idcode_lookup() {
        let m = fpga_by_idcode(0x0362c093).unwrap();
        assert_eq!(m.model, "xc7a50t");
        assert_eq!(m.irlength, 6);
        assert!(fpga_by_idcode(0xdeadbeef).is_none());
    }

    #[test]
    fn part_name_prefix_lookup() {
        let m = fpga_by_part_name("xc7a50tcsg324").unwrap();
        assert_eq!(m.idcode, 0x0362c093);
        let m = fpga_by_part_name("LCMXO2-1200HC").unwrap();
        assert_eq!(m.family, "MachXO2");
    }

    #[test]
    fn misc_devices_provide_irlength() {
        assert_eq!(irlength_for(0x0ba00477), Some(4));
        assert_eq!(irlength_for(0x12345678), None);
    }
}
