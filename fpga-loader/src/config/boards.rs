//! The board registry: names a cable, a default part and pin maps.

/// How the board's configuration memory is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    /// Standard JTAG chain.
    Jtag,
    /// Direct SPI to the configuration flash.
    Spi,
    /// USB DFU bootloader.
    Dfu,
}

/// JTAG signal positions for bit-bang transports.
#[derive(Debug, Clone, Copy)]
pub struct JtagPins {
    /// TMS pin bit.
    pub tms: u8,
    /// TCK pin bit.
    pub tck: u8,
    /// TDI pin bit.
    pub tdi: u8,
    /// TDO pin bit.
    pub tdo: u8,
}

/// SPI signal positions (16-bit masks span ADBUS+ACBUS).
#[derive(Debug, Clone, Copy)]
pub struct SpiPins {
    /// Chip select.
    pub cs: u16,
    /// Clock.
    pub sck: u16,
    /// Master in.
    pub miso: u16,
    /// Master out.
    pub mosi: u16,
    /// HOLD#, driven high during access.
    pub holdn: u16,
    /// WP#, driven high during access.
    pub wpn: u16,
}

/// One board registry entry; immutable.
#[derive(Debug, Clone, Copy)]
pub struct Board {
    /// Registry key.
    pub name: &'static str,
    /// Name of the cable soldered to / shipped with the board.
    pub cable: &'static str,
    /// Default FPGA part, overridable from the command line.
    pub fpga_part: &'static str,
    /// Reset side-band pin mask (0 = none).
    pub reset_pin: u16,
    /// DONE side-band pin mask (0 = none).
    pub done_pin: u16,
    /// Output-enable side-band pin mask (0 = none).
    pub oe_pin: u16,
    /// Communication mode.
    pub mode: CommMode,
    /// Bit-bang JTAG pin map, when the cable needs one.
    pub jtag_pins: Option<JtagPins>,
    /// Direct-SPI pin map.
    pub spi_pins: Option<SpiPins>,
    /// Default TCK frequency in Hz; 0 keeps the cable default.
    pub default_freq: u32,
    /// USB VID, DFU boards only.
    pub vid: u16,
    /// USB PID, DFU boards only.
    pub pid: u16,
    /// DFU interface altsetting, -1 when unused.
    pub altsetting: i16,
}

const fn jtag_board(
    name: &'static str,
    fpga_part: &'static str,
    cable: &'static str,
    default_freq: u32,
) -> Board {
    Board {
        name,
        cable,
        fpga_part,
        reset_pin: 0,
        done_pin: 0,
        oe_pin: 0,
        mode: CommMode::Jtag,
        jtag_pins: None,
        spi_pins: None,
        default_freq,
        vid: 0,
        pid: 0,
        altsetting: -1,
    }
}

const MHZ: u32 = 1_000_000;

/// Known boards.
pub static BOARD_LIST: &[Board] = &[
    jtag_board("ac701", "xc7a200tfbg676", "digilent", 0),
    jtag_board("arty_a7_35t", "xc7a35tcsg324", "digilent", 10 * MHZ),
    jtag_board("arty_a7_100t", "xc7a100tcsg324", "digilent", 10 * MHZ),
    jtag_board("arty_s7_50", "xc7s50csga324", "digilent", 0),
    jtag_board("basys3", "xc7a35tcpg236", "digilent", 0),
    jtag_board("colorlight-i5", "LFE5UM-25", "cmsisdap", 0),
    jtag_board("crosslinknx_evn", "LIFCL-40", "ft2232", MHZ),
    jtag_board("cyc1000", "10CL025", "ft2232", 0),
    jtag_board("de0nano", "EP3C16", "usb-blaster", 0),
    jtag_board("ecp5_evn", "LFE5UM-85", "ft2232", 0),
    jtag_board("gatemate_evb_jtag", "GM1Ax", "gatemate_evb_jtag", 0),
    Board {
        spi_pins: Some(SpiPins {
            cs: 1 << 4,
            sck: 1 << 0,
            miso: 1 << 2,
            mosi: 1 << 1,
            holdn: 1 << 7,
            wpn: 1 << 6,
        }),
        reset_pin: 1 << 5,
        done_pin: 1 << 3,
        mode: CommMode::Spi,
        ..jtag_board("gatemate_evb_spi", "GM1Ax", "gatemate_evb_spi", 0)
    },
    Board {
        spi_pins: Some(SpiPins {
            cs: 1 << 3,
            sck: 1 << 0,
            miso: 1 << 2,
            mosi: 1 << 1,
            holdn: 0,
            wpn: 0,
        }),
        reset_pin: 1 << 6,
        done_pin: 1 << 7,
        mode: CommMode::Spi,
        ..jtag_board("ice40_generic", "", "ft2232", 0)
    },
    jtag_board("machxo2_evn", "LCMXO2-7000HE", "ft2232", 0),
    jtag_board("machxo3_sk", "LCMXO3LF-1300", "ft2232", 0),
    jtag_board("max10_deca", "10M50DA", "usb-blasterII", 0),
    jtag_board("nexys_a7_50", "xc7a50tcsg324", "digilent", 0),
    jtag_board("orangecrab", "LFE5UM-25", "dfu", 0),
    jtag_board("runber", "GW1N-4", "ft232", 0),
    jtag_board("tangnano", "GW1N-1", "ch552_jtag", 0),
    jtag_board("tangnano4k", "GW1NSR-4C", "ch552_jtag", 0),
    jtag_board("tangnano9k", "GW1NR-9", "ch552_jtag", 0),
    jtag_board("tangprimer20k", "GW2A-18", "ch552_jtag", 0),
    jtag_board("trion_t8", "T4/T8", "efinix_jtag_ft2232", 0),
    jtag_board("xyloni_jtag", "T4/T8", "efinix_jtag_ft4232", 0),
    Board {
        mode: CommMode::Dfu,
        vid: 0x1209,
        pid: 0x5af0,
        altsetting: 0,
        ..jtag_board("orangecrab_dfu", "LFE5UM-25", "dfu", 0)
    },
];

/// Finds a board registry entry by name.
pub fn board_by_name(name: &str) -> Option<&'static Board> {
    BOARD_LIST.iter().find(|b| b.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cable_by_name;

    #[test]
    fn board_lookup() {
        let b = board_by_name("tangnano9k").unwrap();
        assert_eq!(b.cable, "ch552_jtag");
        assert_eq!(b.mode, CommMode::Jtag);
    }

    #[test]
    fn every_board_cable_resolves() {
        for b in BOARD_LIST {
            assert!(
                cable_by_name(b.cable).is_some(),
                "board {} names unknown cable {}",
                b.name,
                b.cable
            );
        }
    }
}
