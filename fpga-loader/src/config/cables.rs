//! The probe (cable) registry.

/// Transport family of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CableKind {
    /// FTDI chip in MPSSE mode (FT2232/FT232H/FT4232).
    FtdiSerial,
    /// FTDI chip in bit-bang mode (FT232R/FT231X).
    FtdiBitbang,
    /// CH552-based probe (Sipeed Tang boards).
    Ch552Jtag,
    /// WCH CH347 high-speed bridge.
    Ch347,
    /// DirtyJTAG firmware on an STM32.
    DirtyJtag,
    /// Altera USB-Blaster (FT245 + CPLD).
    UsbBlasterI,
    /// Altera USB-Blaster II (Cypress FX2).
    UsbBlasterII,
    /// CMSIS-DAP HID probe.
    CmsisDap,
    /// Gowin GWU2X bridge.
    GwU2x,
    /// Anlogic USB cable.
    AnlogicCable,
    /// USB DFU bootloader; not a JTAG transport.
    Dfu,
    /// Memory-mapped GPIO bit-bang on a Jetson Nano header.
    JetsonGpio,
    /// Character-device GPIO bit-bang.
    LibgpiodGpio,
    /// OpenOCD remote_bitbang protocol over TCP.
    RemoteBitbang,
    /// Xilinx Virtual Cable client over TCP.
    XvcClient,
    /// Black Magic Probe (unsupported, listed for chain documentation).
    Bmp,
    /// Segger J-Link (unsupported, listed for chain documentation).
    Jlink,
    /// Espressif USB-JTAG peripheral (unsupported).
    Esp,
}

/// FTDI interface and initial pin state for MPSSE/bit-bang cables.
#[derive(Debug, Clone, Copy, Default)]
pub struct MpsseConfig {
    /// FTDI interface index, 1..=4 maps to A..D.
    pub interface: u8,
    /// ADBUS initial value.
    pub low_value: u8,
    /// ADBUS direction mask (1 = output).
    pub low_dir: u8,
    /// ACBUS initial value.
    pub high_value: u8,
    /// ACBUS direction mask.
    pub high_dir: u8,
}

/// A probe registry entry; immutable once chosen.
#[derive(Debug, Clone, Copy)]
pub struct Cable {
    /// Registry key.
    pub name: &'static str,
    /// Transport family.
    pub kind: CableKind,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// FTDI-specific initial configuration.
    pub mpsse: MpsseConfig,
}

const fn ftdi_ser(
    name: &'static str,
    vid: u16,
    pid: u16,
    interface: u8,
    low_value: u8,
    low_dir: u8,
    high_value: u8,
    high_dir: u8,
) -> Cable {
    Cable {
        name,
        kind: CableKind::FtdiSerial,
        vid,
        pid,
        mpsse: MpsseConfig {
            interface,
            low_value,
            low_dir,
            high_value,
            high_dir,
        },
    }
}

const fn ftdi_bb(
    name: &'static str,
    vid: u16,
    pid: u16,
    low_value: u8,
    low_dir: u8,
) -> Cable {
    Cable {
        name,
        kind: CableKind::FtdiBitbang,
        vid,
        pid,
        mpsse: MpsseConfig {
            interface: 1,
            low_value,
            low_dir,
            high_value: 0,
            high_dir: 0,
        },
    }
}

const fn plain(name: &'static str, kind: CableKind, vid: u16, pid: u16) -> Cable {
    Cable {
        name,
        kind,
        vid,
        pid,
        mpsse: MpsseConfig {
            interface: 1,
            low_value: 0,
            low_dir: 0,
            high_value: 0,
            high_dir: 0,
        },
    }
}

/// All known probes. The low/high byte columns are the ADBUS/ACBUS initial
/// value and direction masks; some cables require explicit levels on
/// side-band I/Os (resets, output enables, LEDs).
pub static CABLE_LIST: &[Cable] = &[
    plain("anlogicCable", CableKind::AnlogicCable, 0x0547, 0x1002),
    ftdi_ser("arm-usb-ocd-h", 0x15ba, 0x002b, 1, 0x08, 0x1b, 0x09, 0x0b),
    ftdi_ser("arm-usb-tiny-h", 0x15ba, 0x002a, 1, 0x08, 0x1b, 0x09, 0x0b),
    ftdi_ser("bus_blaster", 0x0403, 0x6010, 1, 0x08, 0x1b, 0x08, 0x0b),
    ftdi_ser("bus_blaster_b", 0x0403, 0x6010, 2, 0x08, 0x0b, 0x08, 0x0b),
    plain("ch347_jtag", CableKind::Ch347, 0x1a86, 0x55dd),
    plain("ch552_jtag", CableKind::Ch552Jtag, 0x0403, 0x6010),
    plain("cmsisdap", CableKind::CmsisDap, 0x0d28, 0x0204),
    plain("dfu", CableKind::Dfu, 0, 0),
    ftdi_ser("digilent", 0x0403, 0x6010, 1, 0xe8, 0xeb, 0x00, 0x60),
    ftdi_ser("digilent_b", 0x0403, 0x6010, 2, 0xe8, 0xeb, 0x00, 0x60),
    ftdi_ser("digilent_hs2", 0x0403, 0x6014, 1, 0xe8, 0xeb, 0x00, 0x60),
    ftdi_ser("digilent_hs3", 0x0403, 0x6014, 1, 0x88, 0x8b, 0x20, 0x30),
    plain("dirtyJtag", CableKind::DirtyJtag, 0x1209, 0xc0ca),
    ftdi_ser("efinix_spi_ft4232", 0x0403, 0x6011, 1, 0x08, 0x8b, 0x00, 0x00),
    ftdi_ser("efinix_jtag_ft4232", 0x0403, 0x6011, 2, 0x08, 0x8b, 0x00, 0x00),
    ftdi_ser("efinix_spi_ft2232", 0x0403, 0x6010, 1, 0x08, 0x8b, 0x00, 0x00),
    ftdi_ser("efinix_jtag_ft2232", 0x0403, 0x6010, 2, 0x08, 0x8b, 0x00, 0x00),
    ftdi_ser("ft2232", 0x0403, 0x6010, 1, 0x08, 0x0b, 0x08, 0x0b),
    ftdi_ser("ft2232_b", 0x0403, 0x6010, 2, 0x08, 0x0b, 0x00, 0x00),
    ftdi_bb("ft231X", 0x0403, 0x6015, 0x00, 0x00),
    ftdi_ser("ft232", 0x0403, 0x6014, 1, 0x08, 0x0b, 0x08, 0x0b),
    ftdi_bb("ft232RL", 0x0403, 0x6001, 0x08, 0x0b),
    ftdi_ser("ft4232", 0x0403, 0x6011, 1, 0x08, 0x0b, 0x08, 0x0b),
    ftdi_ser("ft4232_b", 0x0403, 0x6011, 2, 0x00, 0x1b, 0x00, 0x00),
    ftdi_ser("gatemate_pgm", 0x0403, 0x6014, 1, 0x10, 0x9b, 0x14, 0x17),
    ftdi_ser("gatemate_evb_jtag", 0x0403, 0x6010, 1, 0x10, 0x1b, 0x00, 0x01),
    ftdi_ser("gatemate_evb_spi", 0x0403, 0x6010, 2, 0x00, 0x1b, 0x00, 0x01),
    Cable {
        name: "gwu2x",
        kind: CableKind::GwU2x,
        vid: 0x33aa,
        pid: 0x0120,
        mpsse: MpsseConfig {
            interface: 1,
            low_value: 0x02,
            low_dir: 0x07,
            high_value: 0,
            high_dir: 0,
        },
    },
    plain("jetson-nano-gpio", CableKind::JetsonGpio, 0, 0),
    plain("jlink", CableKind::Jlink, 0x1366, 0x0105),
    ftdi_ser("jtag-smt2-nc", 0x0403, 0x6014, 1, 0xe8, 0xeb, 0x00, 0x60),
    plain("libgpiod", CableKind::LibgpiodGpio, 0, 0),
    plain("lpc-link2", CableKind::CmsisDap, 0x1fc9, 0x0090),
    ftdi_ser("numato", 0x2a19, 0x1009, 2, 0x08, 0x4b, 0x00, 0x00),
    plain("orbtrace", CableKind::CmsisDap, 0x1209, 0x3443),
    ftdi_ser("papilio", 0x0403, 0x6010, 1, 0x08, 0x0b, 0x09, 0x0b),
    plain("remote-bitbang", CableKind::RemoteBitbang, 0, 0),
    ftdi_ser("tigard", 0x0403, 0x6010, 2, 0x08, 0x3b, 0x00, 0x00),
    plain("usb-blaster", CableKind::UsbBlasterI, 0x09fb, 0x6001),
    plain("usb-blasterII", CableKind::UsbBlasterII, 0x09fb, 0x6810),
    plain("xvc-client", CableKind::XvcClient, 0, 0),
];

/// Finds a cable registry entry by name.
pub fn cable_by_name(name: &str) -> Option<&'static Cable> {
    CABLE_LIST.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let c = cable_by_name("digilent_hs2").unwrap();
        assert_eq!(c.kind, CableKind::FtdiSerial);
        assert_eq!((c.vid, c.pid), (0x0403, 0x6014));
        assert!(cable_by_name("no-such-cable").is_none());
    }

    #[test]
    fn names_are_unique() {
        for (i, a) in CABLE_LIST.iter().enumerate() {
            for b in &CABLE_LIST[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}
