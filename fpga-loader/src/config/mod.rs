//! Compile-time lookup tables: probes, boards and silicon.
//!
//! All three registries are immutable slices of plain structs; access is a
//! pure lookup keyed by name or IDCODE.

mod boards;
mod cables;
mod parts;

pub use boards::{Board, CommMode, JtagPins, SpiPins, board_by_name, BOARD_LIST};
pub use cables::{Cable, CableKind, MpsseConfig, cable_by_name, CABLE_LIST};
pub use parts::{
    fpga_by_idcode, fpga_by_part_name, irlength_for, FpgaModel, MiscDevice, FPGA_LIST,
    MISC_DEV_LIST,
};
