//! Loads configuration bitstreams into FPGAs, CPLDs and their attached
//! configuration flash through USB probes.
//!
//! The crate is a stack of four layers, built leaves-first:
//!
//! * [`probe`] — bytes and bits on the wire (FTDI MPSSE, bit-bang, HID,
//!   vendor bulk protocols, TCP tunnels);
//! * [`jtag`] — the TAP engine: chain scan, IR/DR shifts with bypass
//!   padding;
//! * [`spi`] — the uniform SPI access layer and the NOR flash driver, fed
//!   either by a dedicated SPI probe or tunneled through the FPGA's bscan
//!   user register;
//! * [`devices`] — per-vendor program/verify/dump flows;
//! * [`parser`] — bitstream file decoders.
//!
//! ```no_run
//! use fpga_loader::{config, jtag::Jtag, probe};
//!
//! # fn main() -> fpga_loader::Result<()> {
//! let cable = config::cable_by_name("digilent_hs2").unwrap();
//! let transport = probe::open_cable(cable, None, 6_000_000, &Default::default())?;
//! let mut jtag = Jtag::new(transport);
//! jtag.detect_chain(5)?;
//! for idcode in jtag.devices() {
//!     println!("found 0x{idcode:08x}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod devices;
pub mod dfu;
mod error;
pub mod jtag;
pub mod parser;
pub mod probe;
pub mod progress;
pub mod spi;
pub mod svf;
pub mod util;
pub mod xvc_server;

pub use crate::error::{Error, Result, TransportErrorKind};
