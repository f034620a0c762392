//! End-to-end flows against the replay transport, through the public API
//! only.

use fpga_loader::jtag::{Jtag, TapState};
use fpga_loader::parser::svf;
use fpga_loader::probe::mock::MockTransport;
use fpga_loader::svf::SvfPlayer;
use fpga_loader::Error;

#[test]
fn scan_select_and_shift() {
    let probe = MockTransport::new();
    let handle = probe.handle();
    {
        let mut m = handle.borrow_mut();
        m.queue_read_u32(0x0362c093); // XC7A50T nearest TDO
        m.queue_read_u32(0x4ba00477); // ARM DAP
        m.queue_read_u32(0xffffffff);
    }

    let mut jtag = Jtag::new(Box::new(probe));
    assert_eq!(jtag.detect_chain(5).unwrap(), 2);
    assert_eq!(jtag.devices(), &[0x0362c093, 0x0ba00477]);
    assert_eq!(jtag.irlengths(), &[6, 4]);

    jtag.device_select(0).unwrap();
    handle.borrow_mut().clear_logs();

    // A 6-bit IR shift to the target pads four BYPASS ones for the DAP.
    jtag.shift_ir(&[0x09], None, 6, TapState::RunTestIdle)
        .unwrap();
    let m = handle.borrow();
    assert_eq!(m.tdi_bits.len(), 10);
    assert!(m.tdi_bits[6..].iter().all(|b| *b));
    assert_eq!(m.tms_on_tdi, vec![9]);
}

#[test]
fn out_of_range_selection_is_rejected() {
    let probe = MockTransport::new();
    let handle = probe.handle();
    handle.borrow_mut().queue_read_u32(0x0362c093);
    handle.borrow_mut().queue_read_u32(0);

    let mut jtag = Jtag::new(Box::new(probe));
    jtag.detect_chain(5).unwrap();
    assert!(matches!(
        jtag.device_select(1),
        Err(Error::StateMachineMisuse(_))
    ));
}

#[test]
fn svf_program_through_public_api() {
    let probe = MockTransport::new();
    let handle = probe.handle();
    let mut jtag = Jtag::new(Box::new(probe));
    jtag.insert_first(0x020f30dd, 10);
    jtag.device_select(0).unwrap();

    let statements = svf::parse(
        b"STATE RESET;\nENDIR IDLE;\nENDDR IDLE;\nSIR 10 TDI (002);\nRUNTEST IDLE 12000 TCK;\nSDR 16 TDI (BEEF);\n",
    )
    .unwrap();
    SvfPlayer::new(&mut jtag).run(&statements).unwrap();

    let m = handle.borrow();
    assert!(m.clk_log.contains(&(false, false, 12_000)));
    // The SDR payload ends the stream: 0xBEEF LSB-first.
    let tail: Vec<bool> = m.tdi_bits[m.tdi_bits.len() - 16..].to_vec();
    let value = tail
        .iter()
        .enumerate()
        .fold(0u16, |acc, (i, b)| acc | ((*b as u16) << i));
    assert_eq!(value, 0xbeef);
}
