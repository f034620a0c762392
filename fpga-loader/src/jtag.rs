//! The TAP controller engine: state tracking, chain scan and IR/DR shifts
//! with bypass padding for mixed chains.

use crate::config::irlength_for;
use crate::error::{Error, Result};
use crate::probe::JtagTransport;
use crate::util::bit_set;

/// The sixteen states of the 1149.1 TAP diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    /// Test-Logic-Reset.
    TestLogicReset,
    /// Run-Test/Idle.
    RunTestIdle,
    /// Select-DR-Scan.
    SelectDrScan,
    /// Capture-DR.
    CaptureDr,
    /// Shift-DR.
    ShiftDr,
    /// Exit1-DR.
    Exit1Dr,
    /// Pause-DR.
    PauseDr,
    /// Exit2-DR.
    Exit2Dr,
    /// Update-DR.
    UpdateDr,
    /// Select-IR-Scan.
    SelectIrScan,
    /// Capture-IR.
    CaptureIr,
    /// Shift-IR.
    ShiftIr,
    /// Exit1-IR.
    Exit1Ir,
    /// Pause-IR.
    PauseIr,
    /// Exit2-IR.
    Exit2Ir,
    /// Update-IR.
    UpdateIr,
}

use TapState::*;

const TMS_BUFFER_SIZE: usize = 128;

/// GateMate and Trion T4/T8 share the low 28 IDCODE bits; the full-width
/// value disambiguates them during a scan.
const GATEMATE_IDCODE: u32 = 0x2000_0001;

/// The JTAG engine. Owns the transport; drivers borrow the engine for the
/// duration of one programming operation.
///
/// Chain ordering convention: index 0 is the device nearest TDO, i.e. the
/// one whose IDCODE bits appear first during a scan.
pub struct Jtag {
    transport: Box<dyn JtagTransport>,
    state: TapState,
    tms_buffer: [u8; TMS_BUFFER_SIZE],
    num_tms: usize,
    devices: Vec<u32>,
    irlengths: Vec<usize>,
    device_index: usize,
    clk_freq: u32,
}

impl Jtag {
    /// Wraps a freshly opened transport. The TAP state is unknown until the
    /// first [`Jtag::go_test_logic_reset`].
    pub fn new(transport: Box<dyn JtagTransport>) -> Self {
        Self {
            transport,
            state: RunTestIdle,
            tms_buffer: [0; TMS_BUFFER_SIZE],
            num_tms: 0,
            devices: Vec::new(),
            irlengths: Vec::new(),
            device_index: 0,
            clk_freq: 6_000_000,
        }
    }

    /// Requests a TCK frequency, returning the one the probe configured.
    pub fn set_clock(&mut self, hz: u32) -> Result<u32> {
        self.clk_freq = self.transport.set_clock(hz)?;
        Ok(self.clk_freq)
    }

    /// The last configured TCK frequency in Hz.
    pub fn clock_frequency(&self) -> u32 {
        self.clk_freq
    }

    /// IDCODEs of the scanned chain, nearest-TDO first.
    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    /// IR lengths parallel to [`Jtag::devices`].
    pub fn irlengths(&self) -> &[usize] {
        &self.irlengths
    }

    /// Index of the currently selected device.
    pub fn selected_index(&self) -> usize {
        self.device_index
    }

    /// Direct access to the transport for side-band GPIO use.
    pub fn transport_mut(&mut self) -> &mut dyn JtagTransport {
        self.transport.as_mut()
    }

    /// Scans the chain: reset, shift out up to `max_devices` IDCODE words,
    /// resolve each against the part tables.
    ///
    /// Fails closed with [`Error::UnsupportedDevice`] when an IDCODE is in
    /// neither table, since the IR length would be unknown.
    pub fn detect_chain(&mut self, max_devices: usize) -> Result<usize> {
        self.devices.clear();
        self.irlengths.clear();

        self.go_test_logic_reset()?;
        self.set_state(ShiftDr)?;

        // Some bridges (CH552 on Tang boards) require a write with every
        // read, so shift all-ones.
        let tx = [0xffu8; 4];
        for _ in 0..max_devices {
            let mut rx = [0u8; 4];
            self.read_write(Some(&tx), Some(&mut rx), 32, false)?;
            let raw = u32::from_le_bytes(rx);
            if raw == 0 || raw == 0xffff_ffff {
                break;
            }
            let idcode = if raw == GATEMATE_IDCODE {
                raw
            } else {
                raw & 0x0fff_ffff
            };
            let irlength =
                irlength_for(idcode).ok_or(Error::UnsupportedDevice { idcode })?;
            tracing::debug!("chain[{}]: 0x{idcode:08x} (irlength {irlength})", self.devices.len());
            self.devices.push(idcode);
            self.irlengths.push(irlength);
        }

        self.go_test_logic_reset()?;
        self.flush_tms(true)?;
        Ok(self.devices.len())
    }

    /// Selects the target device for subsequent IR/DR shifts.
    pub fn device_select(&mut self, index: usize) -> Result<()> {
        if index >= self.devices.len() {
            return Err(Error::StateMachineMisuse("device index out of chain"));
        }
        self.device_index = index;
        Ok(())
    }

    /// Prepends a synthetic chain entry for a device that does not answer a
    /// scan but is known to be present.
    pub fn insert_first(&mut self, idcode: u32, irlength: usize) {
        self.devices.insert(0, idcode);
        self.irlengths.insert(0, irlength);
    }

    fn push_tms(&mut self, tms: bool) -> Result<()> {
        if self.num_tms + 1 == TMS_BUFFER_SIZE * 8 {
            self.flush_tms(false)?;
        }
        if tms {
            self.tms_buffer[self.num_tms >> 3] |= 1 << (self.num_tms & 7);
        }
        self.num_tms += 1;
        Ok(())
    }

    /// Emits buffered TMS bits. With `flush_buffer` the transport queue is
    /// drained as well.
    pub fn flush_tms(&mut self, flush_buffer: bool) -> Result<()> {
        if self.num_tms != 0 {
            let bits = self.num_tms;
            let buffer = self.tms_buffer;
            self.transport.write_tms(&buffer, bits, flush_buffer)?;
            self.tms_buffer = [0; TMS_BUFFER_SIZE];
            self.num_tms = 0;
        } else if flush_buffer {
            self.transport.flush()?;
        }
        Ok(())
    }

    /// Forces Test-Logic-Reset: six TMS=1 clocks from any state.
    pub fn go_test_logic_reset(&mut self) -> Result<()> {
        for _ in 0..6 {
            self.push_tms(true)?;
        }
        self.flush_tms(false)?;
        self.state = TestLogicReset;
        Ok(())
    }

    /// Raw shift: TMS bits must be flushed first so payload never overlaps
    /// buffered state walking.
    pub fn read_write(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        last: bool,
    ) -> Result<()> {
        self.flush_tms(false)?;
        self.transport.write_tdi(tx, rx, bits, last)?;
        if last {
            self.state = if self.state == ShiftDr { Exit1Dr } else { Exit1Ir };
        }
        Ok(())
    }

    /// Runs `cycles` TCK periods in the current stable state.
    pub fn toggle_clk(&mut self, cycles: u32) -> Result<()> {
        let tms = self.state == TestLogicReset;
        self.flush_tms(false)?;
        self.transport.toggle_clk(tms, false, cycles)
    }

    /// Bypass bits clocked before/after the target's DR payload.
    fn dr_padding(&self) -> (usize, usize) {
        let before = self.device_index;
        let after = self.devices.len().saturating_sub(self.device_index + 1);
        (before, after)
    }

    /// BYPASS instruction bits clocked before/after the target's IR payload.
    fn ir_padding(&self) -> (usize, usize) {
        if self.irlengths.is_empty() {
            return (0, 0);
        }
        let before = self.irlengths[..self.device_index].iter().sum();
        let after = self.irlengths[self.device_index + 1..].iter().sum();
        (before, after)
    }

    fn send_padding(&mut self, bits: usize, fill: u8, last: bool) -> Result<()> {
        let tx = vec![fill; bits.div_ceil(8)];
        self.read_write(Some(&tx), None, bits, last)
    }

    /// Shifts `bits` of DR payload to the selected device, with one bypass
    /// bit of zero padding per non-target device.
    ///
    /// Passing `end == ShiftDr` keeps the TAP in Shift-DR for streaming;
    /// this is rejected when trailing bypass devices exist, because their
    /// padding could then never be delivered coherently.
    pub fn shift_dr(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end: TapState,
    ) -> Result<()> {
        let (before, after) = self.dr_padding();

        if end == ShiftDr && after > 0 {
            return Err(Error::StateMachineMisuse(
                "cannot stay in Shift-DR with bypass devices behind the target",
            ));
        }

        if self.state != ShiftDr {
            self.set_state(ShiftDr)?;
            self.flush_tms(false)?;
            if before > 0 {
                self.send_padding(before, 0x00, false)?;
            }
        }

        self.read_write(tx, rx, bits, after == 0 && end != ShiftDr)?;

        if end != ShiftDr {
            if after > 0 {
                self.send_padding(after, 0x00, true)?;
            }
            self.set_state(end)?;
        }
        Ok(())
    }

    /// Shifts an instruction into the selected device, loading BYPASS
    /// (all-ones) into every other device on the chain.
    pub fn shift_ir(
        &mut self,
        tx: &[u8],
        rx: Option<&mut [u8]>,
        bits: usize,
        end: TapState,
    ) -> Result<()> {
        let (before, after) = self.ir_padding();

        if end == ShiftIr && after > 0 {
            return Err(Error::StateMachineMisuse(
                "cannot stay in Shift-IR with bypass devices behind the target",
            ));
        }

        if self.state != ShiftIr {
            self.set_state(ShiftIr)?;
            self.flush_tms(false)?;
            if before > 0 {
                self.send_padding(before, 0xff, false)?;
            }
        }

        self.read_write(Some(tx), rx, bits, after == 0 && end != ShiftIr)?;

        if end != ShiftIr {
            if after > 0 {
                self.send_padding(after, 0xff, true)?;
            }
            self.set_state(end)?;
        }
        Ok(())
    }

    /// Convenience for the common one-byte instruction using the selected
    /// device's IR length.
    pub fn shift_ir_u8(&mut self, op: u8, end: TapState) -> Result<()> {
        let irlen = *self
            .irlengths
            .get(self.device_index)
            .ok_or(Error::StateMachineMisuse("no device selected"))?;
        debug_assert!(irlen <= 8);
        self.shift_ir(&[op], None, irlen, end)
    }

    /// Walks the TAP to `target` along the shortest legal path, buffering
    /// one TMS bit per step.
    pub fn set_state(&mut self, target: TapState) -> Result<()> {
        while self.state != target {
            let tms = match self.state {
                TestLogicReset => {
                    self.state = RunTestIdle;
                    false
                }
                RunTestIdle => {
                    self.state = SelectDrScan;
                    true
                }
                SelectDrScan => match target {
                    CaptureDr | ShiftDr | Exit1Dr | PauseDr | Exit2Dr | UpdateDr => {
                        self.state = CaptureDr;
                        false
                    }
                    _ => {
                        self.state = SelectIrScan;
                        true
                    }
                },
                SelectIrScan => match target {
                    CaptureIr | ShiftIr | Exit1Ir | PauseIr | Exit2Ir | UpdateIr => {
                        self.state = CaptureIr;
                        false
                    }
                    _ => {
                        self.state = TestLogicReset;
                        true
                    }
                },
                CaptureDr => {
                    if target == ShiftDr {
                        self.state = ShiftDr;
                        false
                    } else {
                        self.state = Exit1Dr;
                        true
                    }
                }
                ShiftDr => {
                    self.state = Exit1Dr;
                    true
                }
                Exit1Dr => match target {
                    PauseDr | Exit2Dr | ShiftDr => {
                        self.state = PauseDr;
                        false
                    }
                    _ => {
                        self.state = UpdateDr;
                        true
                    }
                },
                PauseDr => {
                    self.state = Exit2Dr;
                    true
                }
                Exit2Dr => match target {
                    ShiftDr | Exit1Dr | PauseDr => {
                        self.state = ShiftDr;
                        false
                    }
                    _ => {
                        self.state = UpdateDr;
                        true
                    }
                },
                UpdateDr => {
                    if target == RunTestIdle {
                        self.state = RunTestIdle;
                        false
                    } else {
                        self.state = SelectDrScan;
                        true
                    }
                }
                CaptureIr => {
                    if target == ShiftIr {
                        self.state = ShiftIr;
                        false
                    } else {
                        self.state = Exit1Ir;
                        true
                    }
                }
                ShiftIr => {
                    self.state = Exit1Ir;
                    true
                }
                Exit1Ir => match target {
                    PauseIr | Exit2Ir | ShiftIr => {
                        self.state = PauseIr;
                        false
                    }
                    _ => {
                        self.state = UpdateIr;
                        true
                    }
                },
                PauseIr => {
                    self.state = Exit2Ir;
                    true
                }
                Exit2Ir => match target {
                    ShiftIr | Exit1Ir | PauseIr => {
                        self.state = ShiftIr;
                        false
                    }
                    _ => {
                        self.state = UpdateIr;
                        true
                    }
                },
                UpdateIr => {
                    if target == RunTestIdle {
                        self.state = RunTestIdle;
                        false
                    } else {
                        self.state = SelectDrScan;
                        true
                    }
                }
            };
            self.push_tms(tms)?;
        }
        self.flush_tms(false)
    }

    /// The tracked TAP state.
    pub fn state(&self) -> TapState {
        self.state
    }

    /// Flushes everything still queued on the transport.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_tms(true)
    }
}

impl std::fmt::Debug for Jtag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jtag")
            .field("state", &self.state)
            .field("devices", &self.devices)
            .field("selected", &self.device_index)
            .finish_non_exhaustive()
    }
}

/// Builds a TMS byte buffer from a bit slice; exposed for transports that
/// reconstruct TMS sequences (XVC, bit-bang).
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        bit_set(&mut out, i, *bit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::{MockHandle, MockTransport};

    fn engine() -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        (Jtag::new(Box::new(probe)), handle)
    }

    #[test]
    fn tlr_reset_emits_six_ones() {
        let (mut jtag, mock) = engine();
        jtag.go_test_logic_reset().unwrap();
        jtag.flush().unwrap();
        assert_eq!(mock.borrow().tms_log, vec![true; 6]);
        assert_eq!(jtag.state(), TapState::TestLogicReset);
    }

    #[test]
    fn walk_tlr_to_shift_dr() {
        let (mut jtag, mock) = engine();
        jtag.go_test_logic_reset().unwrap();
        jtag.set_state(ShiftDr).unwrap();
        jtag.flush().unwrap();
        // TLR -> RTI (0) -> SelectDR (1) -> CaptureDR (0) -> ShiftDR (0)
        assert_eq!(mock.borrow().tms_log[6..], [false, true, false, false]);
    }

    #[test]
    fn detect_two_device_chain() {
        let (mut jtag, mock) = engine();
        {
            let mut m = mock.borrow_mut();
            m.queue_read_u32(0x0362_c093); // XC7A50T, nearest TDO
            m.queue_read_u32(0x4ba0_0477); // ARM DAP
            m.queue_read_u32(0xffff_ffff);
        }

        let n = jtag.detect_chain(5).unwrap();
        assert_eq!(n, 2);
        // Version nibble masked on lookup and storage.
        assert_eq!(jtag.devices(), &[0x0362_c093, 0x0ba0_0477]);
        assert_eq!(jtag.irlengths(), &[6, 4]);
    }

    /// Every table entry comes back as a single-device chain with its
    /// tabulated IR length when the mock replays its IDCODE.
    #[test]
    fn every_supported_idcode_detects() {
        for model in crate::config::FPGA_LIST {
            let (mut jtag, mock) = engine();
            {
                let mut m = mock.borrow_mut();
                m.queue_read_u32(model.idcode);
                m.queue_read_u32(0x0000_0000);
            }
            let n = jtag.detect_chain(5).unwrap_or_else(|e| {
                panic!("scan failed for {} (0x{:08x}): {e:?}", model.model, model.idcode)
            });
            assert_eq!(n, 1, "{}", model.model);
            assert_eq!(jtag.devices(), &[model.idcode], "{}", model.model);
            assert_eq!(jtag.irlengths(), &[model.irlength], "{}", model.model);
        }
    }

    #[test]
    fn detect_chain_is_repeatable() {
        let (mut jtag, mock) = engine();
        for _ in 0..2 {
            let mut m = mock.borrow_mut();
            m.queue_read_u32(0x0362_c093);
            m.queue_read_u32(0x0000_0000);
        }
        jtag.detect_chain(5).unwrap();
        let first = jtag.devices().to_vec();
        jtag.detect_chain(5).unwrap();
        assert_eq!(jtag.devices(), first.as_slice());
    }

    #[test]
    fn detect_chain_fails_closed_on_unknown_idcode() {
        let (mut jtag, mock) = engine();
        mock.borrow_mut().queue_read_u32(0x0123_4567);
        match jtag.detect_chain(5) {
            Err(Error::UnsupportedDevice { idcode }) => assert_eq!(idcode, 0x0123_4567),
            other => panic!("expected UnsupportedDevice, got {other:?}"),
        }
    }

    #[test]
    fn gatemate_idcode_keeps_version_nibble() {
        let (mut jtag, mock) = engine();
        {
            let mut m = mock.borrow_mut();
            m.queue_read_u32(0x2000_0001);
            m.queue_read_u32(0x0000_0000);
        }
        jtag.detect_chain(5).unwrap();
        assert_eq!(jtag.devices(), &[0x2000_0001]);
        assert_eq!(jtag.irlengths(), &[6]);
    }

    /// IR padding on the wire is ones-for-TDO-side devices, payload,
    /// ones-for-TDI-side devices, with the TMS coupling on the final bit.
    #[test]
    fn ir_shift_padding_three_device_chain() {
        let (mut jtag, mock) = engine();
        // Chain (nearest TDO first): A irlen 6, B irlen 8, C irlen 10.
        jtag.insert_first(0x3, 10);
        jtag.insert_first(0x2, 8);
        jtag.insert_first(0x1, 6);
        jtag.device_select(1).unwrap();
        jtag.go_test_logic_reset().unwrap();

        // Reset the wire log so only the shift remains.
        mock.borrow_mut().clear_logs();

        jtag.shift_ir(&[0xA5], None, 8, RunTestIdle).unwrap();

        let m = mock.borrow();
        let wire = &m.tdi_bits;
        assert_eq!(wire.len(), 6 + 8 + 10);
        // 6 leading ones for A (nearer TDO).
        assert!(wire[..6].iter().all(|b| *b));
        // payload 0xA5 LSB-first
        let payload: Vec<bool> = (0..8).map(|i| (0xA5u8 >> i) & 1 != 0).collect();
        assert_eq!(&wire[6..14], payload.as_slice());
        // 10 trailing ones for C (nearer TDI), TMS raised on the very last.
        assert!(wire[14..].iter().all(|b| *b));
        assert_eq!(m.tms_on_tdi, vec![wire.len() - 1]);
    }

    /// Target index 0 of a two-device chain pads DR with a single trailing
    /// bypass bit and IR with four trailing ones.
    #[test]
    fn two_device_padding_counts() {
        let (mut jtag, mock) = engine();
        {
            let mut m = mock.borrow_mut();
            m.queue_read_u32(0x0362_c093);
            m.queue_read_u32(0x4ba0_0477);
            m.queue_read_u32(0xffff_ffff);
        }
        jtag.detect_chain(5).unwrap();
        jtag.device_select(0).unwrap();

        assert_eq!(jtag.dr_padding(), (0, 1));
        assert_eq!(jtag.ir_padding(), (0, 4));

        mock.borrow_mut().clear_logs();
        jtag.shift_dr(Some(&[0x0f]), None, 8, RunTestIdle).unwrap();
        let m = mock.borrow();
        assert_eq!(m.tdi_bits.len(), 9);
        // Trailing bypass bit is zero padding.
        assert!(!m.tdi_bits[8]);
    }

    #[test]
    fn streaming_with_trailing_bypass_is_rejected() {
        let (mut jtag, _mock) = engine();
        jtag.insert_first(0x2, 8);
        jtag.insert_first(0x1, 6);
        jtag.device_select(0).unwrap();
        let err = jtag.shift_dr(Some(&[0u8]), None, 8, ShiftDr).unwrap_err();
        assert!(matches!(err, Error::StateMachineMisuse(_)));
    }

    #[test]
    fn chunked_dr_stream_enters_shift_once() {
        let (mut jtag, mock) = engine();
        jtag.insert_first(0x1, 6);
        jtag.device_select(0).unwrap();
        jtag.go_test_logic_reset().unwrap();

        jtag.shift_dr(Some(&[0x11]), None, 8, ShiftDr).unwrap();
        jtag.shift_dr(Some(&[0x22]), None, 8, ShiftDr).unwrap();
        jtag.shift_dr(Some(&[0x33]), None, 8, RunTestIdle).unwrap();
        assert_eq!(jtag.state(), RunTestIdle);

        // Exactly one TMS coupling, on the final bit of the final chunk.
        let m = mock.borrow();
        assert_eq!(m.tms_on_tdi.len(), 1);
        assert_eq!(m.tms_on_tdi[0], m.tdi_bits.len() - 1);
    }
}
