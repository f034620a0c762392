//! A replay transport for driving the engine and drivers in tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::JtagTransport;
use crate::error::Result;
use crate::util::{bit_get, bit_set};

/// One recorded `write_tdi` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdiOp {
    /// Bits clocked.
    pub bits: usize,
    /// Transmitted bytes, if any (LSB-first).
    pub tx: Option<Vec<u8>>,
    /// Whether TDO capture was requested.
    pub captured: bool,
    /// Whether the final bit carried TMS=1.
    pub end_is_tms: bool,
}

/// Observable state of a [`MockTransport`], shared with the test through a
/// [`MockHandle`].
#[derive(Debug, Default)]
pub struct MockState {
    /// Bytes handed back for capture requests.
    pub rx_queue: VecDeque<u8>,
    /// Every TMS bit written, flattened in wire order.
    pub tms_log: Vec<bool>,
    /// Every `write_tdi` call in order.
    pub tdi_log: Vec<TdiOp>,
    /// Flattened TDI wire bits including the `end_is_tms` final bits.
    pub tdi_bits: Vec<bool>,
    /// Wire position (index into `tdi_bits`) of each TMS=1 coupling.
    pub tms_on_tdi: Vec<usize>,
    /// `toggle_clk` calls as `(tms, tdi, cycles)`.
    pub clk_log: Vec<(bool, bool, u32)>,
    /// Number of `flush` calls observed.
    pub flushes: usize,
    /// Configured clock, Hz.
    pub clock_hz: u32,
}

impl MockState {
    /// Queues bytes to be returned by subsequent captures.
    pub fn queue_read(&mut self, bytes: &[u8]) {
        self.rx_queue.extend(bytes.iter().copied());
    }

    /// Queues a 32-bit word LSB-byte-first, as a DR capture returns it.
    pub fn queue_read_u32(&mut self, word: u32) {
        self.queue_read(&word.to_le_bytes());
    }

    /// Drops accumulated wire logs, keeping the read queue.
    pub fn clear_logs(&mut self) {
        self.tms_log.clear();
        self.tdi_log.clear();
        self.tdi_bits.clear();
        self.tms_on_tdi.clear();
        self.clk_log.clear();
    }

    /// Bytes transmitted across all `write_tdi` calls, in wire bit order.
    pub fn tdi_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.tdi_bits.len().div_ceil(8)];
        for (i, bit) in self.tdi_bits.iter().enumerate() {
            bit_set(&mut out, i, *bit);
        }
        out
    }
}

/// Shared view into a mock's state.
pub type MockHandle = Rc<RefCell<MockState>>;

/// A probe that records every operation and answers reads from a canned
/// byte queue. When the queue runs dry, zeros are returned.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: MockHandle,
}

impl MockTransport {
    /// An empty mock with nothing queued.
    pub fn new() -> Self {
        let transport = Self::default();
        transport.state.borrow_mut().clock_hz = 6_000_000;
        transport
    }

    /// A handle for inspecting (and seeding) the mock after the engine has
    /// taken ownership of the transport.
    pub fn handle(&self) -> MockHandle {
        Rc::clone(&self.state)
    }
}

impl JtagTransport for MockTransport {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        self.state.borrow_mut().clock_hz = hz;
        Ok(hz)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for i in 0..bits {
            state.tms_log.push(bit_get(tms, i));
        }
        Ok(())
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for i in 0..bits {
            let bit = tx.map(|t| bit_get(t, i)).unwrap_or(true);
            state.tdi_bits.push(bit);
        }
        if end_is_tms {
            let pos = state.tdi_bits.len() - 1;
            state.tms_on_tdi.push(pos);
        }

        let captured = rx.is_some();
        if let Some(rx) = rx {
            let byte_len = bits.div_ceil(8);
            for byte in rx.iter_mut().take(byte_len) {
                *byte = state.rx_queue.pop_front().unwrap_or(0);
            }
            let tail = bits & 7;
            if tail != 0 {
                rx[byte_len - 1] &= (1 << tail) - 1;
            }
        }

        state.tdi_log.push(TdiOp {
            bits,
            tx: tx.map(|t| t[..bits.div_ceil(8)].to_vec()),
            captured,
            end_is_tms,
        });
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        self.state.borrow_mut().clk_log.push((tms, tdi, cycles));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.state.borrow_mut().flushes += 1;
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        4096
    }

    fn write_tms_tdi(
        &mut self,
        tms: &[u8],
        tdi: &[u8],
        tdo: &mut [u8],
        bits: usize,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let mut current: Option<u8> = None;
        for i in 0..bits {
            let tms_bit = bit_get(tms, i);
            let tdi_bit = bit_get(tdi, i);
            state.tms_log.push(tms_bit);
            state.tdi_bits.push(tdi_bit);
            if i & 7 == 0 {
                current = state.rx_queue.pop_front();
            }
            let bit = match current {
                Some(byte) => (byte >> (i & 7)) & 1 != 0,
                // Loop TDI back when nothing is queued.
                None => tdi_bit,
            };
            bit_set(tdo, i, bit);
        }
        Ok(())
    }
}
