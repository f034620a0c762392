//! USB DFU 1.1 download path.
//!
//! The state machine is `appIDLE → appDETACH → dfuIDLE → dfuDNLOAD_IDLE
//! (loop) → dfuMANIFEST_SYNC → dfuMANIFEST → {dfuMANIFEST_WAIT_RESET |
//! dfuIDLE}`; a transaction landing anywhere else fails with
//! [`Error::DfuStatus`] naming the state it happened in.

use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Error, Result};

// DFU class requests.
const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

/// `bState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum State {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnbusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}

impl State {
    fn from_u8(v: u8) -> Result<State> {
        Ok(match v {
            0 => State::AppIdle,
            1 => State::AppDetach,
            2 => State::DfuIdle,
            3 => State::DfuDnloadSync,
            4 => State::DfuDnbusy,
            5 => State::DfuDnloadIdle,
            6 => State::DfuManifestSync,
            7 => State::DfuManifest,
            8 => State::DfuManifestWaitReset,
            9 => State::DfuUploadIdle,
            10 => State::DfuError,
            other => {
                return Err(Error::Parse(format!("invalid DFU bState {other}")));
            }
        })
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::AppIdle => "appIDLE",
            State::AppDetach => "appDETACH",
            State::DfuIdle => "dfuIDLE",
            State::DfuDnloadSync => "dfuDNLOAD_SYNC",
            State::DfuDnbusy => "dfuDNBUSY",
            State::DfuDnloadIdle => "dfuDNLOAD_IDLE",
            State::DfuManifestSync => "dfuMANIFEST_SYNC",
            State::DfuManifest => "dfuMANIFEST",
            State::DfuManifestWaitReset => "dfuMANIFEST_WAIT_RESET",
            State::DfuUploadIdle => "dfuUPLOAD_IDLE",
            State::DfuError => "dfuERROR",
        })
    }
}

/// `bStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Status {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotdone = 0x09,
    ErrFirmware = 0x0a,
    ErrVendor = 0x0b,
    ErrUsbr = 0x0c,
    ErrPor = 0x0d,
    ErrUnknown = 0x0e,
    ErrStalledpkt = 0x0f,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0x00 => Status::Ok,
            0x01 => Status::ErrTarget,
            0x02 => Status::ErrFile,
            0x03 => Status::ErrWrite,
            0x04 => Status::ErrErase,
            0x05 => Status::ErrCheckErased,
            0x06 => Status::ErrProg,
            0x07 => Status::ErrVerify,
            0x08 => Status::ErrAddress,
            0x09 => Status::ErrNotdone,
            0x0a => Status::ErrFirmware,
            0x0b => Status::ErrVendor,
            0x0c => Status::ErrUsbr,
            0x0d => Status::ErrPor,
            _ => Status::ErrUnknown,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::ErrTarget => "errTARGET",
            Status::ErrFile => "errFILE",
            Status::ErrWrite => "errWRITE",
            Status::ErrErase => "errERASE",
            Status::ErrCheckErased => "errCHECK_ERASED",
            Status::ErrProg => "errPROG",
            Status::ErrVerify => "errVERIFY",
            Status::ErrAddress => "errADDRESS",
            Status::ErrNotdone => "errNOTDONE",
            Status::ErrFirmware => "errFIRMWARE",
            Status::ErrVendor => "errVENDOR",
            Status::ErrUsbr => "errUSBR",
            Status::ErrPor => "errPOR",
            Status::ErrUnknown => "errUNKNOWN",
            Status::ErrStalledpkt => "errSTALLEDPKT",
        })
    }
}

bitflags! {
    /// `bmAttributes` of the DFU functional descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        /// Download capable.
        const CAN_DNLOAD = 1 << 0;
        /// Upload capable.
        const CAN_UPLOAD = 1 << 1;
        /// Device keeps talking after manifestation.
        const MANIFESTATION_TOLERANT = 1 << 2;
        /// Device detaches itself on DFU_DETACH.
        const WILL_DETACH = 1 << 3;
    }
}

/// Parsed DFU functional descriptor (`bDescriptorType` 0x21).
#[derive(Debug, Clone, Copy)]
pub struct FunctionalDescriptor {
    /// Capability bits.
    pub attributes: Attributes,
    /// How long the device waits for a USB reset after DFU_DETACH, ms.
    pub detach_timeout_ms: u16,
    /// Maximum bytes per DFU_DNLOAD transaction.
    pub transfer_size: u16,
    /// DFU specification release.
    pub bcd_dfu: u16,
}

impl FunctionalDescriptor {
    /// Decodes the descriptor from interface extra bytes.
    pub fn parse(extra: &[u8]) -> Option<FunctionalDescriptor> {
        let mut pos = 0usize;
        while pos + 2 <= extra.len() {
            let len = extra[pos] as usize;
            if len < 2 || pos + len > extra.len() {
                return None;
            }
            if extra[pos + 1] == 0x21 && len >= 9 {
                let d = &extra[pos..pos + len];
                return Some(FunctionalDescriptor {
                    attributes: Attributes::from_bits_truncate(d[2]),
                    detach_timeout_ms: u16::from_le_bytes([d[3], d[4]]),
                    transfer_size: u16::from_le_bytes([d[5], d[6]]),
                    bcd_dfu: u16::from_le_bytes([d[7], d[8]]),
                });
            }
            pos += len;
        }
        None
    }
}

/// Result of DFU_GETSTATUS.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport {
    /// Device status.
    pub status: Status,
    /// Milliseconds the host must wait before the next request.
    pub poll_timeout_ms: u32,
    /// Device state.
    pub state: State,
}

/// The control-transfer surface the state machine runs on; implemented
/// over rusb for real devices and by a scripted fake in tests.
pub trait DfuIo {
    /// Class OUT request to the DFU interface.
    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<()>;
    /// Class IN request from the DFU interface.
    fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize>;
    /// Issues a USB bus reset; `Err` from a vanished device is acceptable
    /// after manifestation.
    fn usb_reset(&mut self) -> Result<()>;
}

/// Drives the DFU 1.1 download state machine over any [`DfuIo`].
pub struct DfuCore<IO: DfuIo> {
    io: IO,
    descriptor: FunctionalDescriptor,
}

impl<IO: DfuIo> DfuCore<IO> {
    /// Wraps an interface whose functional descriptor was already parsed.
    pub fn new(io: IO, descriptor: FunctionalDescriptor) -> Self {
        Self { io, descriptor }
    }

    /// The functional descriptor in use.
    pub fn descriptor(&self) -> &FunctionalDescriptor {
        &self.descriptor
    }

    /// DFU_GETSTATUS.
    pub fn get_status(&mut self) -> Result<StatusReport> {
        let mut buf = [0u8; 6];
        let n = self.io.control_in(DFU_GETSTATUS, 0, &mut buf)?;
        if n < 6 {
            return Err(Error::Transport {
                kind: crate::error::TransportErrorKind::ShortRead {
                    expected: 6,
                    read: n,
                },
                context: "DFU_GETSTATUS",
            });
        }
        Ok(StatusReport {
            status: Status::from_u8(buf[0]),
            poll_timeout_ms: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
            state: State::from_u8(buf[4])?,
        })
    }

    /// DFU_CLRSTATUS.
    pub fn clear_status(&mut self) -> Result<()> {
        self.io.control_out(DFU_CLRSTATUS, 0, &[])
    }

    /// DFU_DETACH.
    pub fn detach(&mut self) -> Result<()> {
        self.io
            .control_out(DFU_DETACH, self.descriptor.detach_timeout_ms, &[])
    }

    fn fail(report: StatusReport) -> Error {
        Error::DfuStatus {
            state: report.state,
            status: report.status,
        }
    }

    fn check(report: StatusReport) -> Result<StatusReport> {
        if report.status != Status::Ok {
            return Err(Self::fail(report));
        }
        Ok(report)
    }

    /// Moves the device from whatever state it is in to `dfuIDLE`.
    pub fn enter_dfu_idle(&mut self) -> Result<()> {
        let report = self.get_status()?;
        match report.state {
            State::DfuIdle => Ok(()),
            State::AppIdle => {
                self.detach()?;
                if !self.descriptor.attributes.contains(Attributes::WILL_DETACH) {
                    let _ = self.io.usb_reset();
                }
                let report = Self::check(self.get_status()?)?;
                match report.state {
                    // Devices report appDETACH until the reset settles.
                    State::AppDetach | State::DfuIdle => Ok(()),
                    _ => Err(Self::fail(report)),
                }
            }
            State::DfuError => {
                self.clear_status()?;
                let report = Self::check(self.get_status()?)?;
                if report.state == State::DfuIdle {
                    Ok(())
                } else {
                    Err(Self::fail(report))
                }
            }
            State::DfuDnloadIdle | State::DfuUploadIdle => {
                self.io.control_out(DFU_ABORT, 0, &[])?;
                Ok(())
            }
            _ => Err(Self::fail(report)),
        }
    }

    fn poll_until_settled(&mut self) -> Result<StatusReport> {
        loop {
            let report = Self::check(self.get_status()?)?;
            match report.state {
                State::DfuDnloadSync | State::DfuDnbusy | State::DfuManifestSync => {
                    if report.poll_timeout_ms > 0 {
                        std::thread::sleep(Duration::from_millis(
                            report.poll_timeout_ms.min(500) as u64,
                        ));
                    }
                }
                _ => return Ok(report),
            }
        }
    }

    /// Downloads `data` in `wTransferSize` chunks and walks the device
    /// through manifestation.
    pub fn download(&mut self, data: &[u8]) -> Result<()> {
        if !self.descriptor.attributes.contains(Attributes::CAN_DNLOAD) {
            return Err(Error::SoftFail(
                "device does not advertise download capability".into(),
            ));
        }
        self.enter_dfu_idle()?;

        let transfer_size = usize::from(self.descriptor.transfer_size.max(1));
        for (block, chunk) in data.chunks(transfer_size).enumerate() {
            self.io.control_out(DFU_DNLOAD, block as u16, chunk)?;
            let report = self.poll_until_settled()?;
            if report.state != State::DfuDnloadIdle {
                return Err(Self::fail(report));
            }
            tracing::trace!("block {block}: {} bytes accepted", chunk.len());
        }

        // Zero-length download announces the end of the image.
        let final_block = data.len().div_ceil(transfer_size) as u16;
        self.io.control_out(DFU_DNLOAD, final_block, &[])?;

        // Manifestation: poll through dfuMANIFEST until the device either
        // waits for a reset or returns to idle.
        loop {
            let report = match self.get_status() {
                Ok(report) => Self::check(report)?,
                // Manifestation may drop the device off the bus; that is a
                // successful end per DFU 1.1 when the device is not
                // manifestation tolerant.
                Err(Error::Usb(_)) => break,
                Err(e) => return Err(e),
            };
            match report.state {
                State::DfuManifestSync | State::DfuManifest => {
                    if report.poll_timeout_ms > 0 {
                        std::thread::sleep(Duration::from_millis(
                            report.poll_timeout_ms.min(500) as u64,
                        ));
                    }
                }
                State::DfuManifestWaitReset => {
                    let _ = self.io.usb_reset();
                    break;
                }
                State::DfuIdle => break,
                _ => return Err(Self::fail(report)),
            }
        }
        Ok(())
    }
}

/// A DFU interface found on a USB device.
pub struct DfuDevice {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    interface: u8,
    descriptor: FunctionalDescriptor,
}

impl DfuDevice {
    /// Scans `vid:pid` for an interface with class 0xFE / subclass 0x01
    /// and claims it, honoring `altsetting` when non-negative.
    pub fn open(vid: u16, pid: u16, altsetting: i16) -> Result<Self> {
        for device in rusb::devices()?.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() != vid || desc.product_id() != pid {
                continue;
            }
            let config = device.active_config_descriptor()?;
            for interface in config.interfaces() {
                for if_desc in interface.descriptors() {
                    if if_desc.class_code() != 0xfe || if_desc.sub_class_code() != 0x01 {
                        continue;
                    }
                    if altsetting >= 0 && if_desc.setting_number() != altsetting as u8 {
                        continue;
                    }
                    let Some(descriptor) = FunctionalDescriptor::parse(if_desc.extra())
                    else {
                        continue;
                    };
                    let mut handle = device.open()?;
                    let number = if_desc.interface_number();
                    let _ = handle.set_auto_detach_kernel_driver(true);
                    handle.claim_interface(number)?;
                    if altsetting >= 0 {
                        handle.set_alternate_setting(number, altsetting as u8)?;
                    }
                    tracing::info!(
                        "DFU interface {number}: wTransferSize {} bmAttributes {:?}",
                        descriptor.transfer_size,
                        descriptor.attributes
                    );
                    return Ok(Self {
                        handle,
                        interface: number,
                        descriptor,
                    });
                }
            }
        }
        Err(Error::SoftFail(format!(
            "no DFU interface on {vid:04x}:{pid:04x}"
        )))
    }

    /// Wraps the claimed interface in the download state machine.
    pub fn into_core(self) -> DfuCore<UsbDfuIo> {
        let descriptor = self.descriptor;
        DfuCore::new(
            UsbDfuIo {
                handle: self.handle,
                interface: self.interface,
            },
            descriptor,
        )
    }
}

/// [`DfuIo`] over a claimed rusb interface.
pub struct UsbDfuIo {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    interface: u8,
}

const CTRL_TIMEOUT: Duration = Duration::from_secs(5);

impl DfuIo for UsbDfuIo {
    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        let request_type =
            rusb::request_type(rusb::Direction::Out, rusb::RequestType::Class, rusb::Recipient::Interface);
        self.handle.write_control(
            request_type,
            request,
            value,
            self.interface as u16,
            data,
            CTRL_TIMEOUT,
        )?;
        Ok(())
    }

    fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize> {
        let request_type =
            rusb::request_type(rusb::Direction::In, rusb::RequestType::Class, rusb::Recipient::Interface);
        Ok(self.handle.read_control(
            request_type,
            request,
            value,
            self.interface as u16,
            buf,
            CTRL_TIMEOUT,
        )?)
    }

    fn usb_reset(&mut self) -> Result<()> {
        self.handle.reset()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted device model: transitions through the download state
    /// machine and can inject an error at a chosen block.
    struct FakeDfu {
        state: State,
        status: Status,
        blocks: Vec<Vec<u8>>,
        fail_at_block: Option<u16>,
        resets: usize,
        manifestation_tolerant: bool,
    }

    impl FakeDfu {
        fn new() -> Self {
            Self {
                state: State::AppIdle,
                status: Status::Ok,
                blocks: Vec::new(),
                fail_at_block: None,
                resets: 0,
                manifestation_tolerant: true,
            }
        }
    }

    impl DfuIo for FakeDfu {
        fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<()> {
            match request {
                DFU_DETACH => {
                    assert_eq!(self.state, State::AppIdle);
                    self.state = State::DfuIdle;
                }
                DFU_DNLOAD => {
                    if Some(value) == self.fail_at_block {
                        self.state = State::DfuError;
                        self.status = Status::ErrProg;
                        return Ok(());
                    }
                    if data.is_empty() {
                        self.state = if self.manifestation_tolerant {
                            State::DfuIdle
                        } else {
                            State::DfuManifestWaitReset
                        };
                    } else {
                        assert!(matches!(
                            self.state,
                            State::DfuIdle | State::DfuDnloadIdle
                        ));
                        self.blocks.push(data.to_vec());
                        self.state = State::DfuDnloadIdle;
                    }
                }
                DFU_CLRSTATUS | DFU_ABORT => {
                    self.state = State::DfuIdle;
                    self.status = Status::Ok;
                }
                _ => panic!("unexpected OUT request {request}"),
            }
            Ok(())
        }

        fn control_in(&mut self, request: u8, _value: u16, buf: &mut [u8]) -> Result<usize> {
            assert_eq!(request, DFU_GETSTATUS);
            buf[0] = self.status as u8;
            buf[1..4].copy_from_slice(&[0, 0, 0]);
            buf[4] = self.state as u8;
            buf[5] = 0;
            Ok(6)
        }

        fn usb_reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }
    }

    fn descriptor(transfer_size: u16) -> FunctionalDescriptor {
        FunctionalDescriptor {
            attributes: Attributes::CAN_DNLOAD | Attributes::WILL_DETACH,
            detach_timeout_ms: 250,
            transfer_size,
            bcd_dfu: 0x0110,
        }
    }

    #[test]
    fn functional_descriptor_parse() {
        // Preceded by an unrelated 4-byte descriptor.
        let extra = [
            0x04, 0x30, 0x00, 0x00, //
            0x09, 0x21, 0x0b, 0xfa, 0x00, 0x00, 0x04, 0x10, 0x01,
        ];
        let d = FunctionalDescriptor::parse(&extra).unwrap();
        assert_eq!(d.transfer_size, 0x0400);
        assert_eq!(d.detach_timeout_ms, 0x00fa);
        assert!(d.attributes.contains(Attributes::CAN_DNLOAD));
        assert!(d.attributes.contains(Attributes::WILL_DETACH));
        assert_eq!(d.bcd_dfu, 0x0110);
    }

    /// 128-byte payload with wTransferSize 64: two data blocks, one
    /// zero-length, ending in dfuIDLE.
    #[test]
    fn small_download_in_two_chunks() {
        let fake = FakeDfu::new();
        let mut core = DfuCore::new(fake, descriptor(64));
        let payload: Vec<u8> = (0..128u8).collect();
        core.download(&payload).unwrap();

        let fake = core.io;
        assert_eq!(fake.blocks.len(), 2);
        assert_eq!(fake.blocks[0].len(), 64);
        assert_eq!(fake.blocks[1].len(), 64);
        assert_eq!(fake.state, State::DfuIdle);
    }

    #[test]
    fn manifestation_wait_reset_triggers_bus_reset() {
        let mut fake = FakeDfu::new();
        fake.manifestation_tolerant = false;
        let mut core = DfuCore::new(fake, descriptor(64));
        core.download(&[0u8; 10]).unwrap();
        assert_eq!(core.io.resets, 1);
        assert_eq!(core.io.state, State::DfuManifestWaitReset);
    }

    #[test]
    fn injected_error_names_state_and_status() {
        let mut fake = FakeDfu::new();
        fake.fail_at_block = Some(1);
        let mut core = DfuCore::new(fake, descriptor(64));
        let err = core.download(&[0u8; 128]).unwrap_err();
        match err {
            Error::DfuStatus { state, status } => {
                assert_eq!(state, State::DfuError);
                assert_eq!(status, Status::ErrProg);
                assert_eq!(format!("{state}"), "dfuERROR");
                assert_eq!(format!("{status}"), "errPROG");
            }
            other => panic!("expected DfuStatus, got {other:?}"),
        }
    }

    #[test]
    fn dfu_error_state_is_cleared_before_download() {
        let mut fake = FakeDfu::new();
        fake.state = State::DfuError;
        fake.status = Status::Ok; // stale error state, healthy status
        let mut core = DfuCore::new(fake, descriptor(64));
        core.download(&[1, 2, 3]).unwrap();
        assert_eq!(core.io.blocks.len(), 1);
    }
}
