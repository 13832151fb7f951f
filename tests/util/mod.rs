#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::{Error, ErrorKind, Result},
    sync::{Condvar, Mutex, Once},
    time::{Duration, Instant},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usb_uart::{
    registry::{PRODUCT_CP2102, PRODUCT_PL2303, VENDOR_PROLIFIC, VENDOR_SILABS},
    transport::{DeviceInfo, Direction, EndpointInfo, InterfaceInfo, TransferType, Transport},
};

pub fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

/// Transfer observed by the simulated chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    ControlIn { request_type: u8, request: u8, value: u16, index: u16, len: usize },
    ControlOut { request_type: u8, request: u8, value: u16, index: u16, data: Vec<u8> },
    BulkIn { endpoint: u8, len: usize },
    BulkOut { endpoint: u8, data: Vec<u8> },
    Claim(u8),
    Release(u8),
    Close,
}

impl Transfer {
    pub fn control_out(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self::ControlOut { request_type, request, value, index, data: Vec::new() }
    }

    pub fn control_in(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self::ControlIn { request_type, request, value, index, len: 1 }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::ControlIn { .. } | Self::ControlOut { .. })
    }
}

#[derive(Default)]
struct ChipState {
    log: Vec<Transfer>,
    control_in_byte: u8,
    failing_request: Option<u8>,
    bulk_in: VecDeque<Vec<u8>>,
    bulk_out_calls: usize,
    bulk_out_zero_at: Option<usize>,
    bulk_out_limit: Option<usize>,
    interrupt: VecDeque<Vec<u8>>,
    interrupt_reads: usize,
    interrupt_errors: VecDeque<ErrorKind>,
    line_status: u8,
    notify_on_control: bool,
}

/// Simulated USB serial chip.
pub struct MockChip {
    info: DeviceInfo,
    interfaces: Vec<InterfaceInfo>,
    state: Mutex<ChipState>,
    interrupt_cond: Condvar,
}

fn ep(address: u8, transfer_type: TransferType, max_packet_size: u16) -> EndpointInfo {
    let direction = if address & 0x80 != 0 { Direction::In } else { Direction::Out };
    EndpointInfo { address, direction, transfer_type, max_packet_size }
}

pub const CP_BULK_IN: u8 = 0x81;
pub const CP_BULK_OUT: u8 = 0x01;
pub const PL_INTERRUPT_IN: u8 = 0x81;
pub const PL_BULK_OUT: u8 = 0x02;
pub const PL_BULK_IN: u8 = 0x83;

impl MockChip {
    pub fn new(info: DeviceInfo, interfaces: Vec<InterfaceInfo>) -> Self {
        Self { info, interfaces, state: Mutex::new(ChipState::default()), interrupt_cond: Condvar::new() }
    }

    /// CP2102 with one interface carrying a bulk endpoint pair.
    pub fn cp2102() -> Self {
        Self::new(
            DeviceInfo { vendor_id: VENDOR_SILABS, product_id: PRODUCT_CP2102, max_packet_size0: 64 },
            vec![InterfaceInfo {
                number: 0,
                endpoints: vec![ep(CP_BULK_IN, TransferType::Bulk, 64), ep(CP_BULK_OUT, TransferType::Bulk, 64)],
            }],
        )
    }

    /// PL2303 with interrupt and bulk endpoints.
    ///
    /// The HX variant reports a control endpoint packet size of 64.
    pub fn pl2303(hx: bool) -> Self {
        let chip = Self::new(
            DeviceInfo {
                vendor_id: VENDOR_PROLIFIC,
                product_id: PRODUCT_PL2303,
                max_packet_size0: if hx { 64 } else { 8 },
            },
            vec![InterfaceInfo {
                number: 0,
                endpoints: vec![
                    ep(PL_INTERRUPT_IN, TransferType::Interrupt, 10),
                    ep(PL_BULK_OUT, TransferType::Bulk, 64),
                    ep(PL_BULK_IN, TransferType::Bulk, 64),
                ],
            }],
        );
        chip.state.lock().unwrap().notify_on_control = true;
        chip
    }

    pub fn log(&self) -> Vec<Transfer> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn control_log(&self) -> Vec<Transfer> {
        self.log().into_iter().filter(Transfer::is_control).collect()
    }

    /// Values sent with the specified host-to-device request.
    pub fn control_values(&self, request: u8) -> Vec<u16> {
        self.log()
            .into_iter()
            .filter_map(|t| match t {
                Transfer::ControlOut { request: r, value, .. } if r == request => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn bulk_out(&self) -> Vec<Vec<u8>> {
        self.log()
            .into_iter()
            .filter_map(|t| match t {
                Transfer::BulkOut { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Byte returned by device-to-host control requests.
    pub fn set_control_in_byte(&self, byte: u8) {
        self.state.lock().unwrap().control_in_byte = byte;
    }

    /// Makes every control request with the specified code fail.
    pub fn fail_request(&self, request: u8) {
        self.state.lock().unwrap().failing_request = Some(request);
    }

    pub fn push_bulk_in(&self, data: &[u8]) {
        self.state.lock().unwrap().bulk_in.push_back(data.to_vec());
    }

    /// Makes the bulk write with the specified call index transfer zero bytes.
    pub fn zero_bulk_out_at(&self, call: usize) {
        self.state.lock().unwrap().bulk_out_zero_at = Some(call);
    }

    /// Limits the number of bytes accepted by one bulk write.
    pub fn limit_bulk_out(&self, limit: usize) {
        self.state.lock().unwrap().bulk_out_limit = Some(limit);
    }

    /// Status byte reported in interrupt packets caused by control line changes.
    pub fn set_line_status(&self, status: u8) {
        self.state.lock().unwrap().line_status = status;
    }

    /// Queues an interrupt packet carrying the specified status byte.
    pub fn push_status(&self, status: u8) {
        self.push_interrupt(&status_packet(status));
    }

    pub fn push_interrupt(&self, packet: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.interrupt.push_back(packet.to_vec());
        self.interrupt_cond.notify_all();
    }

    /// Makes the next interrupt read fail with the specified error kind.
    pub fn fail_interrupt_read(&self, kind: ErrorKind) {
        let mut state = self.state.lock().unwrap();
        state.interrupt_errors.push_back(kind);
        self.interrupt_cond.notify_all();
    }

    pub fn interrupt_reads(&self) -> usize {
        self.state.lock().unwrap().interrupt_reads
    }

    fn check_request(state: &ChipState, request: u8) -> Result<()> {
        match state.failing_request {
            Some(r) if r == request => Err(Error::new(ErrorKind::BrokenPipe, "request stalled")),
            _ => Ok(()),
        }
    }
}

/// Interrupt packet as sent by the PL2303: status byte at offset 8.
pub fn status_packet(status: u8) -> Vec<u8> {
    vec![0xa1, 0x20, 0, 0, 0, 0, 0x02, 0, status, 0]
}

/// Polls `cond` until it holds or the timeout expires.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

impl Transport for MockChip {
    fn device_info(&self) -> Result<DeviceInfo> {
        Ok(self.info)
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(self.interfaces.clone())
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        self.state.lock().unwrap().log.push(Transfer::Claim(interface));
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.state.lock().unwrap().log.push(Transfer::Release(interface));
        Ok(())
    }

    fn read_control(
        &self, request_type: u8, request: u8, value: u16, index: u16, buf: &mut [u8], _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.log.push(Transfer::ControlIn { request_type, request, value, index, len: buf.len() });
        Self::check_request(&state, request)?;
        buf.fill(state.control_in_byte);
        Ok(buf.len())
    }

    fn write_control(
        &self, request_type: u8, request: u8, value: u16, index: u16, buf: &[u8], _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.log.push(Transfer::ControlOut { request_type, request, value, index, data: buf.to_vec() });
        Self::check_request(&state, request)?;

        // PL2303 SET_CONTROL: the chip reports the line change on its interrupt endpoint.
        if state.notify_on_control && request_type == 0x21 && request == 0x22 {
            let packet = status_packet(state.line_status);
            state.interrupt.push_back(packet);
            self.interrupt_cond.notify_all();
        }

        Ok(buf.len())
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let data = {
            let mut state = self.state.lock().unwrap();
            state.log.push(Transfer::BulkIn { endpoint, len: buf.len() });
            state.bulk_in.pop_front()
        };

        match data {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Err(Error::new(ErrorKind::TimedOut, "bulk read timed out"))
            }
        }
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let call = state.bulk_out_calls;
        state.bulk_out_calls += 1;

        if state.bulk_out_zero_at == Some(call) {
            state.log.push(Transfer::BulkOut { endpoint, data: Vec::new() });
            return Ok(0);
        }

        let n = state.bulk_out_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        state.log.push(Transfer::BulkOut { endpoint, data: buf[..n].to_vec() });
        Ok(n)
    }

    fn read_interrupt(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.interrupt_reads += 1;

        let (mut state, _) = self
            .interrupt_cond
            .wait_timeout_while(state, timeout, |state| state.interrupt.is_empty() && state.interrupt_errors.is_empty())
            .unwrap();
        if let Some(kind) = state.interrupt_errors.pop_front() {
            return Err(Error::new(kind, "interrupt read failed"));
        }
        match state.interrupt.pop_front() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(Error::new(ErrorKind::TimedOut, "interrupt read timed out")),
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().log.push(Transfer::Close);
    }
}
