use log::{trace, warn};
use crate::{
    make_error,
    status::{Result, StatusCode},
    usb::{
        endpoint::{EndpointConfig, EndpointId, EndpointType},
        memory::DmaSlice,
        setupdata::SetupData,
    },
};
use super::{ClassDriver, TransferRequest};

const BUF_SIZE: usize = 64;

/// Decodes the reports of one kind of HID device.
pub trait HidReportHandler {
    /// Bytes requested per interrupt IN transfer.
    const IN_PACKET_SIZE: usize;

    fn on_data_received(&mut self, report: &[u8], previous: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidPhase {
    Idle,
    SettingProtocol,
    Polling,
    /// A transfer failed; no further interrupt IN is queued.
    Stopped,
}

/// Boot-protocol HID driver. Selects the boot protocol, then keeps one
/// interrupt IN transfer in flight and hands every report to `H`.
pub struct HidBaseDriver<H> {
    interface_index: u8,
    ep_interrupt_in: Option<EndpointId>,
    ep_interrupt_out: Option<EndpointId>,
    phase: HidPhase,
    buf: DmaSlice<u8>,
    prev: [u8; BUF_SIZE],
    prev_len: usize,
    handler: H,
}

impl<H: HidReportHandler> HidBaseDriver<H> {
    pub fn new(interface_index: u8, handler: H) -> Result<Self> {
        Ok(Self {
            interface_index,
            ep_interrupt_in: None,
            ep_interrupt_out: None,
            phase: HidPhase::Idle,
            buf: DmaSlice::from_fn(BUF_SIZE, 64, None, |_| 0)?,
            prev: [0; BUF_SIZE],
            prev_len: 0,
            handler,
        })
    }

    pub fn phase(&self) -> HidPhase {
        self.phase
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn poll(&self) -> Result<TransferRequest> {
        let ep_id = self
            .ep_interrupt_in
            .ok_or_else(|| make_error!(StatusCode::InvalidEndpointNumber))?;
        Ok(TransferRequest::InterruptIn {
            ep_id,
            buf_addr: self.buf.dma_addr(),
            len: H::IN_PACKET_SIZE.min(BUF_SIZE),
        })
    }
}

impl<H: HidReportHandler> ClassDriver for HidBaseDriver<H> {
    fn set_endpoint(&mut self, config: &EndpointConfig) -> Result<()> {
        if config.ep_type != EndpointType::Interrupt {
            return Ok(());
        }
        let slot = if config.ep_id.is_in() {
            &mut self.ep_interrupt_in
        } else {
            &mut self.ep_interrupt_out
        };
        if slot.is_some() {
            warn!("interface {}: interrupt endpoint overwritten", self.interface_index);
        }
        *slot = Some(config.ep_id);
        Ok(())
    }

    fn on_endpoints_configured(&mut self) -> Result<TransferRequest> {
        self.phase = HidPhase::SettingProtocol;
        Ok(TransferRequest::ControlOut(SetupData::set_protocol(
            self.interface_index as u16,
            0,
        )))
    }

    fn on_control_completed(
        &mut self,
        _ep_id: EndpointId,
        setup_data: SetupData,
        outcome: Result<Option<&[u8]>>,
    ) -> Result<TransferRequest> {
        trace!("hid: control completed in {:?}", self.phase);
        if self.phase != HidPhase::SettingProtocol {
            return Err(make_error!(StatusCode::InvalidPhase));
        }
        if let Err(e) = outcome {
            warn!("interface {}: {:?} failed: {}", self.interface_index, setup_data, e);
            self.phase = HidPhase::Stopped;
            return Ok(TransferRequest::NoOp);
        }
        self.phase = HidPhase::Polling;
        self.poll()
    }

    fn on_interrupt_completed(
        &mut self,
        ep_id: EndpointId,
        buf_addr: u64,
        outcome: Result<usize>,
    ) -> Result<TransferRequest> {
        if self.phase != HidPhase::Polling {
            return Err(make_error!(StatusCode::InvalidPhase));
        }
        if !ep_id.is_in() || buf_addr != self.buf.dma_addr() {
            return Err(make_error!(StatusCode::InvalidEndpointNumber));
        }
        let transferred_size = match outcome {
            Ok(size) => size,
            Err(e) => {
                warn!("interface {}: polling stopped: {}", self.interface_index, e);
                self.phase = HidPhase::Stopped;
                return Ok(TransferRequest::NoOp);
            }
        };

        let len = transferred_size.min(BUF_SIZE);
        let mut report = [0u8; BUF_SIZE];
        for (i, byte) in report[..len].iter_mut().enumerate() {
            *byte = unsafe { (&self.buf[i] as *const u8).read_volatile() };
        }

        if let Err(e) = self
            .handler
            .on_data_received(&report[..len], &self.prev[..self.prev_len])
        {
            warn!("interface {}: report dropped: {}", self.interface_index, e);
        }
        self.prev = report;
        self.prev_len = len;

        self.poll()
    }
}
