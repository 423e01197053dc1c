pub mod hid;
pub mod mouse;

pub use hid::{HidBaseDriver, HidPhase, HidReportHandler};
pub use mouse::{set_default_observer, HidMouse, HidMouseDriver, MouseObserver};

use log::{debug, info};
use crate::{
    make_error,
    status::{Result, StatusCode},
    usb::{
        descriptor::InterfaceDescriptor,
        endpoint::{EndpointConfig, EndpointId},
        setupdata::SetupData,
    },
};

/// What a class driver wants the device to issue next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRequest {
    NoOp,
    /// Read `setup.length` bytes into the device buffer over the default control pipe.
    ControlIn(SetupData),
    ControlOut(SetupData),
    InterruptIn {
        ep_id: EndpointId,
        buf_addr: u64,
        len: usize,
    },
}

/// Completion callbacks get the outcome of the transfer: the data stage (or
/// the transferred size) on success, `TransferFailed` otherwise.
pub trait ClassDriver {
    fn set_endpoint(&mut self, config: &EndpointConfig) -> Result<()>;
    fn on_endpoints_configured(&mut self) -> Result<TransferRequest>;
    fn on_control_completed(
        &mut self,
        ep_id: EndpointId,
        setup_data: SetupData,
        outcome: Result<Option<&[u8]>>,
    ) -> Result<TransferRequest>;
    fn on_interrupt_completed(
        &mut self,
        ep_id: EndpointId,
        buf_addr: u64,
        outcome: Result<usize>,
    ) -> Result<TransferRequest>;
}

/// Every class driver this stack knows how to bind.
pub enum DriverKind {
    HidMouse(HidMouseDriver),
}

impl ClassDriver for DriverKind {
    fn set_endpoint(&mut self, config: &EndpointConfig) -> Result<()> {
        match self {
            Self::HidMouse(d) => d.set_endpoint(config),
        }
    }

    fn on_endpoints_configured(&mut self) -> Result<TransferRequest> {
        match self {
            Self::HidMouse(d) => d.on_endpoints_configured(),
        }
    }

    fn on_control_completed(
        &mut self,
        ep_id: EndpointId,
        setup_data: SetupData,
        outcome: Result<Option<&[u8]>>,
    ) -> Result<TransferRequest> {
        match self {
            Self::HidMouse(d) => d.on_control_completed(ep_id, setup_data, outcome),
        }
    }

    fn on_interrupt_completed(
        &mut self,
        ep_id: EndpointId,
        buf_addr: u64,
        outcome: Result<usize>,
    ) -> Result<TransferRequest> {
        match self {
            Self::HidMouse(d) => d.on_interrupt_completed(ep_id, buf_addr, outcome),
        }
    }
}

/// Picks a driver for an interface by its (class, subclass, protocol) triple.
pub fn new_class_driver(if_desc: &InterfaceDescriptor) -> Result<DriverKind> {
    let class = if_desc.interface_class;
    let sub = if_desc.interface_sub_class;
    let proto = if_desc.interface_protocol;
    match (class, sub, proto) {
        (3, 1, 2) => {
            info!("mouse found on interface {}", if_desc.interface_number);
            Ok(DriverKind::HidMouse(HidMouseDriver::mouse(if_desc.interface_number)?))
        }
        (c, s, p) => {
            debug!("unsupported interface: ({}, {}, {})", c, s, p);
            Err(make_error!(StatusCode::UnsupportedInterface))
        }
    }
}
