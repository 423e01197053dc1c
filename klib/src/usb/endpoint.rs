use core::convert::TryFrom;
use crate::{make_error, status::StatusCode, Error};
use super::descriptor::EndpointDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TryFrom<u8> for EndpointType {
    type Error = Error;

    fn try_from(ty: u8) -> Result<Self, Error> {
        match ty {
            0 => Ok(Self::Control),
            1 => Ok(Self::Isochronous),
            2 => Ok(Self::Bulk),
            3 => Ok(Self::Interrupt),
            _ => Err(make_error!(StatusCode::InvalidEndpointType { ty })),
        }
    }
}

/// Endpoint address as the xHC numbers it: `number << 1 | is_in`.
///
/// The value doubles as the device context index (DCI) of the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointId {
    addr: u8,
}

impl EndpointId {
    pub const DEFAULT_CONTROL_PIPE: EndpointId = EndpointId { addr: 1 };

    pub const fn from_addr(addr: u8) -> Self {
        Self { addr }
    }

    pub const fn from_number_in(ep_num: u8) -> Self {
        Self {
            addr: (ep_num << 1) | 1,
        }
    }

    /// Endpoint 0 is bidirectional and always uses address 1.
    pub const fn from_number_out(ep_num: u8) -> Self {
        Self {
            addr: (ep_num << 1) | (ep_num == 0) as u8,
        }
    }

    pub fn address(&self) -> u8 {
        self.addr
    }

    pub fn number(&self) -> u8 {
        self.addr >> 1
    }

    pub fn is_in(&self) -> bool {
        (self.addr & 1) == 1
    }
}

impl From<&EndpointDescriptor> for EndpointId {
    fn from(desc: &EndpointDescriptor) -> Self {
        if desc.dir_in() == 1 {
            Self::from_number_in(desc.number())
        } else {
            Self::from_number_out(desc.number())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub ep_id: EndpointId,
    pub ep_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl TryFrom<&EndpointDescriptor> for EndpointConfig {
    type Error = Error;

    fn try_from(desc: &EndpointDescriptor) -> Result<Self, Error> {
        Ok(Self {
            ep_id: EndpointId::from(desc),
            ep_type: EndpointType::try_from(desc.transfer_type())?,
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
        })
    }
}
