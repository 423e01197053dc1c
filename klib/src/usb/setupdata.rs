use crate::{bit_getter, bit_setter};

pub mod request_type {
    #![allow(dead_code)]

    pub const RECIPIENT_DEVICE: u8 = 0;
    pub const RECIPIENT_INTERFACE: u8 = 1;
    pub const RECIPIENT_ENDPOINT: u8 = 2;
    pub const RECIPIENT_OTHER: u8 = 3;

    pub const TYPE_STANDARD: u8 = 0;
    pub const TYPE_CLASS: u8 = 1;
    pub const TYPE_VENDOR: u8 = 2;

    pub const HOST_TO_DEVICE: u8 = 0;
    pub const DEVICE_TO_HOST: u8 = 1;
}

pub mod request {
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_CONFIGURATION: u8 = 9;
    /// HID class request.
    pub const SET_PROTOCOL: u8 = 11;
}

/// The 8-byte setup packet of a control transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SetupData {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupData {
    bit_getter!(request_type: u8; 0b00011111; u8, pub recipient);
    bit_setter!(request_type: u8; 0b00011111; u8, pub set_recipient);

    bit_getter!(request_type: u8; 0b01100000; u8, pub typ);
    bit_setter!(request_type: u8; 0b01100000; u8, pub set_typ);

    bit_getter!(request_type: u8; 0b10000000; u8, pub direction);
    bit_setter!(request_type: u8; 0b10000000; u8, pub set_direction);

    pub fn is_device_to_host(&self) -> bool {
        self.direction() == request_type::DEVICE_TO_HOST
    }

    /// `desc_type` goes in the high byte of wValue, `index` in the low byte.
    pub fn get_descriptor(desc_type: u8, index: u8, length: u16) -> Self {
        let mut setup = Self {
            request: request::GET_DESCRIPTOR,
            value: (desc_type as u16) << 8 | index as u16,
            index: 0,
            length,
            ..Default::default()
        };
        setup.set_direction(request_type::DEVICE_TO_HOST);
        setup.set_typ(request_type::TYPE_STANDARD);
        setup.set_recipient(request_type::RECIPIENT_DEVICE);
        setup
    }

    pub fn set_configuration(config_value: u8) -> Self {
        let mut setup = Self {
            request: request::SET_CONFIGURATION,
            value: config_value as u16,
            ..Default::default()
        };
        setup.set_direction(request_type::HOST_TO_DEVICE);
        setup.set_typ(request_type::TYPE_STANDARD);
        setup.set_recipient(request_type::RECIPIENT_DEVICE);
        setup
    }

    /// Protocol 0 selects the boot protocol.
    pub fn set_protocol(interface: u16, protocol: u16) -> Self {
        let mut setup = Self {
            request: request::SET_PROTOCOL,
            value: protocol,
            index: interface,
            ..Default::default()
        };
        setup.set_direction(request_type::HOST_TO_DEVICE);
        setup.set_typ(request_type::TYPE_CLASS);
        setup.set_recipient(request_type::RECIPIENT_INTERFACE);
        setup
    }

    /// The packet as the immediate data of a Setup Stage TRB.
    pub fn to_dwords(&self) -> [u32; 2] {
        [
            self.request_type as u32 | (self.request as u32) << 8 | (self.value as u32) << 16,
            self.index as u32 | (self.length as u32) << 16,
        ]
    }
}
