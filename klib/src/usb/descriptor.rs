use core::mem::size_of;
use crate::bit_getter;

pub mod desc_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const HID: u8 = 33;
}

/// A USB descriptor laid out exactly as it appears on the wire.
///
/// # Safety
/// Implementors must be `repr(C, packed)` and valid for any bit pattern.
pub unsafe trait Descriptor {
    const TYPE: u8;
}

/// Reinterprets the head of `bytes` as `D` when its bLength and bDescriptorType agree.
pub fn from_bytes<D: Descriptor>(bytes: &[u8]) -> Option<&D> {
    let size = size_of::<D>();
    if bytes.len() >= size && bytes[0] as usize >= size && bytes[1] == D::TYPE {
        Some(unsafe { &*(bytes.as_ptr() as *const D) })
    } else {
        None
    }
}

/// Walks the descriptors packed in a configuration descriptor buffer.
///
/// Stops at the first descriptor whose length is malformed.
pub struct DescIter<'buf> {
    buf: &'buf [u8],
}

impl<'buf> DescIter<'buf> {
    pub fn new(conf_desc: &'buf [u8]) -> Self {
        Self { buf: conf_desc }
    }
}

impl<'buf> Iterator for DescIter<'buf> {
    type Item = &'buf [u8];

    fn next(&mut self) -> Option<&'buf [u8]> {
        let len = *self.buf.first()? as usize;
        if len < 2 || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let (desc, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(desc)
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_release: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

unsafe impl Descriptor for DeviceDescriptor {
    const TYPE: u8 = desc_type::DEVICE;
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_id: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl Descriptor for ConfigurationDescriptor {
    const TYPE: u8 = desc_type::CONFIGURATION;
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub interface_id: u8,
}

unsafe impl Descriptor for InterfaceDescriptor {
    const TYPE: u8 = desc_type::INTERFACE;
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    bit_getter!(endpoint_address: u8; 0b00001111; u8, pub number);
    bit_getter!(endpoint_address: u8; 0b10000000; u8, pub dir_in);
    bit_getter!(attributes: u8; 0b00000011; u8, pub transfer_type);
    bit_getter!(attributes: u8; 0b00001100; u8, pub sync_type);
    bit_getter!(attributes: u8; 0b00110000; u8, pub usage_type);
}

unsafe impl Descriptor for EndpointDescriptor {
    const TYPE: u8 = desc_type::ENDPOINT;
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct HidDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub hid_release: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
}

unsafe impl Descriptor for HidDescriptor {
    const TYPE: u8 = desc_type::HID;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Configuration descriptor of a boot mouse with one interrupt IN endpoint (0x81).
    pub(crate) const MOUSE_CONFIG: [u8; 34] = [
        9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
        9, 4, 0, 0, 1, 3, 1, 2, 0, // interface: HID boot mouse
        9, 33, 0x11, 0x01, 0, 1, 34, 52, 0, // HID
        7, 5, 0x81, 3, 8, 0, 10, // endpoint 1 IN, interrupt
    ];

    #[test]
    fn iterates_and_types_config_descriptor() {
        let descs: Vec<&[u8]> = DescIter::new(&MOUSE_CONFIG).collect();
        assert_eq!(descs.len(), 4);

        let conf = from_bytes::<ConfigurationDescriptor>(descs[0]).unwrap();
        assert_eq!({ conf.total_length }, 34);
        assert!(from_bytes::<InterfaceDescriptor>(descs[0]).is_none());

        let interface = from_bytes::<InterfaceDescriptor>(descs[1]).unwrap();
        assert_eq!(
            (interface.interface_class, interface.interface_sub_class, interface.interface_protocol),
            (3, 1, 2)
        );

        let hid = from_bytes::<HidDescriptor>(descs[2]).unwrap();
        assert_eq!({ hid.hid_release }, 0x0111);

        let ep = from_bytes::<EndpointDescriptor>(descs[3]).unwrap();
        assert_eq!((ep.number(), ep.dir_in(), ep.transfer_type()), (1, 1, 3));
    }

    #[test]
    fn malformed_lengths_end_the_walk() {
        let buf = [9, 2, 34, 0, 1, 1, 0, 0xA0, 50, 0, 4, 0];
        assert_eq!(DescIter::new(&buf).count(), 1);

        let truncated = [9, 2, 34, 0, 1, 1, 0, 0xA0, 50, 9, 4, 0];
        assert_eq!(DescIter::new(&truncated).count(), 1);
    }
}
