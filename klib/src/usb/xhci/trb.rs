use core::mem::transmute;
use crate::{bit_getter, bit_setter};
use crate::usb::{endpoint::EndpointId, setupdata::SetupData};

#[repr(u8)]
pub enum TypeId {
    Normal = 1,

    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Link = 6,

    EnableSlotCommand = 9,
    AddressDeviceCommand = 11,
    ConfigureEndpointCommand = 12,

    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
}

pub mod completion_code {
    pub const SUCCESS: u8 = 1;
    pub const SHORT_PACKET: u8 = 13;
}

/// `true` for the completion codes that mean the TRB did its job.
pub fn is_success(code: u8) -> bool {
    code == completion_code::SUCCESS || code == completion_code::SHORT_PACKET
}

const TYPE_NAMES: [&str; 64] = [
    "Reserved",
    "Normal",
    "Setup Stage",
    "Data Stage",
    "Status Stage",
    "Isoch",
    "Link",
    "EventData",
    "No-Op",
    "Enable Slot Command",
    "Disable Slot Command",
    "Address Device Command",
    "Configure Endpoint Command",
    "Evaluate Context Command",
    "Reset Endpoint Command",
    "Stop Endpoint Command",
    "Set TR Dequeue Pointer Command",
    "Reset Device Command",
    "Force Event Command",
    "Negotiate Bandwidth Command",
    "Set Latency Tolerance Value Command",
    "Get Port Bandwidth Command",
    "Force Header Command",
    "No Op Command",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Transfer Event",
    "Command Completion Event",
    "Port Status Change Event",
    "Bandwidth Request Event",
    "Doorbell Event",
    "Host Controller Event",
    "Device Notification Event",
    "MFINDEX Wrap Event",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
    "Vendor Defined",
];

pub fn type_name(ty: u8) -> &'static str {
    TYPE_NAMES[(ty & 0x3F) as usize]
}

/// A typed view of a TRB, the same 16 bytes as `GenericTrb`.
pub trait Trb: Sized {
    const TYPE: u8;

    fn upcast(&self) -> &GenericTrb {
        unsafe { transmute::<&Self, &GenericTrb>(self) }
    }
}

#[repr(C, align(16))]
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct GenericTrb {
    pub data: [u32; 4],
}

impl GenericTrb {
    bit_getter!(data[2]: u32; 0xFFFFFFFF; u32, pub status);
    bit_setter!(data[2]: u32; 0xFFFFFFFF; u32, pub set_status);

    bit_getter!(data[3]: u32; 0x00000001;  u8, pub cycle_bit);
    bit_setter!(data[3]: u32; 0x00000001;  u8, pub set_cycle_bit);

    bit_getter!(data[3]: u32; 0x00000002;  u8, pub evaluate_next_trb);
    bit_setter!(data[3]: u32; 0x00000002;  u8, pub set_evaluate_next_trb);

    bit_getter!(data[3]: u32; 0x0000FC00;  u8, pub trb_type);
    bit_setter!(data[3]: u32; 0x0000FC00;  u8, pub set_trb_type);

    bit_getter!(data[3]: u32; 0xFFFF0000; u16, pub control);
    bit_setter!(data[3]: u32; 0xFFFF0000; u16, pub set_control);

    pub fn parameter(&self) -> u64 {
        (self.data[1] as u64) << 32 | self.data[0] as u64
    }

    pub fn set_parameter(&mut self, val: u64) {
        self.data[0] = val as u32;
        self.data[1] = (val >> 32) as u32;
    }

    pub fn downcast_ref<T: Trb>(&self) -> Option<&T> {
        if self.trb_type() == T::TYPE {
            Some(unsafe { transmute::<&Self, &T>(self) })
        } else {
            None
        }
    }
}

impl core::fmt::Debug for GenericTrb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let data = &self.data;
        write!(
            f,
            "{} TRB: {:08x} {:08x} {:08x} {:08x}",
            type_name(self.trb_type()),
            data[0],
            data[1],
            data[2],
            data[3]
        )
    }
}

/// Declares a typed TRB whose default value carries only its type field.
macro_rules! typed_trb {
    ($name:ident, $type_id:expr) => {
        #[repr(C, align(16))]
        #[derive(Clone, Copy)]
        pub struct $name {
            data: [u32; 4],
        }

        impl Default for $name {
            fn default() -> Self {
                let mut data = [0; 4];
                data[3] = (($type_id as u8 as u32) << 10) & 0x0000FC00;
                Self { data }
            }
        }

        impl Trb for $name {
            const TYPE: u8 = $type_id as u8;
        }
    };
}

typed_trb!(Normal, TypeId::Normal);
typed_trb!(SetupStage, TypeId::SetupStage);
typed_trb!(DataStage, TypeId::DataStage);
typed_trb!(StatusStage, TypeId::StatusStage);
typed_trb!(Link, TypeId::Link);
typed_trb!(EnableSlotCommand, TypeId::EnableSlotCommand);
typed_trb!(AddressDeviceCommand, TypeId::AddressDeviceCommand);
typed_trb!(ConfigureEndpointCommand, TypeId::ConfigureEndpointCommand);
typed_trb!(TransferEvent, TypeId::TransferEvent);
typed_trb!(CommandCompletionEvent, TypeId::CommandCompletionEvent);
typed_trb!(PortStatusChangeEvent, TypeId::PortStatusChangeEvent);

fn join(lo: u32, hi: u32) -> u64 {
    (hi as u64) << 32 | lo as u64
}

impl Normal {
    bit_getter!(data[2]: u32; 0x0001FFFF; u32, pub trb_transfer_length);
    bit_setter!(data[2]: u32; 0x0001FFFF; u32, pub set_trb_transfer_length);

    bit_getter!(data[3]: u32; 0x00000004;  u8, pub interrupt_on_short_packet);
    bit_setter!(data[3]: u32; 0x00000004;  u8, pub set_interrupt_on_short_packet);

    bit_getter!(data[3]: u32; 0x00000020;  u8, pub interrupt_on_completion);
    bit_setter!(data[3]: u32; 0x00000020;  u8, pub set_interrupt_on_completion);

    pub fn new(buf: u64, len: u32) -> Self {
        let mut trb = Self::default();
        trb.set_data_buffer(buf);
        trb.set_trb_transfer_length(len);
        trb
    }

    pub fn data_buffer(&self) -> u64 {
        join(self.data[0], self.data[1])
    }

    pub fn set_data_buffer(&mut self, addr: u64) {
        self.data[0] = addr as u32;
        self.data[1] = (addr >> 32) as u32;
    }
}

impl SetupStage {
    bit_getter!(data[2]: u32; 0x0001FFFF; u32, pub trb_transfer_length);
    bit_setter!(data[2]: u32; 0x0001FFFF; u32, pub set_trb_transfer_length);

    bit_getter!(data[3]: u32; 0x00000040;  u8, pub immediate_data);
    bit_setter!(data[3]: u32; 0x00000040;  u8, pub set_immediate_data);

    bit_getter!(data[3]: u32; 0x00030000;  u8, pub transfer_type);
    bit_setter!(data[3]: u32; 0x00030000;  u8, pub set_transfer_type);

    fn new(setup_data: SetupData, transfer_type: u8) -> Self {
        let mut setup = Self::default();
        let [lo, hi] = setup_data.to_dwords();
        setup.data[0] = lo;
        setup.data[1] = hi;
        setup.set_immediate_data(1);
        setup.set_trb_transfer_length(8);
        setup.set_transfer_type(transfer_type);
        setup
    }

    pub fn new_no_data_stage(setup_data: SetupData) -> Self {
        Self::new(setup_data, 0)
    }

    pub fn new_out_data_stage(setup_data: SetupData) -> Self {
        Self::new(setup_data, 2)
    }

    pub fn new_in_data_stage(setup_data: SetupData) -> Self {
        Self::new(setup_data, 3)
    }

    pub fn setup_data(&self) -> SetupData {
        SetupData {
            request_type: self.data[0] as u8,
            request: (self.data[0] >> 8) as u8,
            value: (self.data[0] >> 16) as u16,
            index: self.data[1] as u16,
            length: (self.data[1] >> 16) as u16,
        }
    }
}

impl DataStage {
    bit_getter!(data[2]: u32; 0x0001FFFF; u32, pub trb_transfer_length);
    bit_setter!(data[2]: u32; 0x0001FFFF; u32, pub set_trb_transfer_length);

    bit_getter!(data[3]: u32; 0x00000020;  u8, pub interrupt_on_completion);
    bit_setter!(data[3]: u32; 0x00000020;  u8, pub set_interrupt_on_completion);

    bit_getter!(data[3]: u32; 0x00010000;  u8, pub direction);
    bit_setter!(data[3]: u32; 0x00010000;  u8, pub set_direction);

    fn new(buf: u64, len: u32, dir_in: bool) -> Self {
        let mut trb = Self::default();
        trb.set_data_buffer(buf);
        trb.set_trb_transfer_length(len);
        trb.set_direction(dir_in as u8);
        trb
    }

    pub fn new_out(buf: u64, len: u32) -> Self {
        Self::new(buf, len, false)
    }

    pub fn new_in(buf: u64, len: u32) -> Self {
        Self::new(buf, len, true)
    }

    pub fn data_buffer(&self) -> u64 {
        join(self.data[0], self.data[1])
    }

    pub fn set_data_buffer(&mut self, addr: u64) {
        self.data[0] = addr as u32;
        self.data[1] = (addr >> 32) as u32;
    }
}

impl StatusStage {
    bit_getter!(data[3]: u32; 0x00000020; u8, pub interrupt_on_completion);
    bit_setter!(data[3]: u32; 0x00000020; u8, pub set_interrupt_on_completion);

    bit_getter!(data[3]: u32; 0x00010000; u8, pub direction);
    bit_setter!(data[3]: u32; 0x00010000; u8, pub set_direction);
}

impl Link {
    bit_getter!(data[3]: u32; 0x00000002; u8, pub toggle_cycle);
    bit_setter!(data[3]: u32; 0x00000002; u8, pub set_toggle_cycle);

    pub fn new(next_ring_segment: u64) -> Self {
        let mut trb = Self::default();
        trb.set_ring_segment_pointer(next_ring_segment);
        trb
    }

    pub fn ring_segment_pointer(&self) -> u64 {
        join(self.data[0] & 0xFFFF_FFF0, self.data[1])
    }

    pub fn set_ring_segment_pointer(&mut self, addr: u64) {
        self.data[0] = addr as u32 & 0xFFFF_FFF0;
        self.data[1] = (addr >> 32) as u32;
    }
}

macro_rules! input_context_command {
    ($name:ident) => {
        impl $name {
            bit_getter!(data[3]: u32; 0xFF000000; u8, pub slot_id);
            bit_setter!(data[3]: u32; 0xFF000000; u8, pub set_slot_id);

            pub fn new(input_ctx: u64, slot_id: u8) -> Self {
                let mut trb = Self::default();
                trb.set_input_context_ptr(input_ctx);
                trb.set_slot_id(slot_id);
                trb
            }

            pub fn input_context_ptr(&self) -> u64 {
                join(self.data[0] & 0xFFFF_FFF0, self.data[1])
            }

            pub fn set_input_context_ptr(&mut self, addr: u64) {
                self.data[0] = addr as u32 & 0xFFFF_FFF0;
                self.data[1] = (addr >> 32) as u32;
            }
        }
    };
}

input_context_command!(AddressDeviceCommand);
input_context_command!(ConfigureEndpointCommand);

impl TransferEvent {
    bit_getter!(data[2]: u32; 0x00FFFFFF; u32, pub trb_transfer_length);
    bit_getter!(data[2]: u32; 0xFF000000;  u8, pub completion_code);

    bit_getter!(data[3]: u32; 0x001F0000;  u8, endpoint_id_u8);
    bit_getter!(data[3]: u32; 0xFF000000;  u8, pub slot_id);

    /// Address of the TRB that generated this event.
    pub fn trb_pointer(&self) -> u64 {
        join(self.data[0], self.data[1])
    }

    pub fn endpoint_id(&self) -> EndpointId {
        EndpointId::from_addr(self.endpoint_id_u8())
    }
}

impl CommandCompletionEvent {
    bit_getter!(data[2]: u32; 0xFF000000;  u8, pub completion_code);
    bit_getter!(data[3]: u32; 0xFF000000;  u8, pub slot_id);

    pub fn command_trb_pointer(&self) -> u64 {
        join(self.data[0] & 0xFFFF_FFF0, self.data[1])
    }
}

impl PortStatusChangeEvent {
    bit_getter!(data[0]: u32; 0xFF000000; u8, pub port_id);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds the event a controller would post for a finished transfer.
    pub(crate) fn transfer_event(trb_addr: u64, slot_id: u8, dci: u8, code: u8, residual: u32) -> GenericTrb {
        let mut trb = GenericTrb::default();
        trb.set_parameter(trb_addr);
        trb.set_status((code as u32) << 24 | residual);
        trb.set_trb_type(TransferEvent::TYPE);
        trb.data[3] |= (dci as u32) << 16 | (slot_id as u32) << 24;
        trb
    }

    pub(crate) fn command_completion(cmd_addr: u64, slot_id: u8, code: u8) -> GenericTrb {
        let mut trb = GenericTrb::default();
        trb.set_parameter(cmd_addr);
        trb.set_status((code as u32) << 24);
        trb.set_trb_type(CommandCompletionEvent::TYPE);
        trb.data[3] |= (slot_id as u32) << 24;
        trb
    }

    pub(crate) fn port_status_change(port_id: u8) -> GenericTrb {
        let mut trb = GenericTrb::default();
        trb.data[0] = (port_id as u32) << 24;
        trb.set_trb_type(PortStatusChangeEvent::TYPE);
        trb
    }

    #[test]
    fn type_names_cover_all_codes() {
        assert_eq!(type_name(0), "Reserved");
        assert_eq!(type_name(6), "Link");
        assert_eq!(type_name(33), "Command Completion Event");
        assert_eq!(type_name(63), "Vendor Defined");
    }

    #[test]
    fn downcast_checks_the_type_field() {
        let trb = transfer_event(0x1234_5670, 2, 3, completion_code::SUCCESS, 5);
        assert!(trb.downcast_ref::<CommandCompletionEvent>().is_none());
        let ev = trb.downcast_ref::<TransferEvent>().unwrap();
        assert_eq!(ev.trb_pointer(), 0x1234_5670);
        assert_eq!(ev.slot_id(), 2);
        assert_eq!(ev.endpoint_id(), EndpointId::from_number_in(1));
        assert_eq!(ev.trb_transfer_length(), 5);
        assert!(is_success(ev.completion_code()));
    }

    #[test]
    fn setup_stage_carries_packet_as_immediate_data() {
        let setup = SetupData::get_descriptor(1, 0, 18);
        let trb = SetupStage::new_in_data_stage(setup);
        assert_eq!(trb.upcast().trb_type(), TypeId::SetupStage as u8);
        assert_eq!(trb.immediate_data(), 1);
        assert_eq!(trb.trb_transfer_length(), 8);
        assert_eq!(trb.transfer_type(), 3);
        assert_eq!(trb.setup_data(), setup);
    }
}
