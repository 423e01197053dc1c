use crate::{bit_getter, bit_setter};
use crate::usb::endpoint::EndpointId;

#[repr(C, align(32))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotContext {
    data: [u32; 8],
}

impl SlotContext {
    bit_getter!(data[0]: u32; 0x000FFFFF; u32, pub route_string);
    bit_setter!(data[0]: u32; 0x000FFFFF; u32, pub set_route_string);

    bit_getter!(data[0]: u32; 0x00F00000;  u8, pub speed);
    bit_setter!(data[0]: u32; 0x00F00000;  u8, pub set_speed);

    bit_getter!(data[0]: u32; 0xF8000000;  u8, pub context_entries);
    bit_setter!(data[0]: u32; 0xF8000000;  u8, pub set_context_entries);

    bit_getter!(data[1]: u32; 0x00FF0000;  u8, pub root_hub_port_number);
    bit_setter!(data[1]: u32; 0x00FF0000;  u8, pub set_root_hub_port_number);

    bit_getter!(data[3]: u32; 0x000000FF;  u8, pub usb_device_address);
    bit_getter!(data[3]: u32; 0xF8000000;  u8, pub slot_state);
}

#[repr(C, align(32))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointContext {
    data: [u32; 8],
}

impl EndpointContext {
    bit_getter!(data[0]: u32; 0x00000007;  u8, pub endpoint_state);

    bit_getter!(data[0]: u32; 0x00000300;  u8, pub mult);
    bit_setter!(data[0]: u32; 0x00000300;  u8, pub set_mult);

    bit_getter!(data[0]: u32; 0x00007C00;  u8, pub max_primary_streams);
    bit_setter!(data[0]: u32; 0x00007C00;  u8, pub set_max_primary_streams);

    bit_getter!(data[0]: u32; 0x00FF0000;  u8, pub interval);
    bit_setter!(data[0]: u32; 0x00FF0000;  u8, pub set_interval);

    bit_getter!(data[1]: u32; 0x00000006;  u8, pub error_count);
    bit_setter!(data[1]: u32; 0x00000006;  u8, pub set_error_count);

    bit_getter!(data[1]: u32; 0x00000038;  u8, pub endpoint_type);
    bit_setter!(data[1]: u32; 0x00000038;  u8, pub set_endpoint_type);

    bit_getter!(data[1]: u32; 0x0000FF00;  u8, pub max_burst_size);
    bit_setter!(data[1]: u32; 0x0000FF00;  u8, pub set_max_burst_size);

    bit_getter!(data[1]: u32; 0xFFFF0000; u16, pub max_packet_size);
    bit_setter!(data[1]: u32; 0xFFFF0000; u16, pub set_max_packet_size);

    bit_getter!(data[2]: u32; 0x00000001;  u8, pub dequeue_cycle_state);
    bit_setter!(data[2]: u32; 0x00000001;  u8, pub set_dequeue_cycle_state);

    bit_getter!(data[4]: u32; 0x0000FFFF; u16, pub average_trb_length);
    bit_setter!(data[4]: u32; 0x0000FFFF; u16, pub set_average_trb_length);

    pub fn transfer_ring_buffer(&self) -> u64 {
        (self.data[3] as u64) << 32 | (self.data[2] & 0xFFFF_FFF0) as u64
    }

    /// Keeps the dequeue cycle state bit.
    pub fn set_transfer_ring_buffer(&mut self, addr: u64) {
        self.data[2] = (self.data[2] & 0xF) | (addr as u32 & 0xFFFF_FFF0);
        self.data[3] = (addr >> 32) as u32;
    }
}

/// Index into a device context: 0 is the slot, 1 is endpoint 0, then
/// `2 * number + is_in`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContextIndex(u8);

impl DeviceContextIndex {
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<EndpointId> for DeviceContextIndex {
    fn from(ep_id: EndpointId) -> Self {
        Self(ep_id.address())
    }
}

/// Output device context, written by the controller.
#[repr(C, align(64))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    pub slot_context: SlotContext,
    ep_ctxs: [EndpointContext; 31],
}

impl DeviceContext {
    pub fn endpoint(&self, dci: DeviceContextIndex) -> &EndpointContext {
        &self.ep_ctxs[dci.0 as usize - 1]
    }
}

#[repr(C, align(32))]
#[derive(Debug, Default, Clone, Copy)]
pub struct InputControlContext {
    drop_context_flags: u32,
    add_context_flags: u32,
    _reserved1: [u32; 5],
    configuration_value: u8,
    interface_number: u8,
    alternate_setting: u8,
    _reserved2: u8,
}

#[repr(C, align(64))]
#[derive(Debug, Default, Clone, Copy)]
pub struct InputContext {
    pub input_control_ctx: InputControlContext,
    pub slot_ctx: SlotContext,
    ep_ctxs: [EndpointContext; 31],
}

impl InputContext {
    pub fn add_context_flags(&self) -> u32 {
        self.input_control_ctx.add_context_flags
    }

    /// Forgets which contexts the previous command added or dropped.
    pub fn clear_control(&mut self) {
        self.input_control_ctx = InputControlContext::default();
    }

    pub fn enable_slot_context(&mut self) -> &mut SlotContext {
        self.input_control_ctx.add_context_flags |= 1;
        &mut self.slot_ctx
    }

    /// Marks `dci` as added and hands back its context, zeroed.
    pub fn update_endpoint(&mut self, dci: DeviceContextIndex) -> &mut EndpointContext {
        self.input_control_ctx.add_context_flags |= 1 << dci.0;
        let ctx = &mut self.ep_ctxs[dci.0 as usize - 1];
        *ctx = EndpointContext::default();
        ctx
    }

    pub fn endpoint(&self, dci: DeviceContextIndex) -> &EndpointContext {
        &self.ep_ctxs[dci.0 as usize - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn contexts_have_hardware_sizes() {
        assert_eq!(size_of::<SlotContext>(), 32);
        assert_eq!(size_of::<DeviceContext>(), 1024);
        assert_eq!(size_of::<InputContext>(), 1088);
    }

    #[test]
    fn update_endpoint_sets_add_flag() {
        let mut input = InputContext::default();
        input.enable_slot_context().set_context_entries(3);
        let dci = DeviceContextIndex::from(EndpointId::from_number_in(1));
        let ep = input.update_endpoint(dci);
        ep.set_dequeue_cycle_state(1);
        ep.set_transfer_ring_buffer(0x1_2345_6780);
        assert_eq!(ep.transfer_ring_buffer(), 0x1_2345_6780);
        assert_eq!(ep.dequeue_cycle_state(), 1);
        assert_eq!(input.add_context_flags(), 0b1001);

        input.clear_control();
        assert_eq!(input.add_context_flags(), 0);
        assert_eq!(input.slot_ctx.context_entries(), 3);
    }
}
