use log::trace;
use crate::{
    make_error,
    status::{Result, StatusCode},
    usb::memory::{DmaBox, DmaSlice, PAGE_BOUNDARY},
};
use super::{device::Device, registers::DoorbellRegister};

/// Owns every addressed device and the Device Context Base Address Array.
pub struct DeviceManager {
    devices: DmaSlice<Option<DmaBox<Device>>>,
    // NOTE: DCBAA: alignment = 64-bytes, boundary = PAGESIZE
    dcbaa: DmaSlice<u64>,
}

impl DeviceManager {
    pub fn new(max_slots: u8) -> Result<Self> {
        let len = max_slots as usize + 1;
        let devices = DmaSlice::from_fn(len, 0, None, |_| None)?;
        let dcbaa = DmaSlice::from_fn(len, 64, Some(PAGE_BOUNDARY), |_| 0)?;
        trace!("DeviceManager has been initialized for up to {} devices", max_slots);
        Ok(Self { devices, dcbaa })
    }

    pub fn max_slots(&self) -> u8 {
        (self.devices.len() - 1) as u8
    }

    pub fn dcbaa_addr(&self) -> u64 {
        self.dcbaa.dma_addr()
    }

    /// DCBAA entry 0 points at the scratchpad buffer array.
    pub fn set_scratchpad_array(&mut self, addr: u64) {
        self.write_dcbaa(0, addr);
    }

    /// # Safety
    /// `doorbell` must be the doorbell register of `slot_id`.
    pub unsafe fn alloc_device(
        &mut self,
        slot_id: u8,
        doorbell: *mut DoorbellRegister,
        transfer_ring_size: usize,
    ) -> Result<&mut Device> {
        let entry = self.check_slot(slot_id)?;
        if self.devices[entry].is_some() {
            return Err(make_error!(StatusCode::AlreadyAllocated));
        }
        let device = DmaBox::new(Device::new(slot_id, doorbell, transfer_ring_size)?)?;
        trace!("alloc_device: slot_id = {}", slot_id);
        Ok(&mut **self.devices[entry].insert(device))
    }

    /// Publishes the output device context of `slot_id` to the controller.
    pub fn load_dcbaa(&mut self, slot_id: u8) -> Result<()> {
        let entry = self.check_slot(slot_id)?;
        let addr = self.devices[entry]
            .as_ref()
            .map(|dev| dev.device_context_addr())
            .ok_or_else(|| make_error!(StatusCode::InvalidSlotId))?;
        self.write_dcbaa(entry, addr);
        Ok(())
    }

    pub fn find_by_slot(&self, slot_id: u8) -> Option<&Device> {
        self.devices
            .get(slot_id as usize)
            .and_then(|dev| dev.as_deref())
    }

    pub fn find_by_slot_mut(&mut self, slot_id: u8) -> Option<&mut Device> {
        self.devices
            .get_mut(slot_id as usize)
            .and_then(|dev| dev.as_deref_mut())
    }

    /// Forgets the device in `slot_id` and clears its DCBAA entry.
    pub fn remove(&mut self, slot_id: u8) -> Result<()> {
        let entry = self.check_slot(slot_id)?;
        self.write_dcbaa(entry, 0);
        self.devices[entry] = None;
        Ok(())
    }

    fn check_slot(&self, slot_id: u8) -> Result<usize> {
        let entry = slot_id as usize;
        if !(1 <= entry && entry < self.devices.len()) {
            return Err(make_error!(StatusCode::InvalidSlotId));
        }
        Ok(entry)
    }

    fn write_dcbaa(&mut self, entry: usize, addr: u64) {
        unsafe { (&mut self.dcbaa[entry] as *mut u64).write_volatile(addr) };
    }
}
