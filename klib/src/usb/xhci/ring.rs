use log::trace;
use crate::{
    bit_getter, bit_setter,
    make_error,
    status::{Result, StatusCode},
    usb::memory::{DmaSlice, RING_BOUNDARY},
};
use super::{
    registers::InterrupterRegisterSet,
    trb::{GenericTrb, Link, Trb},
};

/// Producer ring for commands or transfers.
///
/// The last slot is reserved for a Link TRB back to slot 0.
pub struct Ring {
    buf: DmaSlice<GenericTrb>,
    cycle_bit: bool,
    write_idx: usize,
}

impl Ring {
    pub fn with_capacity(buf_size: usize) -> Result<Self> {
        if buf_size < 2 {
            return Err(make_error!(StatusCode::IndexOutOfRange));
        }
        let buf = DmaSlice::from_fn(buf_size, 64, Some(RING_BOUNDARY), |_| GenericTrb::default())?;
        Ok(Self {
            buf,
            cycle_bit: true,
            write_idx: 0,
        })
    }

    pub fn cycle_bit(&self) -> bool {
        self.cycle_bit
    }

    pub fn write_index(&self) -> usize {
        self.write_idx
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer_addr(&self) -> u64 {
        self.buf.dma_addr()
    }

    /// Copy of the TRB stored at `addr`, if `addr` points into this ring.
    pub fn trb_at(&self, addr: u64) -> Option<GenericTrb> {
        let idx = self.buf.index_of(addr)?;
        Some(unsafe { (&self.buf[idx] as *const GenericTrb).read_volatile() })
    }

    /// Writes `trb` at the write index with the ring's cycle bit. The dword
    /// holding the cycle bit goes last so the controller never sees a half-written TRB.
    fn copy_to_last(&mut self, mut trb: GenericTrb) {
        trb.set_cycle_bit(self.cycle_bit as u8);

        let p = &mut self.buf[self.write_idx] as *mut GenericTrb as *mut u32;
        for i in 0..3 {
            unsafe { p.add(i).write_volatile(trb.data[i]) };
        }
        unsafe { p.add(3).write_volatile(trb.data[3]) };
    }

    /// Pushes `trb` and returns the address it was written to.
    pub fn push(&mut self, trb: &GenericTrb) -> u64 {
        self.copy_to_last(*trb);
        let written = self.buffer_addr() + (self.write_idx * core::mem::size_of::<GenericTrb>()) as u64;
        trace!("{:?} pushed at {:#x}", trb, written);

        self.write_idx += 1;
        if self.write_idx + 1 == self.buf.len() {
            let mut link = Link::new(self.buffer_addr());
            link.set_toggle_cycle(1);
            self.copy_to_last(*link.upcast());
            self.write_idx = 0;
            self.cycle_bit = !self.cycle_bit;
        }
        written
    }
}

pub type CommandRing = Ring;
pub type TransferRing = Ring;

#[repr(C, align(16))]
#[derive(Default, Clone, Copy)]
pub struct EventRingSegmentTableEntry {
    data: [u64; 2],
}

impl EventRingSegmentTableEntry {
    bit_getter!(data[0]: u64; 0xFFFFFFFFFFFFFFC0; u64, ring_segment_base_address);
    bit_setter!(data[0]: u64; 0xFFFFFFFFFFFFFFC0; u64, set_ring_segment_base_address);

    bit_getter!(data[1]: u64; 0x000000000000FFFF; u16, pub ring_segment_size);
    bit_setter!(data[1]: u64; 0x000000000000FFFF; u16, pub set_ring_segment_size);

    pub fn pointer(&self) -> u64 {
        self.ring_segment_base_address() << 6
    }

    pub fn set_pointer(&mut self, addr: u64) {
        self.set_ring_segment_base_address(addr >> 6);
    }
}

/// Consumer ring the controller posts events to, with a single segment.
pub struct EventRing {
    buf: DmaSlice<GenericTrb>,
    erst: DmaSlice<EventRingSegmentTableEntry>,
    cycle_bit: bool,
    read_idx: usize,
    interrupter: *mut InterrupterRegisterSet,
}

impl EventRing {
    /// Allocates the ring and registers it with `interrupter`.
    ///
    /// # Safety
    /// `interrupter` must point at a live interrupter register set for as
    /// long as the ring exists.
    pub unsafe fn new(buf_size: usize, interrupter: *mut InterrupterRegisterSet) -> Result<Self> {
        if buf_size == 0 {
            return Err(make_error!(StatusCode::IndexOutOfRange));
        }
        let buf = DmaSlice::from_fn(buf_size, 64, Some(RING_BOUNDARY), |_| GenericTrb::default())?;
        let mut erst = DmaSlice::from_fn(1, 64, Some(RING_BOUNDARY), |_| {
            EventRingSegmentTableEntry::default()
        })?;
        erst[0].set_pointer(buf.dma_addr());
        erst[0].set_ring_segment_size(buf_size as u16);

        let mut ring = Self {
            buf,
            erst,
            cycle_bit: true,
            read_idx: 0,
            interrupter,
        };

        (*interrupter).erstsz.modify(|erstsz| {
            erstsz.set_event_ring_segment_table_size(ring.erst.len() as u16);
        });
        ring.write_dequeue_pointer();
        let erst_addr = ring.erst.dma_addr();
        (*interrupter).erstba.modify(|erstba| erstba.set_pointer(erst_addr));

        Ok(ring)
    }

    pub fn cycle_bit(&self) -> bool {
        self.cycle_bit
    }

    pub fn buffer_addr(&self) -> u64 {
        self.buf.dma_addr()
    }

    fn read_front(&self) -> GenericTrb {
        unsafe { (&self.buf[self.read_idx] as *const GenericTrb).read_volatile() }
    }

    pub fn has_front(&self) -> bool {
        self.read_front().cycle_bit() == self.cycle_bit as u8
    }

    pub fn front(&self) -> Option<GenericTrb> {
        let trb = self.read_front();
        (trb.cycle_bit() == self.cycle_bit as u8).then_some(trb)
    }

    /// Hands the front slot back to the controller.
    pub fn pop(&mut self) {
        self.read_idx += 1;
        if self.read_idx == self.buf.len() {
            self.read_idx = 0;
            self.cycle_bit = !self.cycle_bit;
        }
        self.write_dequeue_pointer();
    }

    fn write_dequeue_pointer(&mut self) {
        let addr = self.buffer_addr() + (self.read_idx * core::mem::size_of::<GenericTrb>()) as u64;
        unsafe {
            (*self.interrupter).erdp.modify(|erdp| {
                erdp.set_pointer(addr);
                erdp.set_event_handler_busy(1);
            })
        };
    }
}
