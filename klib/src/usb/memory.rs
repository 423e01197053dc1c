use core::{
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    slice,
};
use log::{trace, warn};
use spin::{Mutex, Once};
use crate::{
    fixed_vec::FixedVec,
    make_error,
    status::{Result, StatusCode},
};

/// Rings and their segment tables must not cross a 64 KiB boundary.
pub const RING_BOUNDARY: usize = 64 * 1024;
/// Contexts and the DCBAA must not cross a page.
pub const PAGE_BOUNDARY: usize = 4096;

const FREE_LIST_LEN: usize = 64;

/// A region handed out by a `FixedPool`, named by its offset into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBlock {
    offset: usize,
    size: usize,
}

impl PoolBlock {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Bump allocator over a fixed arena with a small first-fit free list.
///
/// Every block is aligned to the requested alignment and, when a boundary is
/// given, lies entirely inside one boundary-sized window.
pub struct FixedPool {
    base: usize,
    len: usize,
    next: usize,
    free: FixedVec<PoolBlock, FREE_LIST_LEN>,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn place(start: usize, size: usize, align: usize, boundary: Option<usize>) -> usize {
    let addr = align_up(start, align);
    match boundary {
        Some(boundary) => {
            let window_end = (addr & !(boundary - 1)) + boundary;
            if addr + size > window_end {
                window_end
            } else {
                addr
            }
        }
        None => addr,
    }
}

impl FixedPool {
    pub fn new(region: &'static mut [u8]) -> Self {
        Self {
            base: region.as_mut_ptr() as usize,
            len: region.len(),
            next: 0,
            free: FixedVec::new(),
        }
    }

    pub fn address(&self, block: &PoolBlock) -> usize {
        self.base + block.offset
    }

    /// Bytes never handed out yet, not counting the free list.
    pub fn untouched(&self) -> usize {
        self.len - self.next
    }

    pub fn allocate(&mut self, size: usize, align: usize, boundary: Option<usize>) -> Result<PoolBlock> {
        let size = size.max(1);
        let align = align.max(1);
        let boundary_ok = boundary
            .map_or(true, |b| b.is_power_of_two() && b >= size && b >= align);
        if !align.is_power_of_two() || !boundary_ok {
            warn!(
                "usb pool: unsatisfiable request size={:#x} align={:#x} boundary={:?}",
                size, align, boundary
            );
            return Err(make_error!(StatusCode::NoEnoughMemory));
        }

        if let Some(block) = self.take_free(size, align, boundary) {
            trace!("usb pool: reused offset={:#x} size={:#x}", block.offset, size);
            return Ok(block);
        }

        let addr = place(self.base + self.next, size, align, boundary);
        if addr + size > self.base + self.len {
            return Err(make_error!(StatusCode::NoEnoughMemory));
        }
        let offset = addr - self.base;
        let gap = PoolBlock { offset: self.next, size: offset - self.next };
        self.next = offset + size;
        if gap.size > 0 {
            self.release(gap);
        }
        trace!("usb pool: allocated offset={:#x} size={:#x}", offset, size);
        Ok(PoolBlock { offset, size })
    }

    pub fn free(&mut self, block: PoolBlock) {
        trace!("usb pool: freed offset={:#x} size={:#x}", block.offset, block.size);
        self.release(block);
    }

    fn take_free(&mut self, size: usize, align: usize, boundary: Option<usize>) -> Option<PoolBlock> {
        let idx = self.free.iter().position(|block| {
            let start = self.base + block.offset;
            place(start, size, align, boundary) + size <= start + block.size
        })?;
        let block = self.free.swap_remove(idx)?;

        let start = self.base + block.offset;
        let end = start + block.size;
        let addr = place(start, size, align, boundary);
        let offset = addr - self.base;
        if addr > start {
            self.release(PoolBlock { offset: block.offset, size: addr - start });
        }
        if addr + size < end {
            self.release(PoolBlock { offset: offset + size, size: end - addr - size });
        }
        Some(PoolBlock { offset, size })
    }

    fn release(&mut self, block: PoolBlock) {
        if block.offset + block.size == self.next {
            self.next = block.offset;
        } else if self.free.push(block).is_err() {
            warn!("usb pool: free list full, leaking {:#x} bytes", block.size);
        }
    }
}

static USB_POOL: Once<Mutex<FixedPool>> = Once::new();

/// Installs the arena every DMA-visible USB structure is carved from.
/// Later calls are ignored.
pub fn initialize(region: &'static mut [u8]) {
    USB_POOL.call_once(|| Mutex::new(FixedPool::new(region)));
}

fn allocate(size: usize, align: usize, boundary: Option<usize>) -> Result<(PoolBlock, usize)> {
    let pool = USB_POOL
        .get()
        .ok_or_else(|| make_error!(StatusCode::NoEnoughMemory))?;
    let mut pool = pool.lock();
    let block = pool.allocate(size, align, boundary)?;
    Ok((block, pool.address(&block)))
}

fn free(block: PoolBlock) {
    if let Some(pool) = USB_POOL.get() {
        pool.lock().free(block);
    }
}

/// A single value living in the USB pool.
///
/// The device-visible address is only exposed through `dma_addr`, for writing
/// into registers, TRBs and contexts.
pub struct DmaBox<T> {
    ptr: NonNull<T>,
    block: PoolBlock,
}

impl<T> DmaBox<T> {
    pub fn new(value: T) -> Result<Self> {
        Self::new_ext(value, align_of::<T>(), None)
    }

    pub fn new_ext(value: T, align: usize, boundary: Option<usize>) -> Result<Self> {
        let (block, addr) = allocate(size_of::<T>(), align.max(align_of::<T>()), boundary)?;
        let ptr = NonNull::new(addr as *mut T)
            .ok_or_else(|| make_error!(StatusCode::NoEnoughMemory))?;
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, block })
    }

    pub fn dma_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }
}

impl<T> Deref for DmaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for DmaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for DmaBox<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };
        free(self.block);
    }
}

/// A fixed-length array living in the USB pool.
pub struct DmaSlice<T> {
    ptr: NonNull<T>,
    len: usize,
    block: PoolBlock,
}

impl<T> DmaSlice<T> {
    pub fn from_fn<F: FnMut(usize) -> T>(
        len: usize,
        align: usize,
        boundary: Option<usize>,
        mut f: F,
    ) -> Result<Self> {
        let (block, addr) = allocate(size_of::<T>() * len, align.max(align_of::<T>()), boundary)?;
        let ptr = NonNull::new(addr as *mut T)
            .ok_or_else(|| make_error!(StatusCode::NoEnoughMemory))?;
        for i in 0..len {
            unsafe { ptr.as_ptr().add(i).write(f(i)) };
        }
        Ok(Self { ptr, len, block })
    }

    pub fn dma_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Returns the index of the element `addr` points at, if it is inside this slice.
    pub fn index_of(&self, addr: u64) -> Option<usize> {
        let base = self.dma_addr();
        let offset = addr.checked_sub(base)? as usize;
        let elem = size_of::<T>().max(1);
        if offset % elem != 0 || offset / elem >= self.len {
            return None;
        }
        Some(offset / elem)
    }
}

impl<T> Deref for DmaSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for DmaSlice<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for DmaSlice<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)) };
        free(self.block);
    }
}

#[cfg(test)]
pub(crate) fn init_test_pool() {
    USB_POOL.call_once(|| {
        Mutex::new(FixedPool::new(Box::leak(vec![0u8; 32 << 20].into_boxed_slice())))
    });
}
