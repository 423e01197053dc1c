use core::ptr::write_volatile;
use klib::queue::CriticalSection;
use spin::Mutex;
use x86_64::instructions::interrupts;
pub use x86_64::structures::idt::InterruptDescriptorTable;

pub static IDT: Mutex<InterruptDescriptorTable> = Mutex::new(InterruptDescriptorTable::new());

#[repr(usize)]
pub enum InterruptVector {
    Xhci = 0x40,
}

/// # Safety
/// Must only be called at the end of an interrupt handler.
pub unsafe fn notify_end_of_interrupt() {
    let end_of_interrupt: *mut u32 = 0xfee000b0 as *mut u32;
    write_volatile(end_of_interrupt, 0);
}

/// Masks interrupts on this core for the duration of the section.
pub struct InterruptMask;

impl CriticalSection for InterruptMask {
    fn with<R>(f: impl FnOnce() -> R) -> R {
        interrupts::without_interrupts(f)
    }
}
