#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

mod boot;
pub mod debugcon;
pub mod interrupt;
pub mod log;
pub mod mouse;
pub mod pci;

use boot::BootInfo;
use core::{panic::PanicInfo, ptr::addr_of_mut};
use interrupt::*;
use klib::{
    queue::InterruptQueue,
    usb::{
        classdriver,
        memory,
        xhci::{Controller, XhciConfig},
    },
};
use ::log::{debug, error, info, trace};
use pci::*;
use x86_64::{instructions::interrupts, structures::idt::InterruptStackFrame};

const USB_POOL_SIZE: usize = 4 << 20;

#[repr(C, align(4096))]
struct UsbArena([u8; USB_POOL_SIZE]);

static mut USB_ARENA: UsbArena = UsbArena([0; USB_POOL_SIZE]);

#[derive(Clone, Copy, Debug)]
enum Message {
    InterruptXHCI,
}

static MESSAGES: InterruptQueue<Message, 32, InterruptMask> = InterruptQueue::new();

extern "x86-interrupt" fn handler_xhci(_: InterruptStackFrame) {
    // a full queue already holds a pending xHCI message
    let _ = MESSAGES.push(Message::InterruptXHCI);
    unsafe { notify_end_of_interrupt() };
}

fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

fn find_pci_devices() -> Option<PciDevices> {
    let pci_devices = match scan_all_bus() {
        Ok(v) => v,
        Err(e) => {
            error!("Scanning Bus: {}", e);
            return None;
        }
    };
    for dev in pci_devices.iter() {
        trace!(
            "{}.{}.{}: vend {:04x}, class {}, head {:02x}",
            dev.bus,
            dev.device,
            dev.function,
            dev.vendor_id(),
            dev.class_code,
            dev.header_type
        );
    }
    Some(pci_devices)
}

fn start_xhc(xhc_dev: &pci::Device) -> klib::Result<Controller> {
    let bsp_local_apic_id: u8 = unsafe { (*(0xFEE00020 as *const u32) >> 24) as u8 };
    debug!("bsp id: {}", bsp_local_apic_id);
    configure_msi_fixed_destination(
        xhc_dev,
        bsp_local_apic_id,
        MSITriggerMode::Level,
        MSIDeliveryMode::Fixed,
        InterruptVector::Xhci as u8,
        0,
    )?;

    let xhc_bar = read_bar(xhc_dev, 0)?;
    let xhc_mmio_base = (xhc_bar & !0xf) as usize;
    let mut xhc = unsafe { Controller::initialize(xhc_mmio_base, &XhciConfig::default())? };
    debug!("xHC initialized");
    xhc.run()?;
    xhc.configure_ports();
    info!("ports configured");
    Ok(xhc)
}

#[no_mangle]
extern "sysv64" fn kernel_main(boot_info: *const BootInfo) -> ! {
    log::initialize();
    let boot_info = unsafe { *boot_info };
    mouse::MOUSE_CURSOR
        .lock()
        .set_screen(boot_info.frame_buffer.resolution);

    memory::initialize(unsafe { &mut (*addr_of_mut!(USB_ARENA)).0 });
    classdriver::set_default_observer(mouse::on_mouse_report);

    let Some(pci_devices) = find_pci_devices() else {
        halt();
    };
    let Some(xhc_dev) = find_xhc(&pci_devices) else {
        error!("no xHC device");
        halt();
    };
    info!(
        "xHC has been found: {}.{}.{}",
        xhc_dev.bus, xhc_dev.device, xhc_dev.function
    );

    //set the IDT entry
    IDT.lock()[InterruptVector::Xhci as usize].set_handler_fn(handler_xhci);
    unsafe { IDT.lock().load_unsafe() };

    let mut xhc = match start_xhc(&xhc_dev) {
        Ok(xhc) => xhc,
        Err(e) => {
            error!("failed to start xHC: {}", e);
            halt();
        }
    };

    loop {
        interrupts::disable();
        if MESSAGES.is_empty() {
            //sti and hlt must be in a row
            interrupts::enable_and_hlt();
            continue;
        }
        interrupts::enable();

        match MESSAGES.pop() {
            Some(Message::InterruptXHCI) => {
                while xhc.has_pending_event() {
                    if let Err(e) = xhc.process_event() {
                        error!("Error occurs during processing event: {}", e);
                    }
                }
            }
            None => {}
        }
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    error!("{}", info);
    halt()
}
