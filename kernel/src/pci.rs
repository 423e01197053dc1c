use core::fmt::Display;
use klib::{bit_getter, bit_setter, fixed_vec::FixedVec, make_error, Result, StatusCode};
use log::trace;
use spin::Mutex;
use x86_64::instructions::port::{Port, PortWriteOnly};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClassCode {
    pub base: u8,
    pub sub: u8,
    pub interface: u8,
}

impl Display for ClassCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "(0x{:02x}, 0x{:02x}, 0x{:02x})",
            self.base, self.sub, self.interface
        )
    }
}

pub const XHC_CLASS: ClassCode = ClassCode {
    base: 0x0c,
    sub: 0x03,
    interface: 0x30,
};

#[derive(Copy, Clone, Debug)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub header_type: u8,
    pub class_code: ClassCode,
}

impl Device {
    pub fn vendor_id(&self) -> u16 {
        read_vendor_id(self.bus, self.device, self.function)
    }
}

static PCI_PORT: Mutex<PciIOPort> = Mutex::new(PciIOPort::new());

struct PciIOPort {
    address_port: PortWriteOnly<u32>,
    data_port: Port<u32>,
}

impl PciIOPort {
    const fn new() -> Self {
        Self {
            address_port: PortWriteOnly::new(0xcf8),
            data_port: Port::new(0xcfc),
        }
    }

    fn make_address(bus: u8, device: u8, function: u8, reg_addr: u8) -> u32 {
        1u32 << 31
            | u32::from(bus) << 16
            | u32::from(device) << 11
            | u32::from(function) << 8
            | u32::from(reg_addr & 0xfc)
    }

    fn read(&mut self, bus: u8, device: u8, function: u8, reg_addr: u8) -> u32 {
        let addr = Self::make_address(bus, device, function, reg_addr);
        unsafe {
            self.address_port.write(addr);
            self.data_port.read()
        }
    }

    fn write(&mut self, bus: u8, device: u8, function: u8, reg_addr: u8, value: u32) {
        let addr = Self::make_address(bus, device, function, reg_addr);
        unsafe {
            self.address_port.write(addr);
            self.data_port.write(value);
        }
    }
}

pub fn read_vendor_id(bus: u8, device: u8, function: u8) -> u16 {
    PCI_PORT.lock().read(bus, device, function, 0x00) as u16
}

pub fn read_header_type(bus: u8, device: u8, function: u8) -> u8 {
    (PCI_PORT.lock().read(bus, device, function, 0x0c) >> 16 & 0xff) as u8
}

pub fn read_class_code(bus: u8, device: u8, function: u8) -> ClassCode {
    let r = PCI_PORT.lock().read(bus, device, function, 0x08);
    ClassCode {
        base: ((r >> 24) & 0xff) as u8,
        sub: ((r >> 16) & 0xff) as u8,
        interface: ((r >> 8) & 0xff) as u8,
    }
}

pub fn read_bus_numbers(bus: u8, device: u8, function: u8) -> u32 {
    PCI_PORT.lock().read(bus, device, function, 0x18)
}

fn read_conf_reg(dev: &Device, reg_addr: u8) -> u32 {
    PCI_PORT.lock().read(dev.bus, dev.device, dev.function, reg_addr)
}

fn write_conf_reg(dev: &Device, reg_addr: u8, value: u32) {
    PCI_PORT
        .lock()
        .write(dev.bus, dev.device, dev.function, reg_addr, value)
}

pub fn is_singleton_function_device(header_type: u8) -> bool {
    header_type & 0x80 == 0
}

/// Functions found on every bus reachable from the host bridge.
pub struct PciDevices {
    devices: FixedVec<Device, 32>,
}

impl PciDevices {
    const fn new() -> Self {
        Self {
            devices: FixedVec::new(),
        }
    }

    fn add_device(&mut self, device: Device) -> Result<()> {
        self.devices
            .push(device)
            .map(|_| ())
            .map_err(|_| make_error!(StatusCode::Full))
    }

    fn scan_function(&mut self, bus: u8, device: u8, function: u8) -> Result<()> {
        let header_type = read_header_type(bus, device, function);
        let class_code = read_class_code(bus, device, function);
        self.add_device(Device {
            bus,
            device,
            function,
            header_type,
            class_code,
        })?;
        // PCI-PCI bridge
        if class_code.base == 0x06 && class_code.sub == 0x04 {
            let bus_numbers = read_bus_numbers(bus, device, function);
            let secondary_bus = ((bus_numbers >> 8) & 0xff) as u8;
            return self.scan_bus(secondary_bus);
        }
        Ok(())
    }

    fn scan_device(&mut self, bus: u8, device: u8) -> Result<()> {
        self.scan_function(bus, device, 0)?;
        if is_singleton_function_device(read_header_type(bus, device, 0)) {
            return Ok(());
        }
        for function in 1..8 {
            if read_vendor_id(bus, device, function) != 0xffff {
                self.scan_function(bus, device, function)?;
            }
        }
        Ok(())
    }

    fn scan_bus(&mut self, bus: u8) -> Result<()> {
        for device in 0..32 {
            if read_vendor_id(bus, device, 0) != 0xffff {
                self.scan_device(bus, device)?;
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

pub fn scan_all_bus() -> Result<PciDevices> {
    let mut pci_devices = PciDevices::new();
    if is_singleton_function_device(read_header_type(0, 0, 0)) {
        pci_devices.scan_bus(0)?;
        return Ok(pci_devices);
    }

    for function in 0..8 {
        if read_vendor_id(0, 0, function) == 0xffff {
            continue;
        }
        pci_devices.scan_bus(function)?;
    }
    Ok(pci_devices)
}

/// First xHC on the bus, preferring an Intel one.
pub fn find_xhc(pci_devices: &PciDevices) -> Option<Device> {
    let mut xhc_dev = None;
    for dev in pci_devices.iter() {
        if dev.class_code == XHC_CLASS {
            xhc_dev = Some(*dev);
            if dev.vendor_id() == 0x8086 {
                break;
            }
        }
    }
    xhc_dev
}

fn calc_bar_address(bar_index: usize) -> u8 {
    (0x10 + 4 * bar_index) as u8
}

pub fn read_bar(device: &Device, bar_index: usize) -> Result<u64> {
    if bar_index >= 6 {
        return Err(make_error!(StatusCode::IndexOutOfRange));
    }
    let addr = calc_bar_address(bar_index);
    let bar = read_conf_reg(device, addr);

    // 32-bit BAR
    if (bar & 4) == 0 {
        return Ok(bar.into());
    }

    if bar_index >= 5 {
        return Err(make_error!(StatusCode::IndexOutOfRange));
    }

    let bar_upper = read_conf_reg(device, addr + 4);
    Ok(bar as u64 | (bar_upper as u64) << 32)
}

#[repr(C)]
#[derive(Default)]
struct CapabilityHeader {
    data: u32,
}

impl CapabilityHeader {
    bit_getter!(data: u32; 0x000000FF; u8, cap_id);
    bit_getter!(data: u32; 0x0000FF00; u8, next_ptr);
}

const CAPABILITY_MSI: u8 = 0x05;
const CAPABILITY_MSIX: u8 = 0x11;

#[repr(C)]
#[derive(Default)]
struct MSICapability {
    data: u32,
    msg_addr: u32,
    msg_upper_addr: u32,
    msg_data: u32,
    mask_bits: u32,
    pending_bits: u32,
}

impl MSICapability {
    bit_getter!(data: u32; 0x01000000; u8, per_vector_mask_capable);
    bit_getter!(data: u32; 0x00800000; u8, addr_64_capable);
    bit_getter!(data: u32; 0x000E0000; u8, multi_msg_capable);
    bit_setter!(data: u32; 0x00010000; u8, set_msi_enable);
    bit_setter!(data: u32; 0x00700000; u8, set_multi_msg_enable);
}

fn read_msi_capability(dev: &Device, cap_addr: u8) -> MSICapability {
    let mut msi_cap = MSICapability {
        data: read_conf_reg(dev, cap_addr),
        msg_addr: read_conf_reg(dev, cap_addr + 4),
        ..Default::default()
    };

    let mut msg_data_addr = cap_addr + 8;
    if msi_cap.addr_64_capable() != 0 {
        msi_cap.msg_upper_addr = read_conf_reg(dev, msg_data_addr);
        msg_data_addr += 4;
    }
    msi_cap.msg_data = read_conf_reg(dev, msg_data_addr);

    if msi_cap.per_vector_mask_capable() != 0 {
        msi_cap.mask_bits = read_conf_reg(dev, msg_data_addr + 4);
        msi_cap.pending_bits = read_conf_reg(dev, msg_data_addr + 8);
    }
    msi_cap
}

fn write_msi_capability(dev: &Device, cap_addr: u8, msi_cap: &MSICapability) {
    write_conf_reg(dev, cap_addr, msi_cap.data);
    write_conf_reg(dev, cap_addr + 4, msi_cap.msg_addr);

    let mut msg_data_addr = cap_addr + 8;
    if msi_cap.addr_64_capable() != 0 {
        write_conf_reg(dev, msg_data_addr, msi_cap.msg_upper_addr);
        msg_data_addr += 4;
    }
    write_conf_reg(dev, msg_data_addr, msi_cap.msg_data);

    if msi_cap.per_vector_mask_capable() != 0 {
        write_conf_reg(dev, msg_data_addr + 4, msi_cap.mask_bits);
        write_conf_reg(dev, msg_data_addr + 8, msi_cap.pending_bits);
    }
}

fn configure_msi_register(
    dev: &Device,
    cap_addr: u8,
    msg_addr: u32,
    msg_data: u32,
    num_vector_exponent: u8,
) {
    let mut msi_cap = read_msi_capability(dev, cap_addr);
    let enabled = msi_cap.multi_msg_capable().min(num_vector_exponent);
    msi_cap.set_multi_msg_enable(enabled);
    msi_cap.set_msi_enable(1);
    msi_cap.msg_addr = msg_addr;
    msi_cap.msg_data = msg_data;
    write_msi_capability(dev, cap_addr, &msi_cap);
}

#[derive(PartialEq, Eq)]
pub enum MSITriggerMode {
    Edge = 0,
    Level = 1,
}

pub enum MSIDeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    SMI = 0b010,
    NMI = 0b100,
    INIT = 0b101,
    ExtINT = 0b111,
}

fn configure_msi(dev: &Device, msg_addr: u32, msg_data: u32, num_vector_exponent: u8) -> Result<()> {
    let mut cap_addr = (read_conf_reg(dev, 0x34) & 0xff) as u8;
    let mut msi_cap_addr = 0;
    let mut msix_cap_addr = 0;
    while cap_addr != 0 {
        let header = CapabilityHeader {
            data: read_conf_reg(dev, cap_addr),
        };
        trace!("pci capability {:#04x} at {:#04x}", header.cap_id(), cap_addr);
        match header.cap_id() {
            CAPABILITY_MSI => msi_cap_addr = cap_addr,
            CAPABILITY_MSIX => msix_cap_addr = cap_addr,
            _ => {}
        }
        cap_addr = header.next_ptr();
    }

    if msi_cap_addr != 0 {
        configure_msi_register(dev, msi_cap_addr, msg_addr, msg_data, num_vector_exponent);
        Ok(())
    } else if msix_cap_addr != 0 {
        Err(make_error!(StatusCode::NotImplemented))
    } else {
        Err(make_error!(StatusCode::NoPCIMSI))
    }
}

pub fn configure_msi_fixed_destination(
    dev: &Device,
    apic_id: u8,
    trigger_mode: MSITriggerMode,
    delivery_mode: MSIDeliveryMode,
    vector: u8,
    num_vector_exponent: u8,
) -> Result<()> {
    let msg_addr = 0xFEE00000u32 | (apic_id as u32) << 12;
    let mut msg_data = (delivery_mode as u32) << 8 | vector as u32;
    if trigger_mode == MSITriggerMode::Level {
        msg_data |= 0xc000;
    }
    configure_msi(dev, msg_addr, msg_data, num_vector_exponent)
}
