pub mod config;
pub mod context;
pub mod device;
pub mod devmgr;
pub mod port;
pub mod registers;
pub mod ring;
pub mod speed;
pub mod trb;

pub use config::{SpinLimit, XhciConfig};
pub use port::{Port, PortConfigPhase, PortPhases};

use log::{debug, info, trace, warn};
use crate::{
    make_error,
    status::{Result, StatusCode},
    usb::memory::DmaSlice,
    volatile::Volatile,
};
use devmgr::DeviceManager;
use registers::*;
use ring::{CommandRing, EventRing};
use trb::{
    AddressDeviceCommand, CommandCompletionEvent, ConfigureEndpointCommand, EnableSlotCommand,
    GenericTrb, PortStatusChangeEvent, TransferEvent, Trb,
};

/// Scratchpad buffer array and the pages it points at.
struct Scratchpad {
    array: DmaSlice<u64>,
    _pages: DmaSlice<u8>,
}

/// Host controller state: rings, device slots and the bring-up phase of every port.
pub struct Controller {
    op_regs: *mut OperationalRegisters,
    doorbell_first: *mut DoorbellRegister,
    port_regs_base: *mut PortRegisterSet,
    max_ports: u8,
    spin_limit: SpinLimit,
    transfer_ring_size: usize,
    devmgr: DeviceManager,
    cr: CommandRing,
    er: EventRing,
    phases: PortPhases,
    scratchpad: Option<Scratchpad>,
}

impl Controller {
    /// Takes the controller from the firmware, resets it and sets up the
    /// DCBAA, the command ring and the primary event ring.
    ///
    /// # Safety
    /// mmio_base must be a valid base address for xHCI device MMIO
    pub unsafe fn initialize(mmio_base: usize, config: &XhciConfig) -> Result<Self> {
        let limit = config.spin_limit;
        let cap_regs = mmio_base as *mut CapabilityRegisters;
        let caplength = (*cap_regs).cap_length.read();
        let op_regs = (mmio_base + caplength as usize) as *mut OperationalRegisters;
        let hcs_params1 = (*cap_regs).hcs_params1.read();
        let max_ports = hcs_params1.max_ports();
        let doorbell_first = (mmio_base + (*cap_regs).db_off.read().offset()) as *mut DoorbellRegister;
        let primary_interrupter =
            (mmio_base + (*cap_regs).rts_off.read().offset() + 0x20) as *mut InterrupterRegisterSet;
        let port_regs_base = (op_regs as usize + 0x400) as *mut PortRegisterSet;

        let slots = hcs_params1.max_device_slots().min(config.max_slots);
        let mut devmgr = DeviceManager::new(slots)?;
        trace!("up to {} slots, {} ports", slots, max_ports);

        Self::request_hc_ownership(mmio_base, cap_regs, limit)?;

        if (*op_regs).usbsts.read().host_controller_halted() == 0 {
            (*op_regs).usbcmd.modify(|usbcmd| usbcmd.set_run_stop(0));
        }
        // Host controller must be halted
        limit.wait_until(|| (*op_regs).usbsts.read().host_controller_halted() == 1)?;
        trace!("host controller halted");

        (*op_regs).usbcmd.modify(|usbcmd| usbcmd.set_host_controller_reset(1));
        limit.wait_until(|| (*op_regs).usbcmd.read().host_controller_reset() == 0)?;
        limit.wait_until(|| (*op_regs).usbsts.read().controller_not_ready() == 0)?;
        debug!("controller is reset and ready");

        (*op_regs)
            .config
            .modify(|config| config.set_max_device_slots_enabled(slots));

        let scratchpad = Self::alloc_scratchpad(
            (*cap_regs).hcs_params2.read().max_scratchpad_buf(),
            (*op_regs).pagesize.read().page_size(),
        )?;
        if let Some(scratchpad) = &scratchpad {
            devmgr.set_scratchpad_array(scratchpad.array.dma_addr());
        }

        let dcbaa_addr = devmgr.dcbaa_addr();
        (*op_regs).dcbaap.modify(|dcbaap| dcbaap.set_pointer(dcbaa_addr));

        let cr = CommandRing::with_capacity(config.command_ring_size)?;
        let (cr_cycle, cr_addr) = (cr.cycle_bit() as u8, cr.buffer_addr());
        //register the address of the Command Ring buffer
        (*op_regs).crcr.modify(|crcr| {
            crcr.set_ring_cycle_state(cr_cycle);
            crcr.set_command_stop(0);
            crcr.set_command_abort(0);
            crcr.set_pointer(cr_addr);
        });

        let er = EventRing::new(config.event_ring_size, primary_interrupter)?;

        (*primary_interrupter).iman.modify(|iman| {
            iman.set_interrupt_pending(1);
            iman.set_interrupter_enable(1);
        });
        (*op_regs).usbcmd.modify(|usbcmd| usbcmd.set_interrupter_enable(1));

        Ok(Self {
            op_regs,
            doorbell_first,
            port_regs_base,
            max_ports,
            spin_limit: limit,
            transfer_ring_size: config.transfer_ring_size,
            devmgr,
            cr,
            er,
            phases: PortPhases::new(),
            scratchpad,
        })
    }

    fn alloc_scratchpad(num_pages: usize, page_size: usize) -> Result<Option<Scratchpad>> {
        if num_pages == 0 {
            return Ok(None);
        }
        trace!("max scratchpad buffer: {} pages", num_pages);
        let pages = DmaSlice::from_fn(num_pages * page_size, page_size, None, |_| 0u8)?;
        let pages_addr = pages.dma_addr();
        let array = DmaSlice::from_fn(num_pages, 64, Some(page_size), |i| {
            pages_addr + (i * page_size) as u64
        })?;
        Ok(Some(Scratchpad { array, _pages: pages }))
    }

    unsafe fn request_hc_ownership(
        mmio_base: usize,
        cap_regs: *mut CapabilityRegisters,
        limit: SpinLimit,
    ) -> Result<()> {
        type MmExtendedReg = Volatile<ExtendedRegister>;

        let xecp = (*cap_regs).hcc_params1.read().xecp() as usize;
        if xecp == 0 {
            trace!("No extended capabilities");
            return Ok(());
        }
        let mut ptr = (mmio_base as *mut MmExtendedReg).add(xecp);
        let reg = loop {
            let ext = (*ptr).read();
            if ext.capability_id() == Usblegsup::ID {
                break ptr as *mut Volatile<Usblegsup>;
            }
            match ext.next_capability_pointer() {
                0 => {
                    trace!("No USB legacy support");
                    return Ok(());
                }
                next => ptr = ptr.add(next as usize),
            }
        };

        if (*reg).read().hc_os_owned_semaphore() == 1 {
            trace!("already os owned");
            return Ok(());
        }
        (*reg).modify(|legsup| legsup.set_hc_os_owned_semaphore(1));
        trace!("waiting until OS owns xHC...");
        limit.wait_until(|| {
            let r = (*reg).read();
            r.hc_bios_owned_semaphore() == 0 && r.hc_os_owned_semaphore() == 1
        })?;
        debug!("OS has owned xHC");
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let op_regs = self.op_regs;
        unsafe {
            (*op_regs).usbcmd.modify(|usbcmd| usbcmd.set_run_stop(1));
        }
        self.spin_limit
            .wait_until(|| unsafe { (*op_regs).usbsts.read().host_controller_halted() == 0 })?;
        info!("xHC started");
        Ok(())
    }

    pub fn max_ports(&self) -> u8 {
        self.max_ports
    }

    /// Root hub port `port_num` (1-based).
    pub fn port_at(&self, port_num: u8) -> Option<Port> {
        if !(1 <= port_num && port_num <= self.max_ports) {
            return None;
        }
        Some(unsafe { Port::new(port_num, self.port_regs_base.add(port_num as usize - 1)) })
    }

    pub fn port_phase(&self, port_num: u8) -> PortConfigPhase {
        self.phases.phase(port_num)
    }

    pub fn scratchpad_len(&self) -> usize {
        self.scratchpad.as_ref().map_or(0, |s| s.array.len())
    }

    /// Starts bring-up of every port that is already connected.
    pub fn configure_ports(&mut self) {
        for port_num in 1..=self.max_ports {
            if let Err(e) = self.configure_port(port_num) {
                warn!("Failed to configure the port {}: {}", port_num, e);
            }
        }
    }

    pub fn configure_port(&mut self, port_num: u8) -> Result<()> {
        let port = self
            .port_at(port_num)
            .ok_or_else(|| make_error!(StatusCode::IndexOutOfRange))?;
        if !port.is_connected() || self.phases.phase(port_num) != PortConfigPhase::NotConnected {
            return Ok(());
        }
        trace!("Port {}: connected", port_num);
        port::reset_port(&port, &mut self.phases, self.spin_limit)
    }

    pub fn reset_port(&mut self, port_num: u8) -> Result<()> {
        let port = self
            .port_at(port_num)
            .ok_or_else(|| make_error!(StatusCode::IndexOutOfRange))?;
        port::reset_port(&port, &mut self.phases, self.spin_limit)
    }

    /// Hands the addressing gate to the lowest deferred port that can take it.
    fn start_next_waiting_port(&mut self) {
        trace!("looking for the next port to address ...");
        while self.phases.addressing_port().is_none() {
            let Some(port_num) = self.phases.first_waiting() else {
                return;
            };
            trace!("the next port is port {}!", port_num);
            if let Err(e) = self.reset_port(port_num) {
                warn!("port {}: dropped: {}", port_num, e);
                self.phases.abandon(port_num);
            }
        }
    }

    fn ring_command_doorbell(&mut self) {
        trace!("ring the doorbell zero (Command Ring)");
        unsafe { (*self.doorbell_first).ring(0) };
    }

    fn push_command(&mut self, cmd: &GenericTrb) {
        self.cr.push(cmd);
        self.ring_command_doorbell();
    }

    pub fn has_pending_event(&self) -> bool {
        self.er.has_front()
    }

    /// Handles the event at the front of the primary event ring, if any.
    ///
    /// The event is consumed even when handling it fails.
    pub fn process_event(&mut self) -> Result<()> {
        let Some(trb) = self.er.front() else {
            return Ok(());
        };
        trace!("event found: {:?}", trb);
        let result = if let Some(event) = trb.downcast_ref::<TransferEvent>() {
            self.on_transfer_event(event)
        } else if let Some(event) = trb.downcast_ref::<CommandCompletionEvent>() {
            self.on_command_completion_event(event)
        } else if let Some(event) = trb.downcast_ref::<PortStatusChangeEvent>() {
            self.on_port_status_change_event(event)
        } else {
            trace!("ignoring {:?}", trb);
            Ok(())
        };
        self.er.pop();
        result
    }

    fn on_port_status_change_event(&mut self, event: &PortStatusChangeEvent) -> Result<()> {
        let port_id = event.port_id();
        let port = self
            .port_at(port_id)
            .ok_or_else(|| make_error!(StatusCode::IndexOutOfRange))?;
        let phase = self.phases.phase(port_id);
        trace!(
            "PortStatusChangeEvent: port_id = {}, phase = {:?}, (bits = {:032b})",
            port_id,
            phase,
            port.bits(),
        );

        match phase {
            PortConfigPhase::NotConnected => {
                if port.is_connect_status_changed() {
                    port.clear_connect_status_change();
                }
                port::reset_port(&port, &mut self.phases, self.spin_limit)
            }
            PortConfigPhase::ResettingPort => {
                if !(port.is_enabled() && port.is_port_reset_changed()) {
                    trace!("skipping: enable_slot: port_id = {}", port_id);
                    return Ok(());
                }
                port.clear_port_reset_change();
                self.phases.set(port_id, PortConfigPhase::EnablingSlot);
                self.push_command(EnableSlotCommand::default().upcast());
                Ok(())
            }
            PortConfigPhase::EnablingSlot | PortConfigPhase::WaitingAddressed => {
                trace!("skipping: port_id = {} in {:?}", port_id, phase);
                Ok(())
            }
            phase => {
                warn!("port {}: unexpected status change in {:?}", port_id, phase);
                Err(make_error!(StatusCode::InvalidPhase))
            }
        }
    }

    fn on_command_completion_event(&mut self, event: &CommandCompletionEvent) -> Result<()> {
        let slot_id = event.slot_id();
        let issuer = self.cr.trb_at(event.command_trb_pointer()).ok_or_else(|| {
            warn!("command TRB {:#x} is not on the command ring", event.command_trb_pointer());
            make_error!(StatusCode::InvalidPhase)
        })?;
        let issuer_type = issuer.trb_type();
        trace!(
            "CommandCompletionEvent: slot_id = {}, issuer = {}, code = {}",
            slot_id,
            trb::type_name(issuer_type),
            event.completion_code()
        );

        if !trb::is_success(event.completion_code()) {
            return Err(self.on_command_failed(issuer_type, slot_id, event.completion_code()));
        }

        match issuer_type {
            EnableSlotCommand::TYPE => self.address_device(slot_id),
            AddressDeviceCommand::TYPE => {
                let port_num = self
                    .devmgr
                    .find_by_slot(slot_id)
                    .ok_or_else(|| make_error!(StatusCode::InvalidSlotId))?
                    .port_num();
                if self.phases.addressing_port() != Some(port_num) {
                    warn!(
                        "addressing_port = {:?}, but the event is on port = {}",
                        self.phases.addressing_port(),
                        port_num
                    );
                    return Err(make_error!(StatusCode::InvalidPhase));
                }
                self.phases.advance(
                    port_num,
                    PortConfigPhase::AddressingDevice,
                    PortConfigPhase::InitializingDevice,
                )?;
                self.phases.release_gate(port_num);
                self.start_next_waiting_port();

                self.devmgr
                    .find_by_slot_mut(slot_id)
                    .ok_or_else(|| make_error!(StatusCode::InvalidSlotId))?
                    .start_initialization()
            }
            ConfigureEndpointCommand::TYPE => {
                let dev = self
                    .devmgr
                    .find_by_slot_mut(slot_id)
                    .ok_or_else(|| make_error!(StatusCode::InvalidSlotId))?;
                let port_num = dev.port_num();
                self.phases.expect(port_num, PortConfigPhase::ConfiguringEndpoints)?;
                dev.on_endpoints_configured()?;
                self.phases.set(port_num, PortConfigPhase::Configured);
                info!("port {}: slot {} configured", port_num, slot_id);
                Ok(())
            }
            _ => {
                warn!("unexpected completion of {}", trb::type_name(issuer_type));
                Err(make_error!(StatusCode::InvalidPhase))
            }
        }
    }

    fn address_device(&mut self, slot_id: u8) -> Result<()> {
        let port_num = self
            .phases
            .addressing_port()
            .ok_or_else(|| make_error!(StatusCode::InvalidPhase))?;
        self.phases.expect(port_num, PortConfigPhase::EnablingSlot)?;
        let port = self
            .port_at(port_num)
            .ok_or_else(|| make_error!(StatusCode::IndexOutOfRange))?;
        trace!("address_device: port = {}, slot = {}", port_num, slot_id);

        let speed = match port.speed() {
            Ok(speed) => speed,
            Err(e) => return Err(self.abort_addressing(port_num, None, e)),
        };
        let doorbell = unsafe { self.doorbell_first.add(slot_id as usize) };
        let ring_size = self.transfer_ring_size;
        let dev = match unsafe { self.devmgr.alloc_device(slot_id, doorbell, ring_size) } {
            Ok(dev) => dev,
            Err(e) => return Err(self.abort_addressing(port_num, None, e)),
        };
        let input_ctx = match dev.initialize(port_num, speed) {
            Ok(input_ctx) => input_ctx,
            Err(e) => return Err(self.abort_addressing(port_num, Some(slot_id), e)),
        };
        if let Err(e) = self.devmgr.load_dcbaa(slot_id) {
            return Err(self.abort_addressing(port_num, Some(slot_id), e));
        }

        self.phases.set(port_num, PortConfigPhase::AddressingDevice);
        self.push_command(AddressDeviceCommand::new(input_ctx, slot_id).upcast());
        Ok(())
    }

    /// Gives up on the port being addressed: frees `slot_id` if a device was
    /// allocated in it, puts the port back to `NotConnected` and hands the
    /// gate to the next waiting port. Returns `err` for the caller to report.
    fn abort_addressing(&mut self, port_num: u8, slot_id: Option<u8>, err: crate::Error) -> crate::Error {
        warn!("port {}: addressing aborted: {}", port_num, err);
        if let Some(slot_id) = slot_id {
            if let Err(e) = self.devmgr.remove(slot_id) {
                warn!("slot {}: could not be freed: {}", slot_id, e);
            }
        }
        self.phases.abandon(port_num);
        self.start_next_waiting_port();
        err
    }

    /// Puts the port being addressed back to `NotConnected` when its
    /// Enable Slot or Address Device command fails.
    fn on_command_failed(&mut self, issuer_type: u8, slot_id: u8, code: u8) -> crate::Error {
        warn!(
            "{} failed: slot_id = {}, code = {}",
            trb::type_name(issuer_type),
            slot_id,
            code
        );
        let err = make_error!(StatusCode::CommandCompletionFailed { slot_id });
        let Some(port_num) = self.phases.addressing_port() else {
            return err;
        };
        match (issuer_type, self.phases.phase(port_num)) {
            (EnableSlotCommand::TYPE, PortConfigPhase::EnablingSlot) => {
                self.abort_addressing(port_num, None, err)
            }
            (AddressDeviceCommand::TYPE, PortConfigPhase::AddressingDevice) => {
                self.abort_addressing(port_num, Some(slot_id), err)
            }
            _ => err,
        }
    }

    fn on_transfer_event(&mut self, event: &TransferEvent) -> Result<()> {
        let slot_id = event.slot_id();
        trace!("TransferEvent: slot_id = {}", slot_id);
        let dev = self
            .devmgr
            .find_by_slot_mut(slot_id)
            .ok_or_else(|| make_error!(StatusCode::InvalidSlotId))?;
        dev.on_transfer_event_received(event)?;

        let port_num = dev.port_num();
        if dev.is_initialized() && self.phases.phase(port_num) == PortConfigPhase::InitializingDevice {
            let input_ctx = dev.configure_endpoints()?;
            self.phases.set(port_num, PortConfigPhase::ConfiguringEndpoints);
            self.push_command(ConfigureEndpointCommand::new(input_ctx, slot_id).upcast());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{
        descriptor::tests::MOUSE_CONFIG,
        memory::init_test_pool,
        xhci::{
            device::{
                tests::{dma_transfer, pending_control, MOUSE_DEVICE},
                Device,
            },
            port::GateDecision,
            trb::{
                completion_code,
                tests::{command_completion, port_status_change},
            },
        },
    };
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    };

    const OP_BASE: usize = 0x20;
    const PORT_BASE: usize = OP_BASE + 0x400;
    const RT_BASE: usize = 0x600;
    const DB_BASE: usize = 0x800;

    /// Zeroed MMIO window with capability registers describing 8 slots and 4 ports.
    fn fake_mmio() -> *mut u32 {
        let mmio: &'static mut [u32; 0x400] = Box::leak(Box::new([0; 0x400]));
        mmio[0] = OP_BASE as u32;
        mmio[1] = 8 | 4 << 24;
        mmio[5] = DB_BASE as u32;
        mmio[6] = RT_BASE as u32;
        mmio[(OP_BASE + 4) / 4] = 1;
        mmio.as_mut_ptr()
    }

    fn reg(mmio: *mut u32, offset: usize) -> *mut u32 {
        unsafe { mmio.add(offset / 4) }
    }

    fn portsc(mmio: *mut u32, port_num: u8) -> *mut u32 {
        reg(mmio, PORT_BASE + (port_num as usize - 1) * 0x10)
    }

    fn fake_controller(mmio: *mut u32) -> Controller {
        let base = mmio as usize;
        let interrupter = (base + RT_BASE + 0x20) as *mut InterrupterRegisterSet;
        Controller {
            op_regs: (base + OP_BASE) as *mut OperationalRegisters,
            doorbell_first: (base + DB_BASE) as *mut DoorbellRegister,
            port_regs_base: (base + PORT_BASE) as *mut PortRegisterSet,
            max_ports: 4,
            spin_limit: SpinLimit::polls(100),
            transfer_ring_size: 32,
            devmgr: DeviceManager::new(8).unwrap(),
            cr: CommandRing::with_capacity(32).unwrap(),
            er: unsafe { EventRing::new(32, interrupter) }.unwrap(),
            phases: PortPhases::new(),
            scratchpad: None,
        }
    }

    /// Writes `trb` where ERDP says the next event goes, with the expected cycle bit.
    fn post(ctrl: &Controller, mmio: *mut u32, mut trb: GenericTrb) {
        let interrupter = reg(mmio, RT_BASE + 0x20) as *const InterrupterRegisterSet;
        let dequeue = unsafe { (*interrupter).erdp.read().pointer() };
        trb.set_cycle_bit(ctrl.er.cycle_bit() as u8);
        unsafe { (dequeue as *mut GenericTrb).write_volatile(trb) };
    }

    fn command_at(ctrl: &Controller, idx: u64) -> GenericTrb {
        ctrl.cr.trb_at(ctrl.cr.buffer_addr() + idx * 16).unwrap()
    }

    /// Plays the controller on another thread: once `watch` has any bit of
    /// `trigger` set, clears `clear` and sets `set` in `target`. Yields
    /// whether that happened before the deadline.
    fn respond_once(watch: *mut u32, trigger: u32, target: *mut u32, clear: u32, set: u32) -> JoinHandle<bool> {
        let (watch, target) = (watch as usize, target as usize);
        thread::spawn(move || {
            let watch = unsafe { &*(watch as *const AtomicU32) };
            let target = unsafe { &*(target as *const AtomicU32) };
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if watch.load(Ordering::SeqCst) & trigger != 0 {
                    let v = target.load(Ordering::SeqCst);
                    target.store((v & !clear) | set, Ordering::SeqCst);
                    return true;
                }
                thread::yield_now();
            }
            false
        })
    }

    #[test]
    fn initialize_times_out_when_reset_never_completes() {
        init_test_pool();
        let mmio = fake_mmio();
        let config = XhciConfig {
            spin_limit: SpinLimit::polls(100),
            ..XhciConfig::default()
        };
        let err = unsafe { Controller::initialize(mmio as usize, &config) }.err().unwrap();
        assert_eq!(err, StatusCode::HardwareTimeout);
        assert_eq!(unsafe { reg(mmio, OP_BASE).read_volatile() } & 0b10, 0b10);
    }

    #[test]
    fn empty_event_ring_is_left_alone() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        assert!(!ctrl.has_pending_event());
        ctrl.process_event().unwrap();
        assert!(ctrl.port_at(0).is_none() && ctrl.port_at(5).is_none());
        assert_eq!(ctrl.port_at(4).map(|p| p.number()), Some(4));
    }

    #[test]
    fn mouse_is_brought_up_from_reset_to_configured() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        let cr_base = ctrl.cr.buffer_addr();

        // port 1 finished its reset: connected, enabled, high speed, PRC
        ctrl.phases.acquire_gate(1).unwrap();
        unsafe { portsc(mmio, 1).write_volatile(0x0020_0C03) };
        post(&ctrl, mmio, port_status_change(1));
        assert!(ctrl.has_pending_event());
        ctrl.process_event().unwrap();
        assert!(!ctrl.has_pending_event());
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::EnablingSlot);
        assert_eq!(command_at(&ctrl, 0).trb_type(), EnableSlotCommand::TYPE);

        // plain memory lost the RO speed field on the PRC write
        unsafe { portsc(mmio, 1).write_volatile(0x0000_0C03) };
        post(&ctrl, mmio, command_completion(cr_base, 1, completion_code::SUCCESS));
        ctrl.process_event().unwrap();
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::AddressingDevice);
        let address_cmd = command_at(&ctrl, 1);
        let address_cmd = address_cmd.downcast_ref::<AddressDeviceCommand>().unwrap();
        assert_eq!(address_cmd.slot_id(), 1);
        let ctx_addr = ctrl.devmgr.find_by_slot(1).unwrap().device_context_addr();
        let dcbaa = ctrl.devmgr.dcbaa_addr() as *const u64;
        assert_eq!(unsafe { dcbaa.add(1).read_volatile() }, ctx_addr);

        post(&ctrl, mmio, command_completion(cr_base + 16, 1, completion_code::SUCCESS));
        ctrl.process_event().unwrap();
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::InitializingDevice);
        assert_eq!(ctrl.phases.addressing_port(), None);
        assert_eq!(unsafe { reg(mmio, DB_BASE + 4).read_volatile() }, 1);

        let steps: [(usize, &[u8]); 3] = [(18, &MOUSE_DEVICE), (Device::BUF_SIZE, &MOUSE_CONFIG), (0, &[])];
        for (requested, data) in steps {
            let dev = ctrl.devmgr.find_by_slot(1).unwrap();
            let event = dma_transfer(dev, pending_control(dev), 1, requested, data);
            post(&ctrl, mmio, event);
            ctrl.process_event().unwrap();
        }
        assert!(ctrl.devmgr.find_by_slot(1).unwrap().is_initialized());
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::ConfiguringEndpoints);
        assert_eq!(command_at(&ctrl, 2).trb_type(), ConfigureEndpointCommand::TYPE);

        post(&ctrl, mmio, command_completion(cr_base + 32, 1, completion_code::SUCCESS));
        ctrl.process_event().unwrap();
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::Configured);
        // Set Protocol went out on EP0
        let dev = ctrl.devmgr.find_by_slot(1).unwrap();
        assert!(pending_control(dev) != 0);
    }

    #[test]
    fn failed_enable_slot_releases_the_gate() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        let cr_base = ctrl.cr.buffer_addr();

        ctrl.phases.acquire_gate(1).unwrap();
        ctrl.phases.acquire_gate(2).unwrap();
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::WaitingAddressed);
        unsafe { portsc(mmio, 1).write_volatile(0x0020_0C03) };
        post(&ctrl, mmio, port_status_change(1));
        ctrl.process_event().unwrap();

        // port 2 has gone away in the meantime
        post(&ctrl, mmio, command_completion(cr_base, 0, 9));
        let err = ctrl.process_event().unwrap_err();
        assert_eq!(err, StatusCode::CommandCompletionFailed { slot_id: 0 });
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::NotConnected);
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::NotConnected);
        assert_eq!(ctrl.phases.addressing_port(), None);
        assert!(!ctrl.has_pending_event());
    }

    #[test]
    fn status_change_in_unexpected_phase_is_reported() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        ctrl.phases.set(3, PortConfigPhase::Configured);
        post(&ctrl, mmio, port_status_change(3));
        assert_eq!(ctrl.process_event().unwrap_err(), StatusCode::InvalidPhase);

        post(&ctrl, mmio, port_status_change(9));
        assert_eq!(ctrl.process_event().unwrap_err(), StatusCode::IndexOutOfRange);
    }

    #[test]
    fn initialize_takes_ownership_and_registers_rings() {
        init_test_pool();
        let mmio = fake_mmio();
        unsafe {
            // two scratchpad buffers, USBLEGSUP at dword 0x300
            reg(mmio, 0x08).write_volatile(2 << 27);
            reg(mmio, 0x10).write_volatile(0x300 << 16);
            reg(mmio, 0xC00).write_volatile(Usblegsup::ID as u32);
        }
        let usbcmd = reg(mmio, OP_BASE);
        let reset_done = respond_once(usbcmd, 0b10, usbcmd, 0b10, 0);
        let config = XhciConfig {
            spin_limit: SpinLimit::polls(1 << 30),
            ..XhciConfig::default()
        };
        let mut ctrl = unsafe { Controller::initialize(mmio as usize, &config) }.unwrap();
        assert!(reset_done.join().unwrap());

        let read = |offset| unsafe { reg(mmio, offset).read_volatile() };
        let read64 = |offset| read(offset) as u64 | (read(offset + 4) as u64) << 32;

        assert_eq!(read(0xC00) & 0x0101_0000, 0x0100_0000);
        assert_eq!(read(OP_BASE + 0x38) & 0xff, 8);

        let dcbaa = read64(OP_BASE + 0x30);
        assert_eq!(dcbaa, ctrl.devmgr.dcbaa_addr());
        assert_eq!(ctrl.scratchpad_len(), 2);
        let array = unsafe { (dcbaa as *const u64).read_volatile() };
        assert_eq!(array, ctrl.scratchpad.as_ref().unwrap().array.dma_addr());
        let pages = array as *const u64;
        let (first, second) = unsafe { (pages.read_volatile(), pages.add(1).read_volatile()) };
        assert_eq!(first % 4096, 0);
        assert_eq!(second - first, 4096);

        let crcr = read64(OP_BASE + 0x18);
        assert_eq!(crcr & 1, 1);
        assert_eq!(crcr & !0x3f, ctrl.cr.buffer_addr());

        assert_eq!(read(RT_BASE + 0x28), 1);
        let erst = read64(RT_BASE + 0x30) as *const u64;
        assert_eq!(unsafe { erst.read_volatile() }, ctrl.er.buffer_addr());
        assert_eq!(read64(RT_BASE + 0x38) & !0xf, ctrl.er.buffer_addr());
        assert_eq!(read(RT_BASE + 0x20) & 0b10, 0b10);
        assert_eq!(read(OP_BASE) & 0b100, 0b100);

        let started = respond_once(usbcmd, 0b1, reg(mmio, OP_BASE + 4), 0b1, 0);
        ctrl.run().unwrap();
        assert!(started.join().unwrap());
        assert_eq!(read(OP_BASE) & 1, 1);
    }

    #[test]
    fn unknown_speed_aborts_addressing_and_frees_the_gate() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        let cr_base = ctrl.cr.buffer_addr();

        ctrl.phases.acquire_gate(1).unwrap();
        // port 2 waits behind port 1 and is gone by the time the gate frees up
        ctrl.phases.acquire_gate(2).unwrap();
        // reset done and enabled, but speed ID 0
        unsafe { portsc(mmio, 1).write_volatile(0x0020_0003) };
        post(&ctrl, mmio, port_status_change(1));
        ctrl.process_event().unwrap();
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::EnablingSlot);

        post(&ctrl, mmio, command_completion(cr_base, 1, completion_code::SUCCESS));
        let err = ctrl.process_event().unwrap_err();
        assert_eq!(err, StatusCode::UnknownXHCISpeedID);
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::NotConnected);
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::NotConnected);
        assert_eq!(ctrl.phases.addressing_port(), None);
        assert!(ctrl.devmgr.find_by_slot(1).is_none());
        let dcbaa = ctrl.devmgr.dcbaa_addr() as *const u64;
        assert_eq!(unsafe { dcbaa.add(1).read_volatile() }, 0);

        assert_eq!(ctrl.phases.acquire_gate(3).unwrap(), GateDecision::Acquired);
    }

    #[test]
    fn slot_collision_keeps_the_existing_device() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        let cr_base = ctrl.cr.buffer_addr();
        let doorbell = ctrl.doorbell_first;
        unsafe { ctrl.devmgr.alloc_device(1, doorbell, 32) }.unwrap();
        ctrl.devmgr.load_dcbaa(1).unwrap();

        ctrl.phases.acquire_gate(1).unwrap();
        unsafe { portsc(mmio, 1).write_volatile(0x0020_0C03) };
        post(&ctrl, mmio, port_status_change(1));
        ctrl.process_event().unwrap();

        unsafe { portsc(mmio, 1).write_volatile(0x0000_0C03) };
        post(&ctrl, mmio, command_completion(cr_base, 1, completion_code::SUCCESS));
        let err = ctrl.process_event().unwrap_err();
        assert_eq!(err, StatusCode::AlreadyAllocated);
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::NotConnected);
        assert_eq!(ctrl.phases.addressing_port(), None);
        let ctx_addr = ctrl.devmgr.find_by_slot(1).unwrap().device_context_addr();
        let dcbaa = ctrl.devmgr.dcbaa_addr() as *const u64;
        assert_eq!(unsafe { dcbaa.add(1).read_volatile() }, ctx_addr);
    }

    #[test]
    fn waiting_port_is_reset_once_the_gate_is_released() {
        init_test_pool();
        let mmio = fake_mmio();
        let mut ctrl = fake_controller(mmio);
        ctrl.spin_limit = SpinLimit::polls(1 << 30);
        let cr_base = ctrl.cr.buffer_addr();

        ctrl.phases.acquire_gate(1).unwrap();
        // connected and powered
        unsafe { portsc(mmio, 2).write_volatile(0x0000_0201) };
        ctrl.configure_port(2).unwrap();
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::WaitingAddressed);
        assert_eq!(unsafe { portsc(mmio, 2).read_volatile() }, 0x0000_0201);

        unsafe { portsc(mmio, 1).write_volatile(0x0020_0C03) };
        post(&ctrl, mmio, port_status_change(1));
        ctrl.process_event().unwrap();
        unsafe { portsc(mmio, 1).write_volatile(0x0000_0C03) };
        post(&ctrl, mmio, command_completion(cr_base, 1, completion_code::SUCCESS));
        ctrl.process_event().unwrap();
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::AddressingDevice);
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::WaitingAddressed);

        // the controller finishes port 2's reset as soon as PR is written
        let port2 = portsc(mmio, 2);
        let reset_done = respond_once(port2, 0x10, port2, 0x10, 0x0020_0002);
        post(&ctrl, mmio, command_completion(cr_base + 16, 1, completion_code::SUCCESS));
        ctrl.process_event().unwrap();
        assert!(reset_done.join().unwrap());
        assert_eq!(ctrl.port_phase(1), PortConfigPhase::InitializingDevice);
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::ResettingPort);
        assert_eq!(ctrl.phases.addressing_port(), Some(2));
        assert_eq!(unsafe { port2.read_volatile() } & 0x0020_0012, 0x0020_0002);

        unsafe { port2.write_volatile(0x0020_0C03) };
        post(&ctrl, mmio, port_status_change(2));
        ctrl.process_event().unwrap();
        assert_eq!(ctrl.port_phase(2), PortConfigPhase::EnablingSlot);
        assert_eq!(command_at(&ctrl, 2).trb_type(), EnableSlotCommand::TYPE);
    }
}
