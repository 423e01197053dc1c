use core::convert::TryFrom;
use log::{debug, info, trace, warn};
use crate::{
    fixed_vec::FixedVec,
    make_error,
    status::{Result, StatusCode},
    usb::{
        array_map::ArrayMap,
        classdriver::{self, ClassDriver, DriverKind, TransferRequest},
        descriptor::{
            self, desc_type, ConfigurationDescriptor, DescIter, DeviceDescriptor,
            EndpointDescriptor, HidDescriptor, InterfaceDescriptor,
        },
        endpoint::{EndpointConfig, EndpointId, EndpointType},
        memory::{DmaBox, DmaSlice, PAGE_BOUNDARY},
        setupdata::{request, SetupData},
    },
};
use super::{
    context::{DeviceContext, DeviceContextIndex, InputContext, SlotContext},
    registers::DoorbellRegister,
    ring::TransferRing,
    speed::PortSpeed,
    trb::{self, DataStage, GenericTrb, Normal, SetupStage, StatusStage, Trb},
};

/// Progress of descriptor enumeration after Address Device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    NotAddressed,
    ReadingDeviceDescriptor,
    ReadingConfigDescriptor,
    SettingConfiguration,
    Initialized,
}

/// One addressed USB device, owning its contexts, transfer rings and class drivers.
pub struct Device {
    slot_id: u8,
    port_num: u8,
    speed: Option<PortSpeed>,
    ctx: DmaBox<DeviceContext>,
    input_ctx: DmaBox<InputContext>,
    doorbell: *mut DoorbellRegister,
    transfer_rings: [Option<TransferRing>; 31],
    transfer_ring_size: usize,

    buf: DmaSlice<u8>,
    init_phase: InitPhase,
    num_configurations: u8,
    ep_configs: FixedVec<EndpointConfig, 16>,
    class_drivers: FixedVec<DriverKind, 4>,

    /// EP number --> class driver index
    class_driver_idxs: [Option<usize>; 16],

    /// Setup Data --> class driver index
    event_waiters: ArrayMap<SetupData, usize, 4>,

    /// {DataStage,StatusStage} TRB address --> SetupData
    setup_stage_map: ArrayMap<u64, SetupData, 16>,
}

impl Device {
    pub const BUF_SIZE: usize = 1024;

    /// # Safety
    /// `doorbell` must be this slot's doorbell register and outlive the device.
    pub unsafe fn new(
        slot_id: u8,
        doorbell: *mut DoorbellRegister,
        transfer_ring_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            slot_id,
            port_num: 0,
            speed: None,
            ctx: DmaBox::new_ext(DeviceContext::default(), 64, Some(PAGE_BOUNDARY))?,
            input_ctx: DmaBox::new_ext(InputContext::default(), 64, Some(PAGE_BOUNDARY))?,
            doorbell,
            transfer_rings: Default::default(),
            transfer_ring_size,
            buf: DmaSlice::from_fn(Self::BUF_SIZE, 64, None, |_| 0)?,
            init_phase: InitPhase::NotAddressed,
            num_configurations: 0,
            ep_configs: FixedVec::new(),
            class_drivers: FixedVec::new(),
            class_driver_idxs: [None; 16],
            event_waiters: ArrayMap::new(),
            setup_stage_map: ArrayMap::new(),
        })
    }

    /// Fills the input context for Address Device and returns its address.
    pub fn initialize(&mut self, port_num: u8, speed: PortSpeed) -> Result<u64> {
        self.port_num = port_num;
        self.speed = Some(speed);

        let slot_ctx = self.input_ctx.enable_slot_context();
        slot_ctx.set_route_string(0);
        slot_ctx.set_root_hub_port_number(port_num);
        slot_ctx.set_context_entries(1);
        slot_ctx.set_speed(speed as u8);

        let ep0_dci = DeviceContextIndex::from(EndpointId::DEFAULT_CONTROL_PIPE);
        let tr_buf = self.alloc_transfer_ring(ep0_dci)?;
        let max_packet_size = speed.determine_max_packet_size_for_control_pipe();
        trace!("slot {}: speed = {:?}, max_packet_size = {}", self.slot_id, speed, max_packet_size);

        let ep0_ctx = self.input_ctx.update_endpoint(ep0_dci);
        ep0_ctx.set_endpoint_type(4);
        ep0_ctx.set_max_packet_size(max_packet_size);
        ep0_ctx.set_max_burst_size(0);
        ep0_ctx.set_transfer_ring_buffer(tr_buf);
        ep0_ctx.set_dequeue_cycle_state(1);
        ep0_ctx.set_interval(0);
        ep0_ctx.set_max_primary_streams(0);
        ep0_ctx.set_mult(0);
        ep0_ctx.set_error_count(3);

        Ok(self.input_ctx.dma_addr())
    }

    fn alloc_transfer_ring(&mut self, dci: DeviceContextIndex) -> Result<u64> {
        let ring = TransferRing::with_capacity(self.transfer_ring_size)?;
        let addr = ring.buffer_addr();
        self.transfer_rings[dci.value() as usize - 1] = Some(ring);
        Ok(addr)
    }

    fn transfer_ring(&mut self, dci: DeviceContextIndex) -> Result<&mut TransferRing> {
        (dci.value() as usize)
            .checked_sub(1)
            .and_then(|i| self.transfer_rings.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or_else(|| make_error!(StatusCode::TransferRingNotSet))
    }

    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    pub fn device_context_addr(&self) -> u64 {
        self.ctx.dma_addr()
    }

    pub fn input_context(&self) -> &InputContext {
        &self.input_ctx
    }

    /// Snapshot of the output context as the controller last wrote it.
    pub fn device_context(&self) -> DeviceContext {
        unsafe { (&*self.ctx as *const DeviceContext).read_volatile() }
    }

    pub fn init_phase(&self) -> InitPhase {
        self.init_phase
    }

    pub fn is_initialized(&self) -> bool {
        self.init_phase == InitPhase::Initialized
    }

    pub fn class_drivers_mut(&mut self) -> &mut [DriverKind] {
        &mut self.class_drivers
    }

    /// Starts enumeration by reading the device descriptor.
    pub fn start_initialization(&mut self) -> Result<()> {
        self.init_phase = InitPhase::ReadingDeviceDescriptor;
        self.get_descriptor(desc_type::DEVICE, 0, 18)
    }

    /// Fills the input context for Configure Endpoint and returns its address.
    pub fn configure_endpoints(&mut self) -> Result<u64> {
        self.input_ctx.clear_control();
        self.input_ctx.slot_ctx =
            unsafe { (&self.ctx.slot_context as *const SlotContext).read_volatile() };
        self.input_ctx.enable_slot_context().set_context_entries(31);

        let frame_intervals = self.speed.map_or(false, |s| s.uses_frame_intervals());
        for i in 0..self.ep_configs.len() {
            let config = self.ep_configs[i];
            let dci = DeviceContextIndex::from(config.ep_id);
            let tr_buf = self.alloc_transfer_ring(dci)?;

            let ep_ctx = self.input_ctx.update_endpoint(dci);
            let dir_in = config.ep_id.is_in();
            let ep_type = match config.ep_type {
                EndpointType::Control => 4,
                EndpointType::Isochronous => if dir_in { 5 } else { 1 },
                EndpointType::Bulk => if dir_in { 6 } else { 2 },
                EndpointType::Interrupt => if dir_in { 7 } else { 3 },
            };
            trace!("slot {}: {:?} -> endpoint type {}", self.slot_id, config.ep_id, ep_type);
            ep_ctx.set_endpoint_type(ep_type);

            // bInterval in frames --> exponent in 125us units
            let interval = if frame_intervals {
                if config.ep_type == EndpointType::Isochronous {
                    config.interval + 2
                } else {
                    floor_log2(config.interval) + 3
                }
            } else {
                config.interval.saturating_sub(1)
            };
            ep_ctx.set_interval(interval);

            ep_ctx.set_max_packet_size(config.max_packet_size);
            ep_ctx.set_average_trb_length(1);
            ep_ctx.set_transfer_ring_buffer(tr_buf);
            ep_ctx.set_dequeue_cycle_state(1);
            ep_ctx.set_max_primary_streams(0);
            ep_ctx.set_mult(0);
            ep_ctx.set_error_count(3);
        }

        Ok(self.input_ctx.dma_addr())
    }

    pub fn on_endpoints_configured(&mut self) -> Result<()> {
        for idx in 0..self.class_drivers.len() {
            let req = self.class_drivers[idx].on_endpoints_configured()?;
            self.submit(Some(idx), req)?;
        }
        Ok(())
    }

    pub fn on_transfer_event_received(&mut self, event: &trb::TransferEvent) -> Result<()> {
        let issuer_addr = event.trb_pointer();
        let ep_id = event.endpoint_id();
        trace!("slot {}: transfer event for TRB {:#x}", self.slot_id, issuer_addr);

        let issuer: GenericTrb = self
            .transfer_ring(DeviceContextIndex::from(ep_id))
            .ok()
            .and_then(|ring| ring.trb_at(issuer_addr))
            .ok_or_else(|| {
                warn!("slot {}: TRB {:#x} is not on any transfer ring", self.slot_id, issuer_addr);
                make_error!(StatusCode::NoCorrespondingSetupStage)
            })?;
        let residual_bytes = event.trb_transfer_length() as usize;
        let succeeded = trb::is_success(event.completion_code());

        if let Some(normal) = issuer.downcast_ref::<Normal>() {
            if !succeeded {
                warn!(
                    "slot {}: interrupt transfer failed with code {}",
                    self.slot_id,
                    event.completion_code()
                );
                let err = make_error!(StatusCode::TransferFailed { slot_id: self.slot_id });
                self.on_interrupt_completed(ep_id, normal.data_buffer(), Err(err))?;
                return Err(err);
            }
            let transferred = (normal.trb_transfer_length() as usize).saturating_sub(residual_bytes);
            return self.on_interrupt_completed(ep_id, normal.data_buffer(), Ok(transferred));
        }

        let setup_data = self.setup_stage_map.remove(&issuer_addr).ok_or_else(|| {
            warn!("slot {}: no corresponding setup stage for {:?}", self.slot_id, issuer);
            make_error!(StatusCode::NoCorrespondingSetupStage)
        })?;
        if !succeeded {
            warn!(
                "slot {}: control transfer {:?} failed with code {}",
                self.slot_id,
                setup_data,
                event.completion_code()
            );
            let err = make_error!(StatusCode::TransferFailed { slot_id: self.slot_id });
            if let Some(idx) = self.event_waiters.remove(&setup_data) {
                let req = self.class_drivers[idx].on_control_completed(ep_id, setup_data, Err(err))?;
                self.submit(Some(idx), req)?;
            }
            return Err(err);
        }

        let transferred = if let Some(data_stage) = issuer.downcast_ref::<DataStage>() {
            Some((data_stage.trb_transfer_length() as usize).saturating_sub(residual_bytes))
        } else if issuer.downcast_ref::<StatusStage>().is_some() {
            None
        } else {
            return Err(make_error!(StatusCode::NoCorrespondingSetupStage));
        };

        self.on_control_completed(ep_id, setup_data, transferred)
    }

    fn on_control_completed(
        &mut self,
        ep_id: EndpointId,
        setup_data: SetupData,
        transferred: Option<usize>,
    ) -> Result<()> {
        trace!(
            "slot {}: control completed in {:?}, transferred = {:?}",
            self.slot_id,
            self.init_phase,
            transferred
        );
        match self.init_phase {
            InitPhase::ReadingDeviceDescriptor => {
                let len = expect_data(&setup_data, request::GET_DESCRIPTOR, transferred)?;
                let device_desc = descriptor::from_bytes::<DeviceDescriptor>(&self.buf[..len])
                    .ok_or_else(|| make_error!(StatusCode::InvalidDescriptor))?;
                self.num_configurations = device_desc.num_configurations;
                info!(
                    "slot {}: device {:04x}:{:04x}, class {}, {} configuration(s)",
                    self.slot_id,
                    { device_desc.vendor_id },
                    { device_desc.product_id },
                    device_desc.device_class,
                    self.num_configurations
                );

                self.init_phase = InitPhase::ReadingConfigDescriptor;
                self.get_descriptor(desc_type::CONFIGURATION, 0, Self::BUF_SIZE as u16)
            }
            InitPhase::ReadingConfigDescriptor => {
                let len = expect_data(&setup_data, request::GET_DESCRIPTOR, transferred)?;
                let config_value = self.parse_configuration(len)?;
                if self.class_drivers.is_empty() {
                    warn!("slot {}: no supported interface", self.slot_id);
                    return Ok(());
                }

                self.init_phase = InitPhase::SettingConfiguration;
                debug!("slot {}: issuing Set Configuration {}", self.slot_id, config_value);
                self.control_out(
                    EndpointId::DEFAULT_CONTROL_PIPE,
                    SetupData::set_configuration(config_value),
                    None,
                    None,
                )
            }
            InitPhase::SettingConfiguration => {
                if setup_data.request != request::SET_CONFIGURATION {
                    return Err(make_error!(StatusCode::InvalidPhase));
                }
                for i in 0..self.ep_configs.len() {
                    let config = self.ep_configs[i];
                    let idx = self.class_driver_idxs[config.ep_id.number() as usize]
                        .ok_or_else(|| make_error!(StatusCode::InvalidEndpointNumber))?;
                    self.class_drivers[idx].set_endpoint(&config)?;
                }
                self.init_phase = InitPhase::Initialized;
                info!("slot {}: initialized", self.slot_id);
                Ok(())
            }
            InitPhase::Initialized => {
                let idx = self.event_waiters.remove(&setup_data).ok_or_else(|| {
                    warn!("slot {}: nobody waits for {:?}", self.slot_id, setup_data);
                    make_error!(StatusCode::NoWaiter)
                })?;
                let buf = transferred.map(|len| &self.buf[..len.min(Self::BUF_SIZE)]);
                let req = self.class_drivers[idx].on_control_completed(ep_id, setup_data, Ok(buf))?;
                self.submit(Some(idx), req)
            }
            InitPhase::NotAddressed => Err(make_error!(StatusCode::InvalidPhase)),
        }
    }

    /// Creates class drivers and endpoint configs from the configuration
    /// descriptor in the device buffer and returns its bConfigurationValue.
    fn parse_configuration(&mut self, len: usize) -> Result<u8> {
        let buf = &self.buf[..len];
        let conf_desc = descriptor::from_bytes::<ConfigurationDescriptor>(buf)
            .ok_or_else(|| make_error!(StatusCode::InvalidDescriptor))?;
        let total_length = conf_desc.total_length as usize;
        if total_length > len {
            warn!("slot {}: configuration truncated to {} of {} bytes", self.slot_id, len, total_length);
        }
        let config_value = conf_desc.configuration_value;

        let mut current_driver = None;
        for desc in DescIter::new(buf) {
            match desc[1] {
                desc_type::INTERFACE => {
                    let if_desc = descriptor::from_bytes::<InterfaceDescriptor>(desc)
                        .ok_or_else(|| make_error!(StatusCode::InvalidDescriptor))?;
                    current_driver = match classdriver::new_class_driver(if_desc) {
                        Ok(driver) => Some(
                            self.class_drivers
                                .push(driver)
                                .map_err(|_| make_error!(StatusCode::Full))?,
                        ),
                        Err(e) if e == StatusCode::UnsupportedInterface => None,
                        Err(e) => return Err(e),
                    };
                }
                desc_type::ENDPOINT => {
                    let Some(idx) = current_driver else { continue };
                    let ep_desc = descriptor::from_bytes::<EndpointDescriptor>(desc)
                        .ok_or_else(|| make_error!(StatusCode::InvalidDescriptor))?;
                    let config = EndpointConfig::try_from(ep_desc)?;
                    debug!("slot {}: {:?}", self.slot_id, config);
                    self.ep_configs
                        .push(config)
                        .map_err(|_| make_error!(StatusCode::Full))?;
                    self.class_driver_idxs[config.ep_id.number() as usize] = Some(idx);
                }
                desc_type::HID => {
                    if let Some(hid_desc) = descriptor::from_bytes::<HidDescriptor>(desc) {
                        debug!("slot {}: {:?}", self.slot_id, hid_desc);
                    }
                }
                _ => {}
            }
        }
        Ok(config_value)
    }

    fn on_interrupt_completed(&mut self, ep_id: EndpointId, buf_addr: u64, outcome: Result<usize>) -> Result<()> {
        trace!("slot {}: interrupt completed on EP addr {}", self.slot_id, ep_id.address());
        let Some(idx) = self.class_driver_idxs[ep_id.number() as usize] else {
            trace!("slot {}: class driver not found", self.slot_id);
            return Ok(());
        };
        let req = self.class_drivers[idx].on_interrupt_completed(ep_id, buf_addr, outcome)?;
        self.submit(Some(idx), req)
    }

    fn submit(&mut self, issuer: Option<usize>, req: TransferRequest) -> Result<()> {
        match req {
            TransferRequest::NoOp => Ok(()),
            TransferRequest::ControlIn(setup_data) => {
                self.control_in(EndpointId::DEFAULT_CONTROL_PIPE, setup_data, issuer)
            }
            TransferRequest::ControlOut(setup_data) => {
                self.control_out(EndpointId::DEFAULT_CONTROL_PIPE, setup_data, issuer, None)
            }
            TransferRequest::InterruptIn { ep_id, buf_addr, len } => {
                self.interrupt_in(ep_id, buf_addr, len)
            }
        }
    }

    fn ring_doorbell(&mut self, dci: DeviceContextIndex) {
        trace!("slot {}: ring the doorbell with target {}", self.slot_id, dci.value());
        unsafe { (*self.doorbell).ring(dci.value()) };
    }

    /// Reserves the bookkeeping a control transfer needs before any TRB is pushed.
    fn register_control(&mut self, setup_data: SetupData, issuer: Option<usize>) -> Result<()> {
        if self.setup_stage_map.is_full() {
            return Err(make_error!(StatusCode::Full));
        }
        if let Some(issuer) = issuer {
            self.event_waiters.insert(setup_data, issuer)?;
        }
        Ok(())
    }

    /// Setup(IN) + Data(IN, IOC) + Status(OUT), reading into the device buffer.
    pub fn control_in(
        &mut self,
        ep_id: EndpointId,
        setup_data: SetupData,
        issuer: Option<usize>,
    ) -> Result<()> {
        trace!("slot {}: control_in on EP addr {}", self.slot_id, ep_id.address());
        if 15 < ep_id.number() {
            return Err(make_error!(StatusCode::InvalidEndpointNumber));
        }
        let dci = DeviceContextIndex::from(ep_id);
        self.transfer_ring(dci)?;
        self.register_control(setup_data, issuer)?;

        let len = (setup_data.length as usize).min(Self::BUF_SIZE) as u32;
        let buf_addr = self.buf.dma_addr();
        let tr = self.transfer_ring(dci)?;

        tr.push(SetupStage::new_in_data_stage(setup_data).upcast());
        let mut data_stage = DataStage::new_in(buf_addr, len);
        data_stage.set_interrupt_on_completion(1);
        let data_stage_addr = tr.push(data_stage.upcast());
        let mut status_stage = StatusStage::default();
        status_stage.set_direction(0);
        tr.push(status_stage.upcast());

        self.setup_stage_map.insert(data_stage_addr, setup_data)?;
        self.ring_doorbell(dci);
        Ok(())
    }

    /// Setup(OUT) + optional Data(OUT) + Status(IN, IOC). The payload is
    /// copied into the device buffer first.
    pub fn control_out(
        &mut self,
        ep_id: EndpointId,
        setup_data: SetupData,
        issuer: Option<usize>,
        data: Option<&[u8]>,
    ) -> Result<()> {
        trace!("slot {}: control_out on EP addr {}", self.slot_id, ep_id.address());
        if 15 < ep_id.number() {
            return Err(make_error!(StatusCode::InvalidEndpointNumber));
        }
        if data.map_or(false, |d| d.len() > Self::BUF_SIZE) {
            return Err(make_error!(StatusCode::IndexOutOfRange));
        }
        let dci = DeviceContextIndex::from(ep_id);
        self.transfer_ring(dci)?;
        self.register_control(setup_data, issuer)?;

        if let Some(data) = data {
            self.buf[..data.len()].copy_from_slice(data);
        }
        let buf_addr = self.buf.dma_addr();
        let tr = self.transfer_ring(dci)?;

        match data {
            Some(data) => {
                tr.push(SetupStage::new_out_data_stage(setup_data).upcast());
                tr.push(DataStage::new_out(buf_addr, data.len() as u32).upcast());
            }
            None => {
                tr.push(SetupStage::new_no_data_stage(setup_data).upcast());
            }
        }
        let mut status_stage = StatusStage::default();
        status_stage.set_direction(1);
        status_stage.set_interrupt_on_completion(1);
        let status_stage_addr = tr.push(status_stage.upcast());

        self.setup_stage_map.insert(status_stage_addr, setup_data)?;
        self.ring_doorbell(dci);
        Ok(())
    }

    /// Queues one Normal TRB on an interrupt IN endpoint.
    pub fn interrupt_in(&mut self, ep_id: EndpointId, buf_addr: u64, len: usize) -> Result<()> {
        let dci = DeviceContextIndex::from(ep_id);
        let tr = self.transfer_ring(dci)?;

        let mut normal = Normal::new(buf_addr, len as u32);
        normal.set_interrupt_on_short_packet(1);
        normal.set_interrupt_on_completion(1);
        tr.push(normal.upcast());

        self.ring_doorbell(dci);
        Ok(())
    }

    fn get_descriptor(&mut self, desc_type: u8, desc_index: u8, len: u16) -> Result<()> {
        self.control_in(
            EndpointId::DEFAULT_CONTROL_PIPE,
            SetupData::get_descriptor(desc_type, desc_index, len),
            None,
        )
    }
}

fn expect_data(setup_data: &SetupData, req: u8, transferred: Option<usize>) -> Result<usize> {
    match transferred {
        Some(len) if setup_data.request == req => Ok(len.min(Device::BUF_SIZE)),
        _ => Err(make_error!(StatusCode::InvalidPhase)),
    }
}

fn floor_log2(v: u8) -> u8 {
    if v == 0 {
        0
    } else {
        7 - v.leading_zeros() as u8
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use spin::Mutex;
    use crate::usb::{
        classdriver::HidPhase,
        descriptor::tests::MOUSE_CONFIG,
        memory::init_test_pool,
        xhci::trb::tests::transfer_event,
        xhci::trb::completion_code,
    };

    pub(crate) const MOUSE_DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x27, 0x06, 0x01, 0x00, 0x00, 0x00, 1, 2, 3, 1,
    ];

    static REPORTS: Mutex<Vec<(u8, i8, i8)>> = Mutex::new(Vec::new());

    fn record(buttons: u8, dx: i8, dy: i8) {
        REPORTS.lock().push((buttons, dx, dy));
    }

    pub(crate) fn fake_doorbell() -> *mut DoorbellRegister {
        Box::into_raw(Box::new(unsafe { core::mem::zeroed() }))
    }

    fn last_doorbell(doorbell: *mut DoorbellRegister) -> u32 {
        unsafe { (doorbell as *const u32).read_volatile() }
    }

    /// Address of the only control TRB waiting for completion.
    pub(crate) fn pending_control(dev: &Device) -> u64 {
        let pending: Vec<u64> = dev.setup_stage_map.iter().map(|(k, _)| *k).collect();
        assert_eq!(pending.len(), 1);
        pending[0]
    }

    /// Plays the controller: DMA `data` into the TRB's buffer and build the
    /// successful Transfer Event it would post.
    pub(crate) fn dma_transfer(dev: &Device, trb_addr: u64, dci: u8, requested: usize, data: &[u8]) -> GenericTrb {
        if !data.is_empty() {
            let trb = dev.transfer_rings[dci as usize - 1].as_ref().unwrap().trb_at(trb_addr).unwrap();
            let buf = trb.parameter() as *mut u8;
            unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len()) };
        }
        transfer_event(
            trb_addr,
            dev.slot_id(),
            dci,
            completion_code::SUCCESS,
            (requested - data.len()) as u32,
        )
    }

    fn complete(dev: &mut Device, trb_addr: u64, dci: u8, requested: usize, data: &[u8]) -> Result<()> {
        let event = dma_transfer(dev, trb_addr, dci, requested, data);
        dev.on_transfer_event_received(event.downcast_ref().unwrap())
    }

    /// Drives a fresh device through enumeration up to an initialized boot mouse.
    pub(crate) fn enumerate_mouse(dev: &mut Device) {
        dev.start_initialization().unwrap();
        let data_trb = pending_control(dev);
        complete(dev, data_trb, 1, 18, &MOUSE_DEVICE).unwrap();
        assert_eq!(dev.init_phase(), InitPhase::ReadingConfigDescriptor);

        let data_trb = pending_control(dev);
        complete(dev, data_trb, 1, Device::BUF_SIZE, &MOUSE_CONFIG).unwrap();
        assert_eq!(dev.init_phase(), InitPhase::SettingConfiguration);

        let status_trb = pending_control(dev);
        complete(dev, status_trb, 1, 0, &[]).unwrap();
        assert!(dev.is_initialized());
    }

    #[test]
    fn address_device_input_context() {
        init_test_pool();
        let doorbell = fake_doorbell();
        let mut dev = unsafe { Device::new(1, doorbell, 32) }.unwrap();
        let addr = dev.initialize(3, PortSpeed::High).unwrap();
        assert_eq!(addr % 64, 0);

        let input = dev.input_context();
        assert_eq!(input.add_context_flags(), 0b11);
        assert_eq!(input.slot_ctx.root_hub_port_number(), 3);
        assert_eq!(input.slot_ctx.speed(), PortSpeed::High as u8);
        let ep0 = input.endpoint(DeviceContextIndex::from(EndpointId::DEFAULT_CONTROL_PIPE));
        assert_eq!(ep0.max_packet_size(), 64);
        assert_eq!(ep0.endpoint_type(), 4);
        assert_eq!(ep0.dequeue_cycle_state(), 1);
        assert_eq!(ep0.transfer_ring_buffer(), dev.transfer_rings[0].as_ref().unwrap().buffer_addr());
    }

    #[test]
    fn mouse_enumerates_and_reports() {
        init_test_pool();
        let doorbell = fake_doorbell();
        let mut dev = unsafe { Device::new(2, doorbell, 32) }.unwrap();
        dev.initialize(1, PortSpeed::High).unwrap();
        enumerate_mouse(&mut dev);
        assert_eq!(last_doorbell(doorbell), 1);
        match &mut dev.class_drivers_mut()[0] {
            DriverKind::HidMouse(driver) => driver.handler_mut().subscribe(record).unwrap(),
        }

        dev.configure_endpoints().unwrap();
        let ep1_in = DeviceContextIndex::from(EndpointId::from_number_in(1));
        let input = dev.input_context();
        assert_eq!(input.add_context_flags(), 0b1001);
        assert_eq!(input.slot_ctx.context_entries(), 31);
        let ep_ctx = input.endpoint(ep1_in);
        assert_eq!(ep_ctx.endpoint_type(), 7);
        assert_eq!(ep_ctx.interval(), 9);
        assert_eq!(ep_ctx.max_packet_size(), 8);

        dev.on_endpoints_configured().unwrap();
        let status_trb = pending_control(&dev);
        complete(&mut dev, status_trb, 1, 0, &[]).unwrap();
        assert_eq!(last_doorbell(doorbell), 3);
        match &dev.class_drivers[0] {
            DriverKind::HidMouse(driver) => assert_eq!(driver.phase(), HidPhase::Polling),
        }

        let ring_base = dev.transfer_rings[2].as_ref().unwrap().buffer_addr();
        complete(&mut dev, ring_base, 3, 8, &[0x01, 0xFE, 0x02]).unwrap();
        assert!(REPORTS.lock().contains(&(0x01, -2, 2)));

        let rearmed = dev.transfer_rings[2].as_ref().unwrap().trb_at(ring_base + 16).unwrap();
        assert_eq!(rearmed.trb_type(), Normal::TYPE);
        assert_eq!(rearmed.cycle_bit(), 1);
    }

    #[test]
    fn unmatched_events_are_rejected() {
        init_test_pool();
        let mut dev = unsafe { Device::new(3, fake_doorbell(), 32) }.unwrap();
        dev.initialize(1, PortSpeed::Full).unwrap();
        dev.start_initialization().unwrap();

        // the Setup Stage TRB was never registered
        let setup_trb = dev.transfer_rings[0].as_ref().unwrap().buffer_addr();
        let err = complete(&mut dev, setup_trb, 1, 0, &[]).unwrap_err();
        assert_eq!(err, StatusCode::NoCorrespondingSetupStage);

        let err = complete(&mut dev, 0xdead_0000, 1, 0, &[]).unwrap_err();
        assert_eq!(err, StatusCode::NoCorrespondingSetupStage);
    }

    #[test]
    fn failed_control_transfer_is_reported() {
        init_test_pool();
        let mut dev = unsafe { Device::new(4, fake_doorbell(), 32) }.unwrap();
        dev.initialize(1, PortSpeed::High).unwrap();
        dev.start_initialization().unwrap();
        let data_trb = pending_control(&dev);
        let event = transfer_event(data_trb, 4, 1, 6, 18);
        let err = dev.on_transfer_event_received(event.downcast_ref().unwrap()).unwrap_err();
        assert_eq!(err, StatusCode::TransferFailed { slot_id: 4 });
        assert!(dev.setup_stage_map.is_empty());
    }

    #[test]
    fn failed_poll_reaches_the_driver_and_is_not_rearmed() {
        init_test_pool();
        let doorbell = fake_doorbell();
        let mut dev = unsafe { Device::new(6, doorbell, 32) }.unwrap();
        dev.initialize(1, PortSpeed::High).unwrap();
        enumerate_mouse(&mut dev);
        dev.configure_endpoints().unwrap();
        dev.on_endpoints_configured().unwrap();
        let status_trb = pending_control(&dev);
        complete(&mut dev, status_trb, 1, 0, &[]).unwrap();

        let ring_base = dev.transfer_rings[2].as_ref().unwrap().buffer_addr();
        let stall = transfer_event(ring_base, 6, 3, 6, 8);
        let err = dev.on_transfer_event_received(stall.downcast_ref().unwrap()).unwrap_err();
        assert_eq!(err, StatusCode::TransferFailed { slot_id: 6 });
        match &dev.class_drivers[0] {
            DriverKind::HidMouse(driver) => assert_eq!(driver.phase(), HidPhase::Stopped),
        }
        let next = dev.transfer_rings[2].as_ref().unwrap().trb_at(ring_base + 16).unwrap();
        assert_ne!(next.trb_type(), Normal::TYPE);
    }

    #[test]
    fn failed_set_protocol_reaches_the_driver() {
        init_test_pool();
        let mut dev = unsafe { Device::new(7, fake_doorbell(), 32) }.unwrap();
        dev.initialize(1, PortSpeed::High).unwrap();
        enumerate_mouse(&mut dev);
        dev.configure_endpoints().unwrap();
        dev.on_endpoints_configured().unwrap();

        let status_trb = pending_control(&dev);
        let stall = transfer_event(status_trb, 7, 1, 6, 0);
        let err = dev.on_transfer_event_received(stall.downcast_ref().unwrap()).unwrap_err();
        assert_eq!(err, StatusCode::TransferFailed { slot_id: 7 });
        match &dev.class_drivers[0] {
            DriverKind::HidMouse(driver) => assert_eq!(driver.phase(), HidPhase::Stopped),
        }
        assert!(dev.setup_stage_map.is_empty());
        assert!(dev.event_waiters.is_empty());
    }

    #[test]
    fn control_out_with_data_stage() {
        init_test_pool();
        let doorbell = fake_doorbell();
        let mut dev = unsafe { Device::new(5, doorbell, 32) }.unwrap();
        dev.initialize(1, PortSpeed::High).unwrap();
        let setup = SetupData { request_type: 0x21, request: 9, value: 0x0200, index: 0, length: 1 };
        dev.control_out(EndpointId::DEFAULT_CONTROL_PIPE, setup, None, Some(&[0x07])).unwrap();

        let ring = dev.transfer_rings[0].as_ref().unwrap();
        let base = ring.buffer_addr();
        let setup_trb = ring.trb_at(base).unwrap();
        assert_eq!(setup_trb.downcast_ref::<SetupStage>().unwrap().transfer_type(), 2);
        let data_trb = ring.trb_at(base + 16).unwrap();
        let data_stage = data_trb.downcast_ref::<DataStage>().unwrap();
        assert_eq!(data_stage.direction(), 0);
        assert_eq!(unsafe { *(data_stage.data_buffer() as *const u8) }, 0x07);
        assert_eq!(pending_control(&dev), base + 32);
        assert_eq!(last_doorbell(doorbell), 1);
    }
}
