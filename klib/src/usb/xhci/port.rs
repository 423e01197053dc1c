use core::convert::TryFrom;
use log::{debug, warn};
use crate::{
    make_error,
    status::{Result, StatusCode},
};
use super::{
    config::SpinLimit,
    registers::{PortRegisterSet, PortSc},
    speed::PortSpeed,
};

/// One root hub port. Port numbers are 1-based.
pub struct Port {
    port_num: u8,
    regs: *mut PortRegisterSet,
}

impl Port {
    /// # Safety
    /// `regs` must point at the register set of port `port_num` and stay mapped.
    pub unsafe fn new(port_num: u8, regs: *mut PortRegisterSet) -> Self {
        Self { port_num, regs }
    }

    pub fn number(&self) -> u8 {
        self.port_num
    }

    fn portsc(&self) -> PortSc {
        unsafe { (*self.regs).portsc.read() }
    }

    fn write_portsc(&self, portsc: PortSc) {
        unsafe { (*self.regs).portsc.write(portsc) }
    }

    pub fn bits(&self) -> u32 {
        self.portsc().bits()
    }

    pub fn is_connected(&self) -> bool {
        self.portsc().current_connect_status() == 1
    }

    pub fn is_enabled(&self) -> bool {
        self.portsc().port_enabled_disabled() == 1
    }

    pub fn is_connect_status_changed(&self) -> bool {
        self.portsc().connect_status_change() == 1
    }

    pub fn is_port_reset_changed(&self) -> bool {
        self.portsc().port_reset_change() == 1
    }

    pub fn speed(&self) -> Result<PortSpeed> {
        PortSpeed::try_from(self.portsc().port_speed())
    }

    /// Starts a port reset and spins until the controller clears PR.
    pub fn reset(&self, limit: SpinLimit) -> Result<()> {
        let mut portsc = self.portsc();
        portsc.prepare_reset();
        self.write_portsc(portsc);
        limit.wait_until(|| self.portsc().port_reset() == 0)
    }

    pub fn clear_connect_status_change(&self) {
        let mut portsc = self.portsc();
        portsc.prepare_clear_connect_status_change();
        self.write_portsc(portsc);
    }

    pub fn clear_port_reset_change(&self) {
        let mut portsc = self.portsc();
        portsc.prepare_clear_port_reset_change();
        self.write_portsc(portsc);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortConfigPhase {
    NotConnected,
    WaitingAddressed,
    ResettingPort,
    EnablingSlot,
    AddressingDevice,
    InitializingDevice,
    ConfiguringEndpoints,
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The port holds the addressing gate and may be reset now.
    Acquired,
    /// Another port is being addressed; this one waits its turn.
    Deferred,
}

/// Bring-up phase of every port, plus the single "port being addressed" gate.
///
/// Only one port may be between `ResettingPort` and `AddressingDevice` at a time.
pub struct PortPhases {
    phases: [PortConfigPhase; 256],
    addressing_port: Option<u8>,
}

impl PortPhases {
    pub const fn new() -> Self {
        Self {
            phases: [PortConfigPhase::NotConnected; 256],
            addressing_port: None,
        }
    }

    pub fn phase(&self, port: u8) -> PortConfigPhase {
        self.phases[port as usize]
    }

    pub fn set(&mut self, port: u8, phase: PortConfigPhase) {
        debug!("port {}: {:?} -> {:?}", port, self.phases[port as usize], phase);
        self.phases[port as usize] = phase;
    }

    pub fn addressing_port(&self) -> Option<u8> {
        self.addressing_port
    }

    pub fn expect(&self, port: u8, phase: PortConfigPhase) -> Result<()> {
        if self.phase(port) == phase {
            Ok(())
        } else {
            warn!("port {}: expected {:?}, found {:?}", port, phase, self.phase(port));
            Err(make_error!(StatusCode::InvalidPhase))
        }
    }

    pub fn advance(&mut self, port: u8, from: PortConfigPhase, to: PortConfigPhase) -> Result<()> {
        self.expect(port, from)?;
        self.set(port, to);
        Ok(())
    }

    /// Takes the addressing gate for `port` if nobody holds it; otherwise
    /// parks the port in `WaitingAddressed`.
    pub fn acquire_gate(&mut self, port: u8) -> Result<GateDecision> {
        let phase = self.phase(port);
        if phase != PortConfigPhase::NotConnected && phase != PortConfigPhase::WaitingAddressed {
            warn!("port {}: cannot start bring-up from {:?}", port, phase);
            return Err(make_error!(StatusCode::InvalidPhase));
        }
        match self.addressing_port {
            Some(holder) if holder != port => {
                self.set(port, PortConfigPhase::WaitingAddressed);
                Ok(GateDecision::Deferred)
            }
            _ => {
                self.addressing_port = Some(port);
                self.set(port, PortConfigPhase::ResettingPort);
                Ok(GateDecision::Acquired)
            }
        }
    }

    /// Gives the gate up if `port` holds it.
    pub fn release_gate(&mut self, port: u8) {
        if self.addressing_port == Some(port) {
            self.addressing_port = None;
        }
    }

    /// Lowest-numbered port waiting for the gate.
    pub fn first_waiting(&self) -> Option<u8> {
        self.phases
            .iter()
            .position(|&p| p == PortConfigPhase::WaitingAddressed)
            .map(|i| i as u8)
    }

    /// Puts `port` back to `NotConnected`, releasing the gate if it held it.
    pub fn abandon(&mut self, port: u8) {
        self.set(port, PortConfigPhase::NotConnected);
        self.release_gate(port);
    }
}

impl Default for PortPhases {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts bring-up of `port`: a no-op when nothing is connected, a deferral
/// when another port holds the addressing gate, otherwise a port reset.
pub fn reset_port(port: &Port, phases: &mut PortPhases, limit: SpinLimit) -> Result<()> {
    let port_num = port.number();
    if !port.is_connected() {
        if phases.phase(port_num) == PortConfigPhase::WaitingAddressed {
            phases.set(port_num, PortConfigPhase::NotConnected);
        }
        return Ok(());
    }

    match phases.acquire_gate(port_num)? {
        GateDecision::Deferred => Ok(()),
        GateDecision::Acquired => port.reset(limit).map_err(|e| {
            warn!("port {}: reset did not complete: {}", port_num, e);
            phases.abandon(port_num);
            e
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_port(num: u8, portsc: u32) -> (Port, *mut u32) {
        let regs: *mut PortRegisterSet = Box::into_raw(Box::new(unsafe { core::mem::zeroed() }));
        let raw = regs as *mut u32;
        unsafe { raw.write_volatile(portsc) };
        (unsafe { Port::new(num, regs) }, raw)
    }

    #[test]
    fn second_port_waits_for_the_gate() {
        let mut phases = PortPhases::new();
        assert_eq!(phases.acquire_gate(1).unwrap(), GateDecision::Acquired);
        assert_eq!(phases.phase(1), PortConfigPhase::ResettingPort);

        assert_eq!(phases.acquire_gate(2).unwrap(), GateDecision::Deferred);
        assert_eq!(phases.phase(2), PortConfigPhase::WaitingAddressed);
        assert_eq!(phases.addressing_port(), Some(1));

        phases.release_gate(2);
        assert_eq!(phases.addressing_port(), Some(1));
        phases.release_gate(1);
        assert_eq!(phases.addressing_port(), None);
        assert_eq!(phases.first_waiting(), Some(2));
        assert_eq!(phases.acquire_gate(2).unwrap(), GateDecision::Acquired);
        assert_eq!(phases.first_waiting(), None);
    }

    #[test]
    fn out_of_phase_transitions_are_rejected() {
        let mut phases = PortPhases::new();
        phases.acquire_gate(3).unwrap();
        assert_eq!(phases.acquire_gate(3).unwrap_err(), StatusCode::InvalidPhase);
        assert_eq!(
            phases
                .advance(3, PortConfigPhase::EnablingSlot, PortConfigPhase::AddressingDevice)
                .unwrap_err(),
            StatusCode::InvalidPhase
        );
        phases
            .advance(3, PortConfigPhase::ResettingPort, PortConfigPhase::EnablingSlot)
            .unwrap();
    }

    #[test]
    fn reset_of_disconnected_port_is_a_no_op() {
        let (port, raw) = fake_port(1, 0x0000_0200);
        let mut phases = PortPhases::new();
        reset_port(&port, &mut phases, SpinLimit::polls(10)).unwrap();
        assert_eq!(unsafe { raw.read_volatile() }, 0x0000_0200);
        assert_eq!(phases.phase(1), PortConfigPhase::NotConnected);
        assert_eq!(phases.addressing_port(), None);
    }

    #[test]
    fn stuck_reset_times_out_and_frees_the_gate() {
        // PR never clears in plain memory
        let (port, raw) = fake_port(4, 0x0002_0201);
        let mut phases = PortPhases::new();
        let err = reset_port(&port, &mut phases, SpinLimit::polls(10)).unwrap_err();
        assert_eq!(err, StatusCode::HardwareTimeout);
        assert_eq!(unsafe { raw.read_volatile() } & 0x10, 0x10);
        assert_eq!(phases.phase(4), PortConfigPhase::NotConnected);
        assert_eq!(phases.addressing_port(), None);
    }

    #[test]
    fn port_reports_speed_and_changes() {
        let (port, _) = fake_port(2, 0x0022_0C03);
        assert!(port.is_connected() && port.is_enabled());
        assert!(port.is_connect_status_changed() && port.is_port_reset_changed());
        assert_eq!(port.speed().unwrap(), PortSpeed::High);
    }
}
