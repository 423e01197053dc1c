//! QEMU debug console output (port 0xE9).
//!
//! Use `-debugcon stdio` or `-debugcon file:debug.log` when running QEMU.

use x86_64::instructions::port::PortWriteOnly;

const DEBUGCON_PORT: u16 = 0xE9;

pub fn write_str(s: &str) {
    let mut port = PortWriteOnly::<u8>::new(DEBUGCON_PORT);
    for byte in s.bytes() {
        unsafe { port.write(byte) };
    }
}

/// Writer struct for core::fmt::Write implementation
pub struct DebugconWriter;

impl core::fmt::Write for DebugconWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        write_str(s);
        Ok(())
    }
}
