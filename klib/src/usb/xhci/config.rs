use core::panic::Location;
use crate::status::{Error, Result, StatusCode};

/// Upper bound on polls of a hardware status bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinLimit(Option<u32>);

impl SpinLimit {
    pub const DEFAULT_POLLS: u32 = 10_000_000;

    pub const fn polls(n: u32) -> Self {
        Self(Some(n))
    }

    /// Spins until the condition holds, however long that takes.
    pub const fn unbounded() -> Self {
        Self(None)
    }

    /// Polls `cond` until it returns true, failing with `HardwareTimeout`
    /// reported at the caller's location once the limit is used up.
    #[track_caller]
    pub fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) -> Result<()> {
        let mut remaining = self.0;
        loop {
            if cond() {
                return Ok(());
            }
            match remaining.as_mut() {
                Some(0) => {
                    let caller = Location::caller();
                    return Err(Error::new(StatusCode::HardwareTimeout, caller.file(), caller.line()));
                }
                Some(n) => *n -= 1,
                None => {}
            }
            core::hint::spin_loop();
        }
    }
}

impl Default for SpinLimit {
    fn default() -> Self {
        Self::polls(Self::DEFAULT_POLLS)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct XhciConfig {
    pub max_slots: u8,
    pub command_ring_size: usize,
    pub event_ring_size: usize,
    pub transfer_ring_size: usize,
    pub spin_limit: SpinLimit,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            command_ring_size: 32,
            event_ring_size: 32,
            transfer_ring_size: 32,
            spin_limit: SpinLimit::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_wait_times_out_at_caller() {
        let mut polls = 0;
        let err = SpinLimit::polls(5)
            .wait_until(|| {
                polls += 1;
                false
            })
            .unwrap_err();
        assert_eq!(err, StatusCode::HardwareTimeout);
        assert_eq!(polls, 6);
        assert!(err.file().ends_with("config.rs"));
    }

    #[test]
    fn unbounded_wait_returns_once_ready() {
        let mut polls = 0;
        SpinLimit::unbounded()
            .wait_until(|| {
                polls += 1;
                polls == 1000
            })
            .unwrap();
        assert_eq!(polls, 1000);
    }
}
