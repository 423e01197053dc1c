use log::{trace, warn};
use spin::Mutex;
use crate::{
    fixed_vec::FixedVec,
    make_error,
    status::{Result, StatusCode},
};
use super::hid::{HidBaseDriver, HidReportHandler};

/// Called with the button mask and the X/Y displacement of every report.
pub type MouseObserver = fn(buttons: u8, dx: i8, dy: i8);

const MAX_OBSERVERS: usize = 4;

static DEFAULT_OBSERVER: Mutex<Option<MouseObserver>> = Mutex::new(None);

/// Observer subscribed to every mouse created from now on.
pub fn set_default_observer(observer: MouseObserver) {
    *DEFAULT_OBSERVER.lock() = Some(observer);
}

pub struct HidMouse {
    observers: FixedVec<MouseObserver, MAX_OBSERVERS>,
}

impl HidMouse {
    pub fn new() -> Self {
        let mut mouse = Self {
            observers: FixedVec::new(),
        };
        if let Some(observer) = *DEFAULT_OBSERVER.lock() {
            if mouse.observers.push(observer).is_err() {
                warn!("mouse: no room for the default observer");
            }
        }
        mouse
    }

    pub fn subscribe(&mut self, observer: MouseObserver) -> Result<()> {
        self.observers
            .push(observer)
            .map(|_| ())
            .map_err(|_| make_error!(StatusCode::Full))
    }

    pub fn observers(&self) -> &[MouseObserver] {
        &self.observers
    }
}

impl Default for HidMouse {
    fn default() -> Self {
        Self::new()
    }
}

impl HidReportHandler for HidMouse {
    const IN_PACKET_SIZE: usize = 8;

    fn on_data_received(&mut self, report: &[u8], _previous: &[u8]) -> Result<()> {
        let &[buttons, dx, dy, ..] = report else {
            return Err(make_error!(StatusCode::IndexOutOfRange));
        };
        let (dx, dy) = (dx as i8, dy as i8);
        trace!("mouse: buttons={:#04x} dx={} dy={}", buttons, dx, dy);
        for observer in self.observers.iter() {
            observer(buttons, dx, dy);
        }
        Ok(())
    }
}

pub type HidMouseDriver = HidBaseDriver<HidMouse>;

impl HidBaseDriver<HidMouse> {
    pub fn mouse(interface_index: u8) -> Result<Self> {
        Self::new(interface_index, HidMouse::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SEEN: Mutex<Vec<(u8, i8, i8)>> = Mutex::new(Vec::new());

    fn record(buttons: u8, dx: i8, dy: i8) {
        SEEN.lock().push((buttons, dx, dy));
    }

    fn ignore(_: u8, _: i8, _: i8) {}

    #[test]
    fn report_bytes_become_signed_displacement() {
        let mut mouse = HidMouse { observers: FixedVec::new() };
        mouse.subscribe(record).unwrap();
        mouse.on_data_received(&[0x01, 0xFE, 0x02], &[]).unwrap();
        assert_eq!(SEEN.lock().as_slice(), &[(0x01, -2, 2)]);

        assert_eq!(
            mouse.on_data_received(&[0x01, 0xFE], &[]).unwrap_err(),
            StatusCode::IndexOutOfRange
        );
    }

    #[test]
    fn observer_list_is_bounded() {
        let mut mouse = HidMouse { observers: FixedVec::new() };
        for _ in 0..MAX_OBSERVERS {
            mouse.subscribe(ignore).unwrap();
        }
        assert_eq!(mouse.subscribe(ignore).unwrap_err(), StatusCode::Full);
    }

    #[test]
    fn new_mice_get_the_default_observer() {
        set_default_observer(ignore);
        let mouse = HidMouse::new();
        assert_eq!(mouse.observers().len(), 1);
        assert!(mouse.observers()[0] as usize == ignore as MouseObserver as usize);
    }
}
