use log::{debug, info};
use spin::Mutex;

const LEFT_BUTTON: u8 = 0x01;

/// Cursor position on the screen and the state of the left button.
pub struct MouseCursor {
    position: (usize, usize),
    limit: (usize, usize),
    drag_origin: Option<(usize, usize)>,
}

pub static MOUSE_CURSOR: Mutex<MouseCursor> = Mutex::new(MouseCursor::new());

impl MouseCursor {
    pub const fn new() -> Self {
        Self {
            position: (0, 0),
            limit: (0, 0),
            drag_origin: None,
        }
    }

    /// Confines the cursor to a `width` x `height` screen and centers it.
    pub fn set_screen(&mut self, resolution: (usize, usize)) {
        self.limit = (resolution.0.saturating_sub(1), resolution.1.saturating_sub(1));
        self.position = (resolution.0 / 2, resolution.1 / 2);
    }

    pub fn pos(&self) -> (usize, usize) {
        self.position
    }

    pub fn move_relative(&mut self, dx: i8, dy: i8) {
        self.position = (
            clamp_add(self.position.0, dx, self.limit.0),
            clamp_add(self.position.1, dy, self.limit.1),
        );
    }

    fn on_buttons(&mut self, buttons: u8) {
        let pressed = buttons & LEFT_BUTTON != 0;
        match (self.drag_origin, pressed) {
            (None, true) => {
                debug!("mouse: left button down at {:?}", self.position);
                self.drag_origin = Some(self.position);
            }
            (Some(origin), true) if origin != self.position => {
                debug!("mouse: dragging from {:?} to {:?}", origin, self.position);
            }
            (Some(origin), false) => {
                info!("mouse: left button up, moved {:?} -> {:?}", origin, self.position);
                self.drag_origin = None;
            }
            _ => {}
        }
    }
}

impl Default for MouseCursor {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_add(pos: usize, delta: i8, limit: usize) -> usize {
    let moved = pos as isize + delta as isize;
    moved.clamp(0, limit as isize) as usize
}

/// Observer subscribed to every HID mouse.
pub fn on_mouse_report(buttons: u8, dx: i8, dy: i8) {
    let mut cursor = MOUSE_CURSOR.lock();
    cursor.move_relative(dx, dy);
    cursor.on_buttons(buttons);
}
