#![cfg_attr(not(test), no_std)]

pub mod bit_macros;
pub mod fixed_vec;
pub mod queue;
pub mod status;
pub mod usb;
pub mod volatile;

pub use status::{Error, Result, StatusCode};
