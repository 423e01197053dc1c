use core::convert::TryFrom;
use crate::{make_error, status::StatusCode, Error};

/// Protocol speed ID as reported in PORTSC with the default mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortSpeed {
    Full = 1,
    Low = 2,
    High = 3,
    Super = 4,
    SuperSpeedPlus = 5,
}

impl PortSpeed {
    /// Full-speed devices may use 8, 16, 32 or 64; 8 is always safe for the first descriptor read.
    pub fn determine_max_packet_size_for_control_pipe(&self) -> u16 {
        match self {
            Self::SuperSpeedPlus | Self::Super => 512,
            Self::High => 64,
            Self::Full | Self::Low => 8,
        }
    }

    /// Full- and low-speed endpoints express intervals in frames.
    pub fn uses_frame_intervals(&self) -> bool {
        matches!(self, Self::Full | Self::Low)
    }
}

impl TryFrom<u8> for PortSpeed {
    type Error = Error;

    fn try_from(speed: u8) -> Result<Self, Error> {
        match speed {
            1 => Ok(Self::Full),
            2 => Ok(Self::Low),
            3 => Ok(Self::High),
            4 => Ok(Self::Super),
            5 => Ok(Self::SuperSpeedPlus),
            _ => Err(make_error!(StatusCode::UnknownXHCISpeedID)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_speed_is_an_error() {
        assert_eq!(PortSpeed::try_from(3).unwrap(), PortSpeed::High);
        assert_eq!(PortSpeed::try_from(0).unwrap_err(), StatusCode::UnknownXHCISpeedID);
        assert_eq!(PortSpeed::try_from(9).unwrap_err(), StatusCode::UnknownXHCISpeedID);
        assert_eq!(PortSpeed::Super.determine_max_packet_size_for_control_pipe(), 512);
    }
}
