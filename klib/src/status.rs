use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Full,
    NoEnoughMemory,
    IndexOutOfRange,
    InvalidSlotId,
    InvalidEndpointNumber,
    InvalidEndpointType { ty: u8 },
    TransferRingNotSet,
    AlreadyAllocated,
    NotImplemented,
    InvalidDescriptor,
    UnsupportedInterface,
    NoCorrespondingSetupStage,
    TransferFailed { slot_id: u8 },
    CommandCompletionFailed { slot_id: u8 },
    InvalidPhase,
    UnknownXHCISpeedID,
    NoWaiter,
    NoPCIMSI,
    HardwareTimeout,
}

impl StatusCode {
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Full => "Full",
            StatusCode::NoEnoughMemory => "NoEnoughMemory",
            StatusCode::IndexOutOfRange => "IndexOutOfRange",
            StatusCode::InvalidSlotId => "InvalidSlotID",
            StatusCode::InvalidEndpointNumber => "InvalidEndpointNumber",
            StatusCode::InvalidEndpointType { .. } => "InvalidEndpointType",
            StatusCode::TransferRingNotSet => "TransferRingNotSet",
            StatusCode::AlreadyAllocated => "AlreadyAllocated",
            StatusCode::NotImplemented => "NotImplemented",
            StatusCode::InvalidDescriptor => "InvalidDescriptor",
            StatusCode::UnsupportedInterface => "UnsupportedInterface",
            StatusCode::NoCorrespondingSetupStage => "NoCorrespondingSetupStage",
            StatusCode::TransferFailed { .. } => "TransferFailed",
            StatusCode::CommandCompletionFailed { .. } => "CommandCompletionFailed",
            StatusCode::InvalidPhase => "InvalidPhase",
            StatusCode::UnknownXHCISpeedID => "UnknownXHCISpeedID",
            StatusCode::NoWaiter => "NoWaiter",
            StatusCode::NoPCIMSI => "NoPCIMSI",
            StatusCode::HardwareTimeout => "HardwareTimeout",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::InvalidEndpointType { ty } => write!(f, "{} (type {})", self.name(), ty),
            StatusCode::TransferFailed { slot_id }
            | StatusCode::CommandCompletionFailed { slot_id } => {
                write!(f, "{} (slot {})", self.name(), slot_id)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// A `StatusCode` tagged with the place it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    code: StatusCode,
    file: &'static str,
    line: u32,
}

impl Error {
    pub const fn new(code: StatusCode, file: &'static str, line: u32) -> Self {
        Self { code, file, line }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl PartialEq<StatusCode> for Error {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.code, self.file, self.line)
    }
}

#[macro_export]
macro_rules! make_error {
    ($code:expr) => {
        $crate::status::Error::new($code, file!(), line!())
    };
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_records_where_it_was_made() {
        let line = line!() + 1;
        let e = make_error!(StatusCode::InvalidPhase);
        assert_eq!(e, StatusCode::InvalidPhase);
        assert_eq!(e.line(), line);
        assert!(e.file().ends_with("status.rs"));
    }

    #[test]
    fn display_includes_slot_for_transfer_failures() {
        let e = Error::new(StatusCode::TransferFailed { slot_id: 3 }, "devmgr.rs", 10);
        assert_eq!(e.to_string(), "TransferFailed (slot 3) at devmgr.rs:10");
        assert_eq!(StatusCode::InvalidSlotId.to_string(), "InvalidSlotID");
    }
}
