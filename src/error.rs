//! USB driver error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// Errors surfaced by the driver core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// A bounded busy-wait on a hardware acknowledgement bit expired
    ControllerUnresponsive,
    /// A descriptor pool has no free elements
    NoResources,
    /// Invalid parameter (endpoint number, address, packet size, ...)
    InvalidParameter,
    /// Operation attempted in a state that does not permit it
    InvalidState,
    /// A descriptor failed validation
    InvalidDescriptor,
    /// Endpoint halted by the far end
    Stall,
    /// Transaction error reported by the controller (CRC, timeout, babble)
    TransactionError,
    /// Operation not supported by this driver
    Unsupported,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControllerUnresponsive => write!(f, "Controller unresponsive"),
            Self::NoResources => write!(f, "No resources"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::InvalidDescriptor => write!(f, "Invalid descriptor"),
            Self::Stall => write!(f, "Stall"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::Unsupported => write!(f, "Unsupported"),
        }
    }
}

impl UsbError {
    /// Check if the error may clear once resources are released
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::NoResources)
    }

    /// Check if the error indicates the hardware itself misbehaved
    pub fn is_hardware_fault(&self) -> bool {
        matches!(self, Self::ControllerUnresponsive | Self::TransactionError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert!(UsbError::NoResources.is_resource_exhaustion());
        assert!(UsbError::ControllerUnresponsive.is_hardware_fault());
        assert!(!UsbError::Stall.is_hardware_fault());
    }
}
