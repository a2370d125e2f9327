//! LE Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module manages LE PSM values for credit based connections.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

const LE_PSM_FIXED_MIN: u16 = 0x0001;
const LE_PSM_FIXED_MAX: u16 = 0x007F;
const LE_PSM_DYNAMIC_MIN: u16 = 0x0080;
const LE_PSM_DYNAMIC_MAX: u16 = 0x00FF;

/// LE Protocol/Service Multiplexer values used in L2CAP.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.22.
/// And assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum PSM {
    /// Internet Protocol Support Profile
    IPSP,
    /// Object Transfer Service
    OTS,
    /// Enhanced Attribute Protocol
    EATT,
    /// Any other SIG assigned SPSM
    Fixed(u16),
    /// Dynamically assigned LE PSM
    Dynamic(u16),
}

impl PSM {
    /// Check if the PSM is valid
    pub fn is_valid(&self) -> bool {
        match self {
            PSM::Fixed(value) => (LE_PSM_FIXED_MIN..=LE_PSM_FIXED_MAX).contains(value),
            PSM::Dynamic(value) => (LE_PSM_DYNAMIC_MIN..=LE_PSM_DYNAMIC_MAX).contains(value),
            _ => true,
        }
    }

    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            PSM::IPSP => 0x0023,
            PSM::OTS => 0x0025,
            PSM::EATT => 0x0027,
            PSM::Fixed(value) | PSM::Dynamic(value) => *value,
        }
    }

    /// Try to create a PSM from a u16 value
    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            0x0023 => Some(PSM::IPSP),
            0x0025 => Some(PSM::OTS),
            0x0027 => Some(PSM::EATT),
            LE_PSM_FIXED_MIN..=LE_PSM_FIXED_MAX => Some(PSM::Fixed(value)),
            LE_PSM_DYNAMIC_MIN..=LE_PSM_DYNAMIC_MAX => Some(PSM::Dynamic(value)),
            _ => None,
        }
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PSM::IPSP => write!(f, "IPSP (0x0023)"),
            PSM::OTS => write!(f, "OTS (0x0025)"),
            PSM::EATT => write!(f, "EATT (0x0027)"),
            PSM::Fixed(value) => write!(f, "SPSM (0x{:04X})", value),
            PSM::Dynamic(value) => write!(f, "Dynamic PSM (0x{:04X})", value),
        }
    }
}

// Counter for dynamic PSM allocation
static NEXT_DYNAMIC_PSM: AtomicU16 = AtomicU16::new(LE_PSM_DYNAMIC_MIN);

/// Obtain a new dynamic LE PSM value
///
/// Values cycle through 0x0080-0x00FF; the registration table rejects a
/// value that is still registered.
pub fn obtain_dynamic_psm() -> PSM {
    let offset = NEXT_DYNAMIC_PSM.fetch_add(1, Ordering::SeqCst);
    let span = LE_PSM_DYNAMIC_MAX - LE_PSM_DYNAMIC_MIN + 1;
    PSM::Dynamic(LE_PSM_DYNAMIC_MIN + (offset.wrapping_sub(LE_PSM_DYNAMIC_MIN) % span))
}
