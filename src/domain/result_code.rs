//! Integer result codes returned by session operations
//!
//! The numeric layout is a compatibility contract with existing consumers:
//!
//! ```text
//! bits 0-2 : code   (Success=0, DeviceNotFound=1, AlreadyPaired=2,
//!                    PairSuccess=3, GattFailure=4, Unknown=5)
//! bits 3.. : raw platform status, only meaningful when code == Unknown
//! ```
//!
//! A consumer recovers the platform status with `value >> 3` whenever
//! `value & 0b111 == 5`.

/// Width of the code field
pub const CODE_BITS: u32 = 3;
/// Mask selecting the code field
pub const CODE_MASK: i32 = (1 << CODE_BITS) - 1;

const SUCCESS: i32 = 0;
const DEVICE_NOT_FOUND: i32 = 1;
const ALREADY_PAIRED: i32 = 2;
const PAIR_SUCCESS: i32 = 3;
const GATT_FAILURE: i32 = 4;
const UNKNOWN: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    DeviceNotFound,
    AlreadyPaired,
    PairSuccess,
    GattFailure,
    /// Carries the raw platform status that could not be classified
    Unknown(i32),
}

impl ResultCode {
    /// Encode to the wire value
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Success => SUCCESS,
            Self::DeviceNotFound => DEVICE_NOT_FOUND,
            Self::AlreadyPaired => ALREADY_PAIRED,
            Self::PairSuccess => PAIR_SUCCESS,
            Self::GattFailure => GATT_FAILURE,
            Self::Unknown(status) => UNKNOWN | (status << CODE_BITS),
        }
    }

    /// Decode a wire value. Returns `None` for codes outside the defined space.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw & CODE_MASK {
            SUCCESS if raw == SUCCESS => Some(Self::Success),
            DEVICE_NOT_FOUND if raw == DEVICE_NOT_FOUND => Some(Self::DeviceNotFound),
            ALREADY_PAIRED if raw == ALREADY_PAIRED => Some(Self::AlreadyPaired),
            PAIR_SUCCESS if raw == PAIR_SUCCESS => Some(Self::PairSuccess),
            GATT_FAILURE if raw == GATT_FAILURE => Some(Self::GattFailure),
            UNKNOWN => Some(Self::Unknown(raw >> CODE_BITS)),
            _ => None,
        }
    }

    /// The packed platform status, if this is an `Unknown` result
    pub fn platform_status(self) -> Option<i32> {
        match self {
            Self::Unknown(status) => Some(status),
            _ => None,
        }
    }

    /// Whether the operation left the device in the state the caller asked for
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            Self::Success | Self::PairSuccess | Self::AlreadyPaired
        )
    }
}

impl From<ResultCode> for i32 {
    fn from(code: ResultCode) -> Self {
        code.to_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_code_values() {
        assert_eq!(ResultCode::Success.to_raw(), 0);
        assert_eq!(ResultCode::DeviceNotFound.to_raw(), 1);
        assert_eq!(ResultCode::AlreadyPaired.to_raw(), 2);
        assert_eq!(ResultCode::PairSuccess.to_raw(), 3);
        assert_eq!(ResultCode::GattFailure.to_raw(), 4);
        assert_eq!(ResultCode::Unknown(0).to_raw(), 5);
    }

    #[test]
    fn test_unknown_packs_platform_status() {
        let raw = ResultCode::Unknown(19).to_raw();
        assert_eq!(raw, 5 | (19 << 3));
        assert_eq!(raw & CODE_MASK, 5);
        assert_eq!(raw >> 3, 19);
        assert_eq!(ResultCode::from_raw(raw), Some(ResultCode::Unknown(19)));
    }

    #[test]
    fn test_from_raw_rejects_undefined_codes() {
        assert_eq!(ResultCode::from_raw(6), None);
        assert_eq!(ResultCode::from_raw(7), None);
        // high bits are only defined for Unknown
        assert_eq!(ResultCode::from_raw(3 | (1 << 3)), None);
    }
}
