// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

pub const DEFAULT_BUS_ID: u8 = 1;

// Largest 7-bit I2C address.
const MAX_I2C_ADDRESS: u16 = 0x7F;

// Where to find the sensor and how often it should be recalibrated. Fixed for
// the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    // 7-bit I2C address.
    pub address: u16,

    // Selects /dev/i2c-<bus_id>.
    pub bus_id: u8,

    pub recalibration_interval_minutes: u32,
}

impl DeviceConfig {
    pub fn new(address: u16, bus_id: u8, recalibration_interval_minutes: u32)
               -> Result<Self, CanonicalError> {
        if address > MAX_I2C_ADDRESS {
            return Err(invalid_argument_error(
                &format!("I2C address 0x{:02X} is not a 7-bit address", address)));
        }
        Ok(DeviceConfig{address, bus_id, recalibration_interval_minutes})
    }

    pub fn recalibration_interval(&self) -> Duration {
        Duration::from_secs(60 * self.recalibration_interval_minutes as u64)
    }
}

// Accepts either decimal ("104") or hex ("0x68") notation.
pub fn parse_address(arg: &str) -> Result<u16, String> {
    let trimmed = arg.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse::<u16>(),
    };
    let address = parsed.map_err(|e| format!("invalid I2C address {:?}: {}", arg, e))?;
    if address > MAX_I2C_ADDRESS {
        return Err(format!("I2C address {:?} is not a 7-bit address", arg));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use canonical_error::CanonicalErrorCode;
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x68"), Ok(0x68));
        assert_eq!(parse_address("0X69"), Ok(0x69));
        assert_eq!(parse_address("104"), Ok(104));
        assert_eq!(parse_address(" 0x7f "), Ok(0x7F));
        assert!(parse_address("0x80").is_err());
        assert!(parse_address("200").is_err());
        assert!(parse_address("0xZZ").is_err());
        assert!(parse_address("").is_err());
        assert!(parse_address("-1").is_err());
    }

    #[test]
    fn test_device_config() {
        let config = DeviceConfig::new(0x68, DEFAULT_BUS_ID, 15).unwrap();
        assert_eq!(config.bus_id, 1);
        assert_eq!(config.recalibration_interval(), Duration::from_secs(900));

        let err = DeviceConfig::new(0x80, 1, 15).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::InvalidArgument));
    }
}
