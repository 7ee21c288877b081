// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::SystemTime;

use async_trait::async_trait;
use canonical_error::CanonicalError;

// Standard gravity in m/s².
pub const G: f64 = 9.81;

// Acceleration data from IMU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccelData {
    // m/s².
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelData {
    // Magnitude of the acceleration vector, in g.
    pub fn magnitude_g(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt() / G
    }
}

// Angular velocity data from IMU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GyroData {
    // Degrees/second.
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

// Gyroscope low-pass filter cutoff. The discriminant is the DLPF_CFG field
// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GyroscopeBandwidth {
    Hz256 = 0,
    Hz188 = 1,
    Hz98 = 2,
    Hz42 = 3,
    Hz20 = 4,
    Hz10 = 5,
    Hz5 = 6,
}

// Accelerometer low-pass filter cutoff. The discriminant is the DLPF_CFG field
// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerometerBandwidth {
    Hz260 = 0,
    Hz184 = 1,
    Hz94 = 2,
    Hz44 = 3,
    Hz21 = 4,
    Hz10 = 5,
    Hz5 = 6,
}

impl GyroscopeBandwidth {
    pub fn dlpf_cfg(self) -> u8 {
        self as u8
    }

    pub fn from_dlpf_cfg(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Hz256),
            1 => Some(Self::Hz188),
            2 => Some(Self::Hz98),
            3 => Some(Self::Hz42),
            4 => Some(Self::Hz20),
            5 => Some(Self::Hz10),
            6 => Some(Self::Hz5),
            _ => None,
        }
    }
}

impl AccelerometerBandwidth {
    pub fn dlpf_cfg(self) -> u8 {
        self as u8
    }

    pub fn from_dlpf_cfg(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Hz260),
            1 => Some(Self::Hz184),
            2 => Some(Self::Hz94),
            3 => Some(Self::Hz44),
            4 => Some(Self::Hz21),
            5 => Some(Self::Hz10),
            6 => Some(Self::Hz5),
            _ => None,
        }
    }
}

// Hardware offset register values written by a calibration run, in x, y, z
// order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationOffsets {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
}

/// Blocking interface to an accelerometer/gyroscope device. Implementations
/// release the underlying bus handle when dropped.
pub trait ImuDevice: Send {
    // Returns the gyroscope bandwidth currently configured in the device.
    fn gyroscope_bandwidth(&mut self)
                           -> Result<GyroscopeBandwidth, CanonicalError>;

    fn set_gyroscope_bandwidth(&mut self, bandwidth: GyroscopeBandwidth)
                               -> Result<(), CanonicalError>;

    fn set_accelerometer_bandwidth(&mut self, bandwidth: AccelerometerBandwidth)
                                   -> Result<(), CanonicalError>;

    // Current acceleration in m/s².
    fn get_acceleration(&mut self) -> Result<AccelData, CanonicalError>;

    // Current angular velocity in degrees/second.
    fn get_angular_velocity(&mut self) -> Result<GyroData, CanonicalError>;

    // Computes the bias of both sensors while the device is at rest and level,
    // and writes compensating values into the device's offset registers.
    fn calibrate_gyroscope_accelerometer(&mut self)
                                         -> Result<CalibrationOffsets, CanonicalError>;
}

// Result of comparing an at-rest accelerometer reading against 1g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftReport {
    // |measured magnitude - 1g|, in g.
    pub deviation_g: f64,

    // True if deviation_g exceeds the drift threshold.
    pub exceeded: bool,
}

#[async_trait]
pub trait AccelerometerControl {
    // Reads diagnostic samples, re-asserts the operating bandwidth, and runs
    // the device's calibration routine. Returns failed_precondition error if
    // the device was never opened.
    async fn calibrate(&self) -> Result<(), CanonicalError>;

    // Compares the current accelerometer magnitude against 1g. Returns
    // failed_precondition error if the device was never opened.
    async fn check_drift(&self) -> Result<DriftReport, CanonicalError>;

    // Whether the recalibration interval has elapsed as of `now`.
    fn recalibration_due(&self, now: SystemTime) -> bool;

    fn last_calibration_time(&self) -> SystemTime;
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_bandwidth_encoding() {
        assert_eq!(GyroscopeBandwidth::Hz188.dlpf_cfg(), 1);
        assert_eq!(AccelerometerBandwidth::Hz184.dlpf_cfg(), 1);
        assert_eq!(GyroscopeBandwidth::from_dlpf_cfg(5),
                   Some(GyroscopeBandwidth::Hz10));
        assert_eq!(AccelerometerBandwidth::from_dlpf_cfg(0),
                   Some(AccelerometerBandwidth::Hz260));
        // 7 is reserved.
        assert_eq!(GyroscopeBandwidth::from_dlpf_cfg(7), None);
        assert_eq!(AccelerometerBandwidth::from_dlpf_cfg(7), None);
    }

    #[test]
    fn test_magnitude() {
        let level = AccelData{x: 0.0, y: 0.0, z: G};
        assert_abs_diff_eq!(level.magnitude_g(), 1.0, epsilon = 1e-9);
        let tilted = AccelData{x: 3.0 * G / 5.0, y: 0.0, z: 4.0 * G / 5.0};
        assert_abs_diff_eq!(tilted.magnitude_g(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(AccelData::default().magnitude_g(), 0.0);
    }
}
