// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, info};
use rppal::i2c::I2c;

use crate::imu_trait::{AccelData, AccelerometerBandwidth, CalibrationOffsets,
                       G, GyroData, GyroscopeBandwidth, ImuDevice};

// MPU-6050 constants.
const WHO_AM_I_REG: u8 = 0x75;
const PWR_MGMT_1_REG: u8 = 0x6B;
const SMPLRT_DIV: u8 = 0x19;
const CONFIG: u8 = 0x1A;
const GYRO_CONFIG: u8 = 0x1B;
const ACCEL_CONFIG: u8 = 0x1C;
const EXPECTED_WHO_AM_I: u8 = 0x68;

// Low 3 bits of CONFIG. The MPU-6050 has one filter shared by the
// accelerometer and gyroscope.
const DLPF_CFG_MASK: u8 = 0x07;

// Data register addresses (starting addresses for consecutive reads).
const ACCEL_XOUT_H: u8 = 0x3B;  // 6 bytes: X_H, X_L, Y_H, Y_L, Z_H, Z_L
const GYRO_XOUT_H: u8 = 0x43;   // 6 bytes: X_H, X_L, Y_H, Y_L, Z_H, Z_L

// Offset register addresses, same layout as the data registers.
const XA_OFFS_H: u8 = 0x06;
const XG_OFFS_USRH: u8 = 0x13;

// Scale factors for converting raw values to physical units.
const ACCEL_SCALE_FACTOR: f64 = 16384.0;  // For ±2g range.
const GYRO_SCALE_FACTOR: f64 = 131.0;  // For ±250°/s range.

// Offset registers are in ±16g units (2048 LSB/g) and ±1000°/s units
// (32.8 LSB/°/s); ratio to our configured ranges.
const ACCEL_OFFSET_DIVISOR: f64 = 8.0;
const GYRO_OFFSET_DIVISOR: f64 = 4.0;

const CALIBRATION_WARMUP_SAMPLES: usize = 20;
const CALIBRATION_SAMPLES: usize = 200;
const CALIBRATION_SAMPLE_DELAY: Duration = Duration::from_millis(2);

pub struct Mpu6050 {
    i2c: I2c,
    bus: u8,
    address: u16,
}

/// Low level interface to an MPU-6050 on a Linux I2C bus. Provides bandwidth
/// configuration, raw-scaled readings, and the hardware offset calibration
/// routine. The bus handle is closed when this is dropped.
impl Mpu6050 {
    /// Opens the MPU-6050 at `address` on `/dev/i2c-<bus>`; returns error if
    /// device presence could not be verified.
    pub fn open(bus: u8, address: u16) -> Result<Self, CanonicalError> {
        let mut i2c = I2c::with_bus(bus)
            .map_err(|e| unavailable_error(
                &format!("Failed to open I2C bus {}: {:?}", bus, e)))?;
        i2c.set_slave_address(address)
            .map_err(|e| invalid_argument_error(
                &format!("Failed to set I2C slave address 0x{:02X}: {:?}",
                         address, e)))?;

        let mut mpu = Mpu6050 { i2c, bus, address };

        // Test communication and verify device
        mpu.verify_device()?;

        // Wake up the device (it starts in sleep mode)
        mpu.wake_up()?;

        info!("MPU-6050 initialized with I2C address 0x{:02X} on bus {}.",
              address, bus);

        Ok(mpu)
    }

    /// Verify this is actually an MPU-6050.
    fn verify_device(&mut self) -> Result<(), CanonicalError> {
        let who_am_i = self.read_register(WHO_AM_I_REG)?;

        if who_am_i == EXPECTED_WHO_AM_I {
            info!("Device verified: MPU-6050 (WHO_AM_I: 0x{:02X})", who_am_i);
            Ok(())
        } else {
            Err(failed_precondition_error(
                &format!("Wrong device ID: expected 0x{:02X}, got 0x{:02X}",
                         EXPECTED_WHO_AM_I, who_am_i)))
        }
    }

    /// Wake up the device from sleep mode and set full scale ranges. The
    /// filter bandwidth is left to the bandwidth setters.
    fn wake_up(&mut self) -> Result<(), CanonicalError> {
        // Perform device reset first for clean state.
        self.write_register(PWR_MGMT_1_REG, 0x80)?;
        thread::sleep(Duration::from_millis(100));

        // Wake up the device (clock source = X gyro).
        self.write_register(PWR_MGMT_1_REG, 0x01)?;
        thread::sleep(Duration::from_millis(10));

        // Sample rate divider 0: 1kHz with the filter enabled.
        self.write_register(SMPLRT_DIV, 0)?;

        // ±250°/s gyro, ±2g accel (defaults, but explicit).
        self.write_register(GYRO_CONFIG, 0)?;
        self.write_register(ACCEL_CONFIG, 0)?;

        info!("Device configured: ±250°/s gyro, ±2g accel");
        Ok(())
    }

    /// Read a single register.
    fn read_register(&mut self, register: u8) -> Result<u8, CanonicalError> {
        let mut buffer = [0u8; 1];
        self.i2c.write_read(&[register], &mut buffer)
            .map_err(|e| internal_error(
                &format!("Failed to read register 0x{:02X}: {:?}", register, e)))?;
        Ok(buffer[0])
    }

    /// Write to a single register.
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), CanonicalError> {
        self.i2c.write(&[register, value])
            .map_err(|e| internal_error(
                &format!("Failed to write register 0x{:02X}: {:?}", register, e)))?;
        Ok(())
    }

    /// Read all 6 bytes of XYZ data in a single I2C transaction.
    fn read_xyz_data(&mut self, start_reg: u8) -> Result<[i16; 3], CanonicalError> {
        let mut buffer = [0u8; 6];
        self.i2c.write_read(&[start_reg], &mut buffer)
            .map_err(|e| internal_error(
                &format!("Failed to read XYZ data: {:?}", e)))?;
        Ok(decode_xyz(&buffer))
    }

    /// Write 3 consecutive big-endian 16-bit values.
    fn write_xyz_data(&mut self, start_reg: u8, values: &[i16; 3])
                      -> Result<(), CanonicalError> {
        let mut buffer = [0u8; 7];
        buffer[0] = start_reg;
        for (i, value) in values.iter().enumerate() {
            let bytes = value.to_be_bytes();
            buffer[1 + 2 * i] = bytes[0];
            buffer[2 + 2 * i] = bytes[1];
        }
        self.i2c.write(&buffer)
            .map_err(|e| internal_error(
                &format!("Failed to write XYZ data: {:?}", e)))?;
        Ok(())
    }

    fn set_dlpf_cfg(&mut self, dlpf_cfg: u8) -> Result<(), CanonicalError> {
        let config = self.read_register(CONFIG)?;
        self.write_register(CONFIG, merge_dlpf_cfg(config, dlpf_cfg))
    }

    // Averages raw accelerometer and gyroscope samples.
    fn collect_means(&mut self) -> Result<([f64; 3], [f64; 3]), CanonicalError> {
        for _ in 0..CALIBRATION_WARMUP_SAMPLES {
            self.read_xyz_data(ACCEL_XOUT_H)?;
            self.read_xyz_data(GYRO_XOUT_H)?;
            thread::sleep(CALIBRATION_SAMPLE_DELAY);
        }
        let mut accel_sum = [0.0; 3];
        let mut gyro_sum = [0.0; 3];
        for _ in 0..CALIBRATION_SAMPLES {
            let accel = self.read_xyz_data(ACCEL_XOUT_H)?;
            let gyro = self.read_xyz_data(GYRO_XOUT_H)?;
            for axis in 0..3 {
                accel_sum[axis] += accel[axis] as f64;
                gyro_sum[axis] += gyro[axis] as f64;
            }
            thread::sleep(CALIBRATION_SAMPLE_DELAY);
        }
        let n = CALIBRATION_SAMPLES as f64;
        Ok((accel_sum.map(|s| s / n), gyro_sum.map(|s| s / n)))
    }
}

impl Drop for Mpu6050 {
    // The I2c handle closes its device file when dropped.
    fn drop(&mut self) {
        debug!("Releasing MPU-6050 at 0x{:02X} on bus {}", self.address, self.bus);
    }
}

impl ImuDevice for Mpu6050 {
    fn gyroscope_bandwidth(&mut self)
                           -> Result<GyroscopeBandwidth, CanonicalError> {
        let dlpf_cfg = self.read_register(CONFIG)? & DLPF_CFG_MASK;
        GyroscopeBandwidth::from_dlpf_cfg(dlpf_cfg).ok_or_else(|| internal_error(
            &format!("Reserved DLPF_CFG value {}", dlpf_cfg)))
    }

    fn set_gyroscope_bandwidth(&mut self, bandwidth: GyroscopeBandwidth)
                               -> Result<(), CanonicalError> {
        self.set_dlpf_cfg(bandwidth.dlpf_cfg())
    }

    fn set_accelerometer_bandwidth(&mut self, bandwidth: AccelerometerBandwidth)
                                   -> Result<(), CanonicalError> {
        self.set_dlpf_cfg(bandwidth.dlpf_cfg())
    }

    /// Get current acceleration data in m/s².
    fn get_acceleration(&mut self) -> Result<AccelData, CanonicalError> {
        let [x, y, z] = self.read_xyz_data(ACCEL_XOUT_H)?;
        debug!("Raw accel: x={}, y={}, z={}", x, y, z);

        // Convert raw to g-force, then to m/s².
        Ok(AccelData {
            x: (x as f64 / ACCEL_SCALE_FACTOR) * G,
            y: (y as f64 / ACCEL_SCALE_FACTOR) * G,
            z: (z as f64 / ACCEL_SCALE_FACTOR) * G,
        })
    }

    /// Get current angular velocity data in degrees/second.
    fn get_angular_velocity(&mut self) -> Result<GyroData, CanonicalError> {
        let [x, y, z] = self.read_xyz_data(GYRO_XOUT_H)?;
        debug!("Raw gyro: x={}, y={}, z={}", x, y, z);

        Ok(GyroData {
            x: x as f64 / GYRO_SCALE_FACTOR,
            y: y as f64 / GYRO_SCALE_FACTOR,
            z: z as f64 / GYRO_SCALE_FACTOR,
        })
    }

    /// The device must be motionless and level (Z axis up) for the duration.
    fn calibrate_gyroscope_accelerometer(&mut self)
                                         -> Result<CalibrationOffsets, CanonicalError> {
        let (accel_mean, gyro_mean) = self.collect_means()?;
        debug!("Mean raw accel {:?}, gyro {:?}", accel_mean, gyro_mean);

        let current_accel = self.read_xyz_data(XA_OFFS_H)?;
        let current_gyro = self.read_xyz_data(XG_OFFS_USRH)?;
        let expected_accel = [0.0, 0.0, ACCEL_SCALE_FACTOR];

        let mut offsets = CalibrationOffsets::default();
        for axis in 0..3 {
            offsets.accel[axis] = accel_offset(current_accel[axis],
                                               accel_mean[axis],
                                               expected_accel[axis]);
            offsets.gyro[axis] = gyro_offset(current_gyro[axis], gyro_mean[axis]);
        }
        self.write_xyz_data(XA_OFFS_H, &offsets.accel)?;
        self.write_xyz_data(XG_OFFS_USRH, &offsets.gyro)?;
        info!("Wrote offsets: accel {:?}, gyro {:?}", offsets.accel, offsets.gyro);
        Ok(offsets)
    }
}

// Parse 3 consecutive 16-bit values (big-endian).
fn decode_xyz(buffer: &[u8; 6]) -> [i16; 3] {
    [i16::from_be_bytes([buffer[0], buffer[1]]),
     i16::from_be_bytes([buffer[2], buffer[3]]),
     i16::from_be_bytes([buffer[4], buffer[5]])]
}

fn merge_dlpf_cfg(config: u8, dlpf_cfg: u8) -> u8 {
    (config & !DLPF_CFG_MASK) | (dlpf_cfg & DLPF_CFG_MASK)
}

fn saturate(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

// New gyro offset register value given the current one and the mean raw
// reading at rest.
fn gyro_offset(current: i16, mean_raw: f64) -> i16 {
    saturate(current as f64 - mean_raw / GYRO_OFFSET_DIVISOR)
}

// New accel offset register value. Bit 0 of each accel offset register is
// reserved and must be preserved.
fn accel_offset(current: i16, mean_raw: f64, expected_raw: f64) -> i16 {
    let adjusted =
        saturate(current as f64 - (mean_raw - expected_raw) / ACCEL_OFFSET_DIVISOR);
    (adjusted & !1) | (current & 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_xyz() {
        let buffer = [0x01, 0x02, 0xFF, 0xFE, 0x80, 0x00];
        assert_eq!(decode_xyz(&buffer), [0x0102, -2, i16::MIN]);
    }

    #[test]
    fn test_merge_dlpf_cfg() {
        // EXT_SYNC_SET bits are retained.
        assert_eq!(merge_dlpf_cfg(0b0010_1110, 1), 0b0010_1001);
        assert_eq!(merge_dlpf_cfg(0, 6), 6);
        // Out of range value is truncated to the field.
        assert_eq!(merge_dlpf_cfg(0, 0xF9), 1);
    }

    #[test]
    fn test_gyro_offset() {
        // A mean reading of +40 raw at ±250°/s is 10 counts at ±1000°/s.
        assert_eq!(gyro_offset(0, 40.0), -10);
        assert_eq!(gyro_offset(-10, -20.0), -5);
        // Already calibrated.
        assert_eq!(gyro_offset(7, 0.4), 7);
        assert_eq!(gyro_offset(i16::MIN, 400.0), i16::MIN);
    }

    #[test]
    fn test_accel_offset() {
        // Z reads 16384 + 160 at rest; offset moves by -20 counts.
        assert_eq!(accel_offset(1000, 16544.0, 16384.0), 980);
        // Bit 0 preserved when set.
        assert_eq!(accel_offset(1001, 16544.0, 16384.0), 981);
        // X reads -80 at rest; offset moves by +10 counts.
        assert_eq!(accel_offset(-500, -80.0, 0.0), -490);
        // Bit 0 of the adjusted value is replaced by the current bit 0.
        assert_eq!(accel_offset(0, -8.0, 0.0), 0);
        assert_eq!(accel_offset(1, -8.0, 0.0), 3);
    }
}
