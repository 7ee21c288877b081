// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error, internal_error};
use chrono::{DateTime, Local};
use log::{error, info, warn};

use crate::device_config::DeviceConfig;
use crate::imu_trait::{AccelData, AccelerometerBandwidth, AccelerometerControl,
                       CalibrationOffsets, DriftReport, GyroscopeBandwidth,
                       ImuDevice};

// Filter operating point: DLPF_CFG 1 (~184Hz accel, ~188Hz gyro).
const GYRO_BANDWIDTH: GyroscopeBandwidth = GyroscopeBandwidth::Hz188;
const ACCEL_BANDWIDTH: AccelerometerBandwidth = AccelerometerBandwidth::Hz184;

// Deviation from 1g (at rest) beyond which we consider the accelerometer to
// have drifted.
const DRIFT_THRESHOLD_G: f64 = 0.1;

// Brings up an IMU device and runs its calibration routine.
//
// Bring-up is best effort: if the device cannot be opened, construction
// still succeeds and the failure is logged. The controller is then in a failed
// state where calibrate() and check_drift() return failed_precondition.
pub struct AccelerometerController<D: ImuDevice + 'static> {
    // None if the device could not be opened. Locked only from blocking tasks.
    // Each blocking task holds its own clone, so if a calibrate() future is
    // dropped mid-flight the device is released when that task finishes, which
    // can be after the controller itself is dropped.
    device: Option<Arc<tokio::sync::Mutex<D>>>,

    recalibration_interval: Duration,

    // Construction time, then the time of the most recent successful
    // calibrate().
    last_calibration_time: Mutex<SystemTime>,
}

impl<D: ImuDevice + 'static> AccelerometerController<D> {
    // `open` is called once with (bus_id, address).
    pub fn new<F>(config: &DeviceConfig, open: F) -> Self
    where F: FnOnce(u8, u16) -> Result<D, CanonicalError>
    {
        let device = match open(config.bus_id, config.address) {
            Ok(mut device) => {
                info!("IMU opened with I2C address 0x{:02X} on bus {}.",
                      config.address, config.bus_id);
                apply_bandwidth(&mut device);
                Some(Arc::new(tokio::sync::Mutex::new(device)))
            },
            Err(e) => {
                error!("Failed to initialize IMU with I2C address 0x{:02X} on bus {}: {:?}. \
                        Check connections and configuration.",
                       config.address, config.bus_id, e);
                None
            },
        };
        AccelerometerController{
            device,
            recalibration_interval: config.recalibration_interval(),
            last_calibration_time: Mutex::new(SystemTime::now()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    fn initialized_device(&self, operation: &str)
                          -> Result<Arc<tokio::sync::Mutex<D>>, CanonicalError> {
        match &self.device {
            Some(device) => Ok(device.clone()),
            None => {
                error!("Cannot {} because the IMU is not initialized.", operation);
                Err(failed_precondition_error("IMU is not initialized."))
            },
        }
    }
}

#[async_trait]
impl<D: ImuDevice + 'static> AccelerometerControl for AccelerometerController<D> {
    async fn calibrate(&self) -> Result<(), CanonicalError> {
        let device = self.initialized_device("calibrate")?;
        let offsets = tokio::task::spawn_blocking(move || {
            let mut locked_device = device.blocking_lock();
            run_calibration(&mut *locked_device)
        }).await.map_err(|e| internal_error(
            &format!("Calibration task failed: {:?}", e)))??;

        let now = SystemTime::now();
        *self.last_calibration_time.lock().unwrap() = now;
        info!("Calibration complete at {}; accel offsets {:?}, gyro offsets {:?}.",
              DateTime::<Local>::from(now).format("%Y-%m-%d %H:%M:%S"),
              offsets.accel, offsets.gyro);
        Ok(())
    }

    async fn check_drift(&self) -> Result<DriftReport, CanonicalError> {
        let device = self.initialized_device("check drift")?;
        let accel = tokio::task::spawn_blocking(move || {
            let mut locked_device = device.blocking_lock();
            locked_device.get_acceleration()
        }).await.map_err(|e| internal_error(
            &format!("Drift check task failed: {:?}", e)))??;

        let report = drift_report(&accel);
        if report.exceeded {
            warn!("Accelerometer drift {:.3}g exceeds {}g threshold.",
                  report.deviation_g, DRIFT_THRESHOLD_G);
        } else {
            info!("Accelerometer drift {:.3}g is within threshold.",
                  report.deviation_g);
        }
        Ok(report)
    }

    fn recalibration_due(&self, now: SystemTime) -> bool {
        let last = *self.last_calibration_time.lock().unwrap();
        match now.duration_since(last) {
            Ok(elapsed) => elapsed >= self.recalibration_interval,
            // Clock went backwards.
            Err(_) => false,
        }
    }

    fn last_calibration_time(&self) -> SystemTime {
        *self.last_calibration_time.lock().unwrap()
    }
}

// Sets the filter operating point during bring-up. Failures are logged; the
// device remains usable with whatever bandwidth is active.
fn apply_bandwidth<D: ImuDevice>(device: &mut D) {
    log_gyroscope_bandwidth(device);
    info!("Attempting to set the gyroscope bandwidth to {:?}.", GYRO_BANDWIDTH);
    if let Err(e) = device.set_gyroscope_bandwidth(GYRO_BANDWIDTH) {
        error!("Failed to set the bandwidth: {:?}", e);
        return;
    }
    info!("Gyroscope bandwidth successfully set.");

    info!("Attempting to set the accelerometer bandwidth to {:?}.", ACCEL_BANDWIDTH);
    if let Err(e) = device.set_accelerometer_bandwidth(ACCEL_BANDWIDTH) {
        error!("Failed to set the bandwidth: {:?}", e);
        return;
    }
    info!("Accelerometer bandwidth successfully set.");
}

fn log_gyroscope_bandwidth<D: ImuDevice>(device: &mut D) {
    match device.gyroscope_bandwidth() {
        Ok(bandwidth) => info!("Gyroscope bandwidth is set to {:?}", bandwidth),
        Err(e) => warn!("Could not read gyroscope bandwidth: {:?}", e),
    }
}

// The blocking portion of calibrate(). Sample reads and the calibration
// routine propagate errors; a bandwidth failure does not.
fn run_calibration<D: ImuDevice>(device: &mut D)
                                 -> Result<CalibrationOffsets, CanonicalError> {
    info!("Calibrating IMU...");
    let accel = device.get_acceleration()?;
    let gyro = device.get_angular_velocity()?;
    info!("Accelerometer x:{:.3}, y:{:.3}, z:{:.3} m/s²", accel.x, accel.y, accel.z);
    info!("Gyroscope x:{:.3}, y:{:.3}, z:{:.3} °/s", gyro.x, gyro.y, gyro.z);

    log_gyroscope_bandwidth(device);
    info!("Attempting to set the gyroscope bandwidth to {:?}.", GYRO_BANDWIDTH);
    match device.set_gyroscope_bandwidth(GYRO_BANDWIDTH) {
        Ok(()) => log_gyroscope_bandwidth(device),
        Err(e) => {
            error!("Failed to set the gyroscope bandwidth: {:?}. \
                    Proceeding with current bandwidth.", e);
        },
    }

    device.calibrate_gyroscope_accelerometer()
}

fn drift_report(accel: &AccelData) -> DriftReport {
    let deviation_g = (accel.magnitude_g() - 1.0).abs();
    DriftReport{deviation_g, exceeded: deviation_g > DRIFT_THRESHOLD_G}
}
