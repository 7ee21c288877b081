// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use clap::Parser;
use log::{error, info};

use imu_calibrate::accelerometer_controller::AccelerometerController;
use imu_calibrate::device_config::{DeviceConfig, parse_address};
use imu_calibrate::imu6050::Mpu6050;
use imu_calibrate::imu_trait::AccelerometerControl;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// 7-bit I2C address of the MPU-6050, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_address, default_value = "0x68")]
    address: u16,

    /// I2C bus number, i.e. /dev/i2c-<bus>.
    #[arg(long, default_value = "1")]
    bus: u8,

    /// How long a calibration is considered good for.
    #[arg(long, default_value = "60")]
    recalibration_interval_minutes: u32,

    /// After calibrating, compare the at-rest accelerometer magnitude against
    /// 1g and report drift.
    #[arg(long)]
    check_drift: bool,
}

// Logs an error result before main returns it.
fn logged<T>(result: Result<T, CanonicalError>) -> Result<T, CanonicalError> {
    if let Err(e) = &result {
        error!("An error occurred: {:?}", e);
    }
    result
}

#[tokio::main]
async fn main() -> Result<(), CanonicalError> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = DeviceConfig::new(args.address, args.bus,
                                   args.recalibration_interval_minutes)?;
    let controller = AccelerometerController::new(&config, Mpu6050::open);

    info!("Starting calibration...");
    logged(controller.calibrate().await)?;
    info!("Calibration completed successfully.");

    if args.check_drift {
        let report = logged(controller.check_drift().await)?;
        info!("Drift check: deviation {:.3}g, exceeded: {}",
              report.deviation_g, report.exceeded);
    }
    Ok(())
}
