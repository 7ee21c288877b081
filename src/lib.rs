// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod accelerometer_controller;
pub mod device_config;
pub mod imu6050;
pub mod imu_trait;
