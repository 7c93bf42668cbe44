//! Walktest - session orchestration and sensor fusion for the six-minute walk test.
//!
//! # Overview
//!
//! A single session engine owns all test state. Sensor samples, connection
//! reports and user commands are applied one at a time by the engine task,
//! which publishes a [`session::SessionView`] after each change.
//!
//! Distance is derived from the wearable's cumulative step count and the
//! patient's stride length. The pulse oximeter's readings are validated,
//! smoothed into trends and checked against alarm thresholds.
//!
//! # Modules
//!
//! - [`model`]: Shared data types (samples, records, phases)
//! - [`config`]: Alarm thresholds, engine timings and service configuration
//! - [`error`]: Session and connection error types
//! - [`validation`]: Usability checks and vital readouts for sensor samples
//! - [`trend`]: Short-window trend detection
//! - [`distance`]: Step baseline and stride-based distance with segment resets
//! - [`recorder`]: Vital series, extrema and minute snapshots
//! - [`stops`]: Stop records and the manual-stop countdown
//! - [`recovery`]: Post-test recovery capture
//! - [`link`]: Commands sent to a device transport
//! - [`connection`]: Per-device connection supervision and forced reconnects
//! - [`session`]: The session engine and its handle
//! - [`simulator`]: Simulated sensors
//! - [`storage`]: SQLite archive of finished sessions
//! - [`api`]: HTTP API handlers

pub mod api;
pub mod config;
pub mod connection;
pub mod distance;
pub mod error;
pub mod link;
pub mod model;
pub mod recorder;
pub mod recovery;
pub mod session;
pub mod simulator;
pub mod stops;
pub mod storage;
pub mod trend;
pub mod validation;
