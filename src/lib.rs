//! Fleet controller and per-host operator for game-server instances.
//!
//! The controller owns desired (TARGET) and actual (IS) artefact state per
//! server and drives periodic work through a cron loop. Operators pull the
//! outstanding mismatches for a server and swap artefacts on disk.

pub mod archive;
pub mod artefact_storage;
pub mod container;
pub mod controller_api;
pub mod controller_client;
pub mod controller_config;
pub mod cron;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod mismatch;
pub mod model;
pub mod operator;
pub mod operator_api;
pub mod operator_config;
pub mod operator_gateway;
pub mod s3_retry;
pub mod store;
pub mod validation;
