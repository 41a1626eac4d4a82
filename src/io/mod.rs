// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! I/O adapter boundary - the only seam between the engine and hardware

mod simulator;

pub use simulator::SimulatedIo;

use async_trait::async_trait;
use thiserror::Error;

use crate::channels::ChannelAddress;

/// A single failed adapter operation.
///
/// Always transient from the engine's point of view: the caller skips the
/// operation for the current tick and retries on the next due interval.
#[derive(Debug, Error)]
pub enum IoError {
    /// The operation did not complete within the configured deadline
    #[error("i/o timed out")]
    Timeout,
    /// The adapter could not produce a value
    #[error("read failed on {address}: {reason}")]
    Read {
        /// Address the read targeted
        address: String,
        /// Driver-level failure description
        reason: String,
    },
    /// The adapter could not apply a value
    #[error("write failed on {address}: {reason}")]
    Write {
        /// Address the write targeted
        address: String,
        /// Driver-level failure description
        reason: String,
    },
}

/// Capability-typed interface to sensors and actuators.
///
/// One implementation per platform, chosen once at construction. Both
/// operations must be safe to call again after a failure; the engine never
/// re-initializes an adapter between calls.
#[async_trait]
pub trait IoAdapter: Send + Sync {
    /// Read the raw value at an address.
    async fn read(&self, address: &ChannelAddress) -> Result<f64, IoError>;

    /// Drive an address to a value.
    async fn write(&self, address: &ChannelAddress, value: f64) -> Result<(), IoError>;
}
