use std::time::Duration;

use thiserror::Error;

/// Error type for all core operations.
///
/// Variants map onto the failure taxonomy visible at the control boundary:
/// validation errors never reach the registry, resolution errors fail the
/// enable command, transient port errors are absorbed by the transmitter
/// and only surface as counter deltas.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or out-of-range profile descriptor
    #[error("invalid profile: {0}")]
    Validation(String),

    /// Port name did not resolve in the registry
    #[error("unknown port: {0}")]
    UnknownPort(String),

    /// Profile name did not resolve in the registry
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// Profile name already taken
    #[error("profile already exists: {0}")]
    DuplicateProfile(String),

    /// Field can only change through a disable/enable cycle
    #[error("field '{0}' is immutable while the profile is running")]
    ImmutableWhileRunning(String),

    /// Link is down or the transmitter is gone
    #[error("port {0} unavailable")]
    PortUnavailable(String),

    /// Transmit queue saturated
    #[error("transmit queue full on port {0}")]
    Overflow(String),

    /// Frame exceeds the port MTU plus VLAN allowance
    #[error("frame of {size} bytes exceeds the {max} byte allowance of port {port}")]
    Oversize {
        port: String,
        size: usize,
        max: usize,
    },

    /// Descriptor is internally inconsistent at build time
    #[error("cannot encode frame: {0}")]
    Unencodable(String),

    /// Control command exceeded its deadline
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// A benchmark sweep is already running for this profile
    #[error("sweep already in progress for profile {0}")]
    SweepInProgress(String),

    /// Host interface enumeration or kernel table read failed
    #[error("interface error: {0}")]
    Interface(#[source] std::io::Error),

    /// Persisted configuration could not be read or written
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
