//! Multi-port traffic generator and impairment emulator core.
//!
//! The core owns one raw-L2 transmitter per host Ethernet port and one
//! runner per traffic profile. A runner composes a token-bucket pacer, a
//! protocol frame builder, and an impairment shaper, then hands timed
//! frames to the port transmitter. A process-wide registry holds the port
//! and profile catalogue and serves lock-free counter snapshots to the
//! control plane.
//!
//! Everything external (HTTP routing, persistence format, GUI) talks to
//! the core through [`adapter::ControlAdapter`].

pub mod adapter;
pub mod config;
pub mod core;
pub mod error;
pub mod frame;
pub mod imix;
pub mod neighbor;
pub mod pacer;
pub mod port;
pub mod profile;
pub mod registry;
pub mod rfc2544;
pub mod runner;
pub mod shaper;
pub mod transmitter;

pub use crate::core::{Capabilities, Core, CoreOptions};
pub use adapter::ControlAdapter;
pub use error::{CoreError, Result};

use std::sync::OnceLock;
use std::time::Instant;

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds on the process-wide monotonic clock.
///
/// The epoch is the first call in the process, so values are comparable
/// across tasks but carry no wall-clock meaning. The low 32 bits of this
/// value are what the frame signature embeds.
pub fn monotonic_micros() -> u64 {
    let epoch = *MONO_EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_micros() as u64
}

/// Microseconds for an arbitrary instant on the same clock as
/// [`monotonic_micros`]. Instants before the epoch clamp to zero.
pub fn micros_at(at: Instant) -> u64 {
    let epoch = *MONO_EPOCH.get_or_init(Instant::now);
    at.checked_duration_since(epoch)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
