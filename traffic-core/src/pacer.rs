//! Token-bucket rate pacer.
//!
//! The pacer hands out one tick per frame at the average rate implied by
//! the configured bandwidth and frame size. Ticks carry the instant the
//! token became available rather than the wall clock at wake-up, so a
//! briefly stalled downstream stage does not lower the long-term rate:
//! the next ticks land in the past (bounded by the burst depth) and the
//! pipeline catches up.

use std::time::{Duration, Instant};

use tokio::time::sleep_until;

pub const DEFAULT_BURST_DEPTH: u32 = 64;

#[derive(Debug)]
pub struct RatePacer {
    /// Seconds between frames; None while the bandwidth is zero.
    interval: Option<Duration>,
    burst_depth: u32,
    /// Earliest instant the next token is available.
    next_free: Instant,
}

fn interval_for(bandwidth_mbps: f64, frame_size: f64) -> Option<Duration> {
    if bandwidth_mbps <= 0.0 {
        return None;
    }
    let fps = bandwidth_mbps * 1e6 / 8.0 / frame_size;
    Some(Duration::from_secs_f64(1.0 / fps))
}

impl RatePacer {
    pub fn new(bandwidth_mbps: f64, frame_size: f64, burst_depth: u32) -> Self {
        Self {
            interval: interval_for(bandwidth_mbps, frame_size),
            burst_depth: burst_depth.max(1),
            next_free: Instant::now(),
        }
    }

    /// Rebase the refill rate. The current credit (`next_free`) is kept,
    /// so a rate decrease does not grant a burst and an increase does
    /// not starve.
    pub fn set_rate(&mut self, bandwidth_mbps: f64, frame_size: f64) {
        self.interval = interval_for(bandwidth_mbps, frame_size);
    }

    pub fn is_paused(&self) -> bool {
        self.interval.is_none()
    }

    /// Wait for the next token and return its availability instant.
    ///
    /// Pends forever at zero bandwidth; callers select this against
    /// their control channel.
    pub async fn tick(&mut self) -> Instant {
        let interval = match self.interval {
            Some(i) => i,
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        let now = Instant::now();
        // Credit accrues while we were away, capped at the burst depth.
        let earliest = now
            .checked_sub(interval * self.burst_depth)
            .unwrap_or(now);
        let due = self.next_free.max(earliest);
        if due > now {
            sleep_until(due.into()).await;
        }
        self.next_free = due + interval;
        due
    }
}
