//! Impairment shaper: turns (frame, tick-time) into zero or more
//! (frame, due-time) pairs exhibiting the profile's configured loss,
//! burst loss, duplication, reordering, latency+jitter, corruption, and
//! shaping-cap behavior.
//!
//! All randomness comes from one PRNG seeded at enable time, so two runs
//! with the same configuration produce the same impairment trace. The
//! shaper never fails; saturating the shaping-cap queue tail-drops and
//! counts `shaper_overrun`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::profile::{Impairments, ProfileCounters};

/// Mean burst-loss run length is 5 frames: geometric exit.
const BURST_EXIT_P: f64 = 1.0 / 5.0;

/// Duplicate copies trail the original by this much.
const DUPLICATE_OFFSET: Duration = Duration::from_micros(50);

/// Longest a frame may wait behind the shaping cap before tail drop.
const CAP_MAX_BACKLOG: Duration = Duration::from_millis(100);

pub struct ImpairmentShaper {
    cfg: Impairments,
    rng: StdRng,
    counters: Arc<ProfileCounters>,
    /// Bytes below this offset are never touched by corruption
    /// (headers plus signature).
    corruption_floor: usize,
    in_burst: bool,
    cap_next_free: Instant,
}

impl ImpairmentShaper {
    pub fn new(
        cfg: Impairments,
        seed: u64,
        counters: Arc<ProfileCounters>,
        corruption_floor: usize,
    ) -> Self {
        Self {
            cfg,
            rng: StdRng::seed_from_u64(seed),
            counters,
            corruption_floor,
            in_burst: false,
            cap_next_free: Instant::now(),
        }
    }

    /// Hot-update the impairment block; PRNG and burst state carry over.
    pub fn set_config(&mut self, cfg: Impairments) {
        self.cfg = cfg;
    }

    /// Bound on pipeline drain time after the pacer stops.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cfg.max_delay_ms() / 1000.0) + Duration::from_millis(100)
    }

    fn chance(&mut self, pct: f64) -> bool {
        pct > 0.0 && self.rng.gen::<f64>() * 100.0 < pct
    }

    /// Process one built frame. Returns the frames to hand to the
    /// transmitter with their due-times; empty when the frame was lost.
    pub fn process(&mut self, mut frame: Vec<u8>, tick: Instant) -> Vec<(Vec<u8>, Instant)> {
        // 1. random loss
        if self.chance(self.cfg.loss_pct) {
            self.counters.record_loss();
            return Vec::new();
        }

        // 2. burst loss: two-state Markov, geometric bad-state runs
        if self.in_burst {
            if self.rng.gen::<f64>() < BURST_EXIT_P {
                self.in_burst = false;
            }
            self.counters.record_loss();
            return Vec::new();
        }
        if self.chance(self.cfg.burst_loss_pct) {
            self.in_burst = true;
            self.counters.record_loss();
            return Vec::new();
        }

        // 3. duplication: copy taken before corruption can touch the bytes
        let dup_copy = self
            .chance(self.cfg.duplicate_pct)
            .then(|| frame.clone());

        // 4. reorder: extra delay pushes this frame past its successors
        let mut extra_ms = 0.0;
        if self.chance(self.cfg.reorder_pct) {
            self.counters.record_reorder();
            let hi = self.cfg.latency_ms + 2.0 * self.cfg.jitter_ms;
            extra_ms = self.rng.gen_range(self.cfg.latency_ms..=hi);
        }

        // 5. base latency plus symmetric triangular jitter
        let jitter = (self.rng.gen::<f64>() + self.rng.gen::<f64>() - 1.0) * self.cfg.jitter_ms;
        let delay_ms = (self.cfg.latency_ms + jitter + extra_ms).max(0.0);
        let due = tick + Duration::from_secs_f64(delay_ms / 1000.0);

        // 6. corruption: flip one payload bit past the protected prefix
        if self.chance(self.cfg.corrupt_pct) && frame.len() > self.corruption_floor {
            let idx = self.rng.gen_range(self.corruption_floor..frame.len());
            let bit = self.rng.gen_range(0..8u8);
            frame[idx] ^= 1 << bit;
            self.counters.record_corrupt();
        }

        // 7. shaping cap
        let mut out = Vec::with_capacity(2);
        if let Some(emit) = self.cap_gate(frame, due) {
            out.push(emit);
        }
        if let Some(copy) = dup_copy {
            self.counters.record_duplicate();
            if let Some(emit) = self.cap_gate(copy, due + DUPLICATE_OFFSET) {
                out.push(emit);
            }
        }
        out
    }

    /// Serialize releases at the shaping cap rate; queue overflow beyond
    /// the backlog bound tail-drops.
    fn cap_gate(&mut self, frame: Vec<u8>, due: Instant) -> Option<(Vec<u8>, Instant)> {
        let cap_mbps = match self.cfg.shaping_mbps {
            Some(c) => c,
            None => return Some((frame, due)),
        };
        let frame_time = Duration::from_secs_f64(frame.len() as f64 * 8.0 / (cap_mbps * 1e6));
        let release = self.cap_next_free.max(due);
        if release.duration_since(due) > CAP_MAX_BACKLOG {
            self.counters.record_overrun();
            return None;
        }
        self.cap_next_free = release + frame_time;
        Some((frame, release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> Arc<ProfileCounters> {
        Arc::new(ProfileCounters::default())
    }

    fn frame() -> Vec<u8> {
        vec![0u8; 128]
    }

    fn shaper(cfg: Impairments) -> (ImpairmentShaper, Arc<ProfileCounters>) {
        let c = counters();
        (ImpairmentShaper::new(cfg, 1234, c.clone(), 58), c)
    }

    #[test]
    fn passthrough_preserves_tick_times() {
        let (mut s, c) = shaper(Impairments::default());
        let tick = Instant::now();
        for _ in 0..100 {
            let out = s.process(frame(), tick);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].1, tick);
        }
        assert_eq!(c.snapshot().loss_drops, 0);
    }

    #[test]
    fn full_loss_drops_everything() {
        let (mut s, c) = shaper(Impairments {
            loss_pct: 100.0,
            ..Default::default()
        });
        let tick = Instant::now();
        for _ in 0..500 {
            assert!(s.process(frame(), tick).is_empty());
        }
        assert_eq!(c.snapshot().loss_drops, 500);
    }

    #[test]
    fn full_duplication_doubles_output() {
        let (mut s, c) = shaper(Impairments {
            duplicate_pct: 100.0,
            ..Default::default()
        });
        let tick = Instant::now();
        let mut emits = 0;
        for _ in 0..200 {
            let out = s.process(frame(), tick);
            assert_eq!(out.len(), 2);
            assert_eq!(out[1].1, out[0].1 + DUPLICATE_OFFSET);
            emits += out.len();
        }
        assert_eq!(emits, 400);
        assert_eq!(c.snapshot().dup_emits, 200);
    }

    #[test]
    fn loss_rate_is_statistical() {
        let (mut s, c) = shaper(Impairments {
            loss_pct: 2.0,
            ..Default::default()
        });
        let tick = Instant::now();
        let n = 20_000;
        for _ in 0..n {
            s.process(frame(), tick);
        }
        let drops = c.snapshot().loss_drops as f64;
        let rate = drops / n as f64;
        assert!((0.015..=0.025).contains(&rate), "loss rate {rate}");
    }

    #[test]
    fn burst_loss_produces_runs() {
        let (mut s, c) = shaper(Impairments {
            burst_loss_pct: 2.0,
            ..Default::default()
        });
        let tick = Instant::now();
        let mut run = 0usize;
        let mut max_run = 0usize;
        for _ in 0..20_000 {
            if s.process(frame(), tick).is_empty() {
                run += 1;
                max_run = max_run.max(run);
            } else {
                run = 0;
            }
        }
        assert!(c.snapshot().loss_drops > 0);
        // Mean run length 5 makes multi-frame runs near certain.
        assert!(max_run >= 3, "longest run {max_run}");
    }

    #[test]
    fn latency_and_jitter_delay_within_bounds() {
        let (mut s, _) = shaper(Impairments {
            latency_ms: 10.0,
            jitter_ms: 2.0,
            ..Default::default()
        });
        let tick = Instant::now();
        for _ in 0..1000 {
            let out = s.process(frame(), tick);
            let delay = out[0].1.duration_since(tick);
            assert!(delay >= Duration::from_millis(8), "{delay:?}");
            assert!(delay <= Duration::from_millis(12), "{delay:?}");
        }
    }

    #[test]
    fn reorder_adds_extra_delay() {
        let (mut s, c) = shaper(Impairments {
            latency_ms: 5.0,
            jitter_ms: 1.0,
            reorder_pct: 100.0,
            ..Default::default()
        });
        let tick = Instant::now();
        let out = s.process(frame(), tick);
        // base [4,6] plus extra [5,7] => at least 9 ms
        assert!(out[0].1.duration_since(tick) >= Duration::from_millis(9));
        assert_eq!(c.snapshot().reorder_events, 1);
    }

    #[test]
    fn corruption_flips_one_bit_past_floor() {
        let (mut s, c) = shaper(Impairments {
            corrupt_pct: 100.0,
            ..Default::default()
        });
        let clean = frame();
        let out = s.process(clean.clone(), Instant::now());
        let dirty = &out[0].0;
        let diffs: Vec<usize> = (0..clean.len()).filter(|&i| clean[i] != dirty[i]).collect();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0] >= 58);
        assert_eq!((clean[diffs[0]] ^ dirty[diffs[0]]).count_ones(), 1);
        assert_eq!(c.snapshot().corrupt_emits, 1);
    }

    #[test]
    fn shaping_cap_spaces_releases_then_overruns() {
        // 1 Mbps cap, 128-byte frames => ~1.024 ms per frame release
        let (mut s, c) = shaper(Impairments {
            shaping_mbps: Some(1.0),
            ..Default::default()
        });
        let tick = Instant::now();
        let mut last_release = None;
        let mut emitted = 0u64;
        for _ in 0..500 {
            for (_, release) in s.process(frame(), tick) {
                if let Some(prev) = last_release {
                    assert!(release >= prev);
                }
                last_release = Some(release);
                emitted += 1;
            }
        }
        let snap = c.snapshot();
        // ~98 frames fit in the 100 ms backlog, the rest tail-drop
        assert!(snap.shaper_overrun > 0);
        assert_eq!(emitted + snap.shaper_overrun, 500);
    }

    #[test]
    fn identical_seeds_produce_identical_traces() {
        let cfg = Impairments {
            latency_ms: 3.0,
            jitter_ms: 1.5,
            loss_pct: 5.0,
            duplicate_pct: 5.0,
            reorder_pct: 5.0,
            ..Default::default()
        };
        let mut a = ImpairmentShaper::new(cfg, 99, counters(), 58);
        let mut b = ImpairmentShaper::new(cfg, 99, counters(), 58);
        let tick = Instant::now();
        for _ in 0..1000 {
            let oa = a.process(frame(), tick);
            let ob = b.process(frame(), tick);
            assert_eq!(oa.len(), ob.len());
            for (x, y) in oa.iter().zip(ob.iter()) {
                assert_eq!(x.1, y.1);
                assert_eq!(x.0, y.0);
            }
        }
    }

    #[test]
    fn conservation_of_frames() {
        let (mut s, c) = shaper(Impairments {
            loss_pct: 10.0,
            duplicate_pct: 10.0,
            ..Default::default()
        });
        let tick = Instant::now();
        let n = 5000u64;
        let mut emitted = 0u64;
        for _ in 0..n {
            emitted += s.process(frame(), tick).len() as u64;
        }
        let snap = c.snapshot();
        assert_eq!(
            emitted + snap.loss_drops + snap.shaper_overrun,
            n + snap.dup_emits
        );
    }
}
