//! RFC2544-style benchmark sweeps.
//!
//! A sweep runs against one named profile without disturbing the other
//! profiles: it owns transient pacers and a captured receive socket on
//! the destination port, and sends through the source port's transmitter
//! like everyone else. The step logic (binary search, rate ladder,
//! burst growth) sits behind the [`TrialIo`] seam so it is exercised in
//! tests without cabled hardware; the production implementation drives
//! the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::frame::{self, parse_signature, FrameTemplate};
use crate::monotonic_micros;
use crate::pacer::RatePacer;
use crate::port::interface_index;
use crate::transmitter::TxHandle;

/// The standard RFC2544 frame-size ladder.
pub const RFC_FRAME_SIZES: [u32; 7] = [64, 128, 256, 512, 1024, 1280, 1518];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestKind {
    Throughput,
    Latency,
    FrameLoss,
    BackToBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub tests: Vec<TestKind>,
    pub low_mbps: f64,
    /// Defaults to the nominal source port speed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_mbps: Option<f64>,
    pub trial_secs: u64,
    pub latency_trial_secs: u64,
    /// A throughput trial passes when measured loss stays below this.
    pub loss_threshold: f64,
    /// Defaults to the RFC ladder; a profile-pinned size uses just that.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_sizes: Option<Vec<u32>>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            tests: vec![
                TestKind::Throughput,
                TestKind::Latency,
                TestKind::FrameLoss,
                TestKind::BackToBack,
            ],
            low_mbps: 1.0,
            high_mbps: None,
            trial_secs: 60,
            latency_trial_secs: 120,
            loss_threshold: 1e-5,
            frame_sizes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputResult {
    pub frame_size: u32,
    pub passing_mbps: f64,
    pub loss_at_pass: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyResult {
    pub frame_size: u32,
    pub rate_mbps: f64,
    pub min_us: u64,
    pub mean_us: u64,
    pub max_us: u64,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLossStep {
    pub frame_size: u32,
    pub percent_of_nominal: u32,
    pub offered_mbps: f64,
    pub loss_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackToBackResult {
    pub frame_size: u32,
    pub longest_clean_burst: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepStatus {
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub profile: String,
    pub status: SweepStatus,
    pub started_micros: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_micros: Option<u64>,
    pub throughput: Vec<ThroughputResult>,
    pub latency: Vec<LatencyResult>,
    pub frame_loss: Vec<FrameLossStep>,
    pub back_to_back: Vec<BackToBackResult>,
    /// Steps that missed their target; the sweep itself still succeeds.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl SweepReport {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            status: SweepStatus::Running,
            started_micros: monotonic_micros(),
            finished_micros: None,
            throughput: Vec::new(),
            latency: Vec::new(),
            frame_loss: Vec::new(),
            back_to_back: Vec::new(),
            notes: Vec::new(),
        }
    }
}

/// Counts observed for one timed trial or burst.
#[derive(Debug, Clone, Default)]
pub struct TrialOutcome {
    pub sent: u64,
    pub received: u64,
    /// One-way latency samples in microseconds, when the fixture echoes.
    pub latencies_us: Vec<u64>,
}

impl TrialOutcome {
    pub fn loss_ratio(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent.saturating_sub(self.received)) as f64 / self.sent as f64
    }
}

/// Wire seam for one benchmark step.
pub trait TrialIo: Send {
    /// Offer `rate_mbps` of `frame_size` frames for `duration` and count
    /// what comes back from the loopback fixture.
    fn run_trial(
        &mut self,
        frame_size: u32,
        rate_mbps: f64,
        duration: Duration,
    ) -> impl std::future::Future<Output = Result<TrialOutcome>> + Send;

    /// Issue one back-to-back burst at full rate.
    fn run_burst(
        &mut self,
        frame_size: u32,
        burst_len: u64,
    ) -> impl std::future::Future<Output = Result<TrialOutcome>> + Send;
}

fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Run the configured tests, updating `report` at every step boundary.
/// Cancellation is honored between steps.
pub async fn run_sweep<T: TrialIo>(
    io: &mut T,
    cfg: &SweepConfig,
    nominal_mbps: f64,
    cancel: watch::Receiver<bool>,
    report: Arc<Mutex<SweepReport>>,
) {
    let sizes: Vec<u32> = cfg
        .frame_sizes
        .clone()
        .unwrap_or_else(|| RFC_FRAME_SIZES.to_vec());
    let high = cfg.high_mbps.unwrap_or(nominal_mbps);
    let trial = Duration::from_secs(cfg.trial_secs);

    'tests: for test in &cfg.tests {
        for &size in &sizes {
            if cancelled(&cancel) {
                break 'tests;
            }
            match test {
                TestKind::Throughput => {
                    match throughput_search(io, cfg, size, high, trial, &cancel).await {
                        Ok(result) => report.lock().unwrap().throughput.push(result),
                        Err(e) => note(&report, format!("throughput {size}B: {e}")),
                    }
                }
                TestKind::Latency => {
                    let rate = passing_rate(&report, size).unwrap_or(high);
                    let duration = Duration::from_secs(cfg.latency_trial_secs);
                    match io.run_trial(size, rate, duration).await {
                        Ok(out) if !out.latencies_us.is_empty() => {
                            let min = *out.latencies_us.iter().min().unwrap();
                            let max = *out.latencies_us.iter().max().unwrap();
                            let mean = out.latencies_us.iter().sum::<u64>()
                                / out.latencies_us.len() as u64;
                            report.lock().unwrap().latency.push(LatencyResult {
                                frame_size: size,
                                rate_mbps: rate,
                                min_us: min,
                                mean_us: mean,
                                max_us: max,
                                samples: out.latencies_us.len() as u64,
                            });
                        }
                        Ok(_) => note(&report, format!("latency {size}B: no echoes observed")),
                        Err(e) => note(&report, format!("latency {size}B: {e}")),
                    }
                }
                TestKind::FrameLoss => {
                    for pct in (1..=10).rev().map(|n| n * 10) {
                        if cancelled(&cancel) {
                            break 'tests;
                        }
                        let offered = high * pct as f64 / 100.0;
                        match io.run_trial(size, offered, trial).await {
                            Ok(out) => report.lock().unwrap().frame_loss.push(FrameLossStep {
                                frame_size: size,
                                percent_of_nominal: pct,
                                offered_mbps: offered,
                                loss_ratio: out.loss_ratio(),
                            }),
                            Err(e) => note(&report, format!("frame-loss {size}B@{pct}%: {e}")),
                        }
                    }
                }
                TestKind::BackToBack => {
                    match back_to_back_search(io, size, &cancel).await {
                        Ok(result) => report.lock().unwrap().back_to_back.push(result),
                        Err(e) => note(&report, format!("back-to-back {size}B: {e}")),
                    }
                }
            }
        }
    }

    let mut locked = report.lock().unwrap();
    locked.status = if cancelled(&cancel) {
        SweepStatus::Cancelled
    } else {
        SweepStatus::Completed
    };
    locked.finished_micros = Some(monotonic_micros());
    info!(profile = %locked.profile, status = ?locked.status, "sweep finished");
}

fn note(report: &Arc<Mutex<SweepReport>>, text: String) {
    warn!("{text}");
    report.lock().unwrap().notes.push(text);
}

fn passing_rate(report: &Arc<Mutex<SweepReport>>, frame_size: u32) -> Option<f64> {
    report
        .lock()
        .unwrap()
        .throughput
        .iter()
        .find(|t| t.frame_size == frame_size && t.passed)
        .map(|t| t.passing_mbps)
}

/// Binary search for the highest offered rate whose loss stays under
/// the threshold.
async fn throughput_search<T: TrialIo>(
    io: &mut T,
    cfg: &SweepConfig,
    frame_size: u32,
    high: f64,
    trial: Duration,
    cancel: &watch::Receiver<bool>,
) -> Result<ThroughputResult> {
    let mut lo = cfg.low_mbps;
    let mut hi = high;
    let resolution = (high * 0.01).max(0.5);
    let mut best: Option<(f64, f64)> = None;

    // Probe the ceiling first; a clean run at line rate ends the search.
    let out = io.run_trial(frame_size, hi, trial).await?;
    if out.loss_ratio() <= cfg.loss_threshold {
        return Ok(ThroughputResult {
            frame_size,
            passing_mbps: hi,
            loss_at_pass: out.loss_ratio(),
            passed: true,
        });
    }

    while hi - lo > resolution {
        if cancelled(cancel) {
            break;
        }
        let mid = (lo + hi) / 2.0;
        let out = io.run_trial(frame_size, mid, trial).await?;
        let loss = out.loss_ratio();
        if loss <= cfg.loss_threshold {
            best = Some((mid, loss));
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Ok(match best {
        Some((rate, loss)) => ThroughputResult {
            frame_size,
            passing_mbps: rate,
            loss_at_pass: loss,
            passed: true,
        },
        None => ThroughputResult {
            frame_size,
            passing_mbps: 0.0,
            loss_at_pass: 1.0,
            passed: false,
        },
    })
}

/// Grow bursts exponentially until one loses frames, then binary search
/// the boundary for the longest clean burst.
async fn back_to_back_search<T: TrialIo>(
    io: &mut T,
    frame_size: u32,
    cancel: &watch::Receiver<bool>,
) -> Result<BackToBackResult> {
    const START: u64 = 64;
    const CEILING: u64 = 1 << 20;

    let mut clean = 0u64;
    let mut burst = START;
    let mut lossy: Option<u64> = None;

    while burst <= CEILING {
        if cancelled(cancel) {
            break;
        }
        let out = io.run_burst(frame_size, burst).await?;
        if out.received == out.sent {
            clean = burst;
            burst *= 2;
        } else {
            lossy = Some(burst);
            break;
        }
    }

    if let Some(mut hi) = lossy {
        let mut lo = clean;
        while hi - lo > lo.max(64) / 64 {
            if cancelled(cancel) {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            let out = io.run_burst(frame_size, mid).await?;
            if out.received == out.sent {
                lo = mid;
                clean = mid;
            } else {
                hi = mid;
            }
        }
    }

    Ok(BackToBackResult {
        frame_size,
        longest_clean_burst: clean,
    })
}

/// Capture socket on the destination port, counting echoed frames whose
/// payload signature carries the sweep's profile id.
struct RawCapture {
    fd: std::os::unix::io::RawFd,
}

impl RawCapture {
    fn open(device: &str) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(CoreError::Interface(std::io::Error::last_os_error()));
        }
        let ifindex = match interface_index(device) {
            Ok(i) => i,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex;
        let ret = unsafe {
            libc::bind(
                fd,
                &sll as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(CoreError::Interface(err));
        }
        Ok(Self { fd })
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let ret = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl Drop for RawCapture {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Production trial I/O: transient pacer into the source transmitter,
/// capture on the destination port.
pub struct RawTrialIo {
    template: FrameTemplate,
    tx: TxHandle,
    dst_device: String,
    profile_id: u32,
    rng: StdRng,
}

impl RawTrialIo {
    pub fn new(template: FrameTemplate, tx: TxHandle, dst_device: String) -> Self {
        let profile_id = template.profile_id;
        Self {
            template,
            tx,
            dst_device,
            profile_id,
            rng: StdRng::seed_from_u64(profile_id as u64),
        }
    }

    /// Scan every frame on the capture socket for our signature,
    /// collecting echo latencies against the embedded emit time.
    fn spawn_receiver(
        &self,
        stop: Arc<std::sync::atomic::AtomicBool>,
        received: Arc<AtomicU64>,
        latencies: Arc<Mutex<Vec<u64>>>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let capture = RawCapture::open(&self.dst_device)?;
        let profile_id = self.profile_id;
        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; 9216];
            while !stop.load(Ordering::Acquire) {
                match capture.recv(&mut buf) {
                    Ok(len) => {
                        // Signature sits after Eth+IPv4+UDP on the echo path.
                        let payload_off = 42;
                        if len > payload_off {
                            if let Some(sig) = parse_signature(&buf[payload_off..len]) {
                                if sig.profile_id == profile_id {
                                    received.fetch_add(1, Ordering::Release);
                                    let now = monotonic_micros() as u32;
                                    let delta = now.wrapping_sub(sig.emit_micros);
                                    latencies.lock().unwrap().push(delta as u64);
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        tokio::time::sleep(Duration::from_micros(500)).await;
                    }
                    Err(_) => break,
                }
            }
        }))
    }

    async fn offer(
        &mut self,
        frame_size: u32,
        rate_mbps: f64,
        duration: Option<Duration>,
        burst_len: Option<u64>,
    ) -> Result<TrialOutcome> {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let received = Arc::new(AtomicU64::new(0));
        let latencies = Arc::new(Mutex::new(Vec::new()));
        let receiver = self.spawn_receiver(stop.clone(), received.clone(), latencies.clone())?;

        let mut pacer = RatePacer::new(rate_mbps, frame_size as f64, 64);
        let deadline = duration.map(|d| Instant::now() + d);
        let mut sent = 0u64;
        let mut seq = 0u32;

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            if let Some(limit) = burst_len {
                if sent >= limit {
                    break;
                }
            }
            let tick = pacer.tick().await;
            let emit = crate::micros_at(tick) as u32;
            let frame = frame::build(
                &self.template,
                frame_size as usize,
                seq,
                emit,
                &mut self.rng,
            )?;
            seq = seq.wrapping_add(1);
            match self.tx.send(frame, tick) {
                Ok(()) => sent += 1,
                // Offered load above what the port absorbs: that loss is
                // exactly what the trial measures.
                Err(CoreError::Overflow(_)) | Err(CoreError::PortUnavailable(_)) => {
                    sent += 1;
                }
                Err(e) => {
                    stop.store(true, Ordering::Release);
                    let _ = receiver.await;
                    return Err(e);
                }
            }
        }

        // Stragglers through the loopback fixture.
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.store(true, Ordering::Release);
        let _ = receiver.await;

        let latencies_us = std::mem::take(&mut *latencies.lock().unwrap());
        Ok(TrialOutcome {
            sent,
            received: received.load(Ordering::Acquire),
            latencies_us,
        })
    }
}

impl TrialIo for RawTrialIo {
    async fn run_trial(
        &mut self,
        frame_size: u32,
        rate_mbps: f64,
        duration: Duration,
    ) -> Result<TrialOutcome> {
        self.offer(frame_size, rate_mbps, Some(duration), None).await
    }

    async fn run_burst(&mut self, frame_size: u32, burst_len: u64) -> Result<TrialOutcome> {
        // Burst at 100% of what the pacer can clock out.
        self.offer(frame_size, 1e5, None, Some(burst_len)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted link: clean up to `capacity_mbps`, everything above the
    /// capacity is lost; bursts are clean up to `burst_limit`.
    struct MockLink {
        capacity_mbps: f64,
        burst_limit: u64,
        echo_latency_us: u64,
        trials: u64,
    }

    impl TrialIo for MockLink {
        async fn run_trial(
            &mut self,
            frame_size: u32,
            rate_mbps: f64,
            _duration: Duration,
        ) -> Result<TrialOutcome> {
            self.trials += 1;
            let sent = (rate_mbps * 100.0) as u64;
            let delivered_rate = rate_mbps.min(self.capacity_mbps);
            let received = (delivered_rate * 100.0) as u64;
            let latencies = (0..received.min(1000))
                .map(|i| self.echo_latency_us + (i % 7) * (frame_size as u64 % 5 + 1))
                .collect();
            Ok(TrialOutcome {
                sent,
                received,
                latencies_us: latencies,
            })
        }

        async fn run_burst(&mut self, _frame_size: u32, burst_len: u64) -> Result<TrialOutcome> {
            Ok(TrialOutcome {
                sent: burst_len,
                received: burst_len.min(self.burst_limit),
                latencies_us: Vec::new(),
            })
        }
    }

    fn quick_config(tests: Vec<TestKind>) -> SweepConfig {
        SweepConfig {
            tests,
            trial_secs: 0,
            latency_trial_secs: 0,
            frame_sizes: Some(vec![512]),
            ..Default::default()
        }
    }

    fn fresh_report() -> Arc<Mutex<SweepReport>> {
        Arc::new(Mutex::new(SweepReport::new("p1")))
    }

    #[tokio::test]
    async fn throughput_search_converges_on_capacity() {
        let mut link = MockLink {
            capacity_mbps: 613.0,
            burst_limit: 0,
            echo_latency_us: 100,
            trials: 0,
        };
        let report = fresh_report();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        run_sweep(
            &mut link,
            &quick_config(vec![TestKind::Throughput]),
            1000.0,
            cancel_rx,
            report.clone(),
        )
        .await;

        let locked = report.lock().unwrap();
        assert_eq!(locked.status, SweepStatus::Completed);
        let t = &locked.throughput[0];
        assert!(t.passed);
        // Within the 1% search resolution of the scripted capacity
        assert!(
            (t.passing_mbps - 613.0).abs() <= 11.0,
            "found {}",
            t.passing_mbps
        );
    }

    #[tokio::test]
    async fn clean_line_rate_short_circuits() {
        let mut link = MockLink {
            capacity_mbps: 2000.0,
            burst_limit: 0,
            echo_latency_us: 100,
            trials: 0,
        };
        let report = fresh_report();
        let (_tx, rx) = watch::channel(false);
        run_sweep(
            &mut link,
            &quick_config(vec![TestKind::Throughput]),
            1000.0,
            rx,
            report.clone(),
        )
        .await;
        assert_eq!(link.trials, 1);
        assert_eq!(report.lock().unwrap().throughput[0].passing_mbps, 1000.0);
    }

    #[tokio::test]
    async fn latency_reports_min_mean_max() {
        let mut link = MockLink {
            capacity_mbps: 1000.0,
            burst_limit: 0,
            echo_latency_us: 250,
            trials: 0,
        };
        let report = fresh_report();
        let (_tx, rx) = watch::channel(false);
        run_sweep(
            &mut link,
            &quick_config(vec![TestKind::Throughput, TestKind::Latency]),
            1000.0,
            rx,
            report.clone(),
        )
        .await;
        let locked = report.lock().unwrap();
        let l = &locked.latency[0];
        assert!(l.min_us >= 250);
        assert!(l.min_us <= l.mean_us && l.mean_us <= l.max_us);
        assert!(l.samples > 0);
    }

    #[tokio::test]
    async fn frame_loss_ladder_has_ten_steps() {
        let mut link = MockLink {
            capacity_mbps: 500.0,
            burst_limit: 0,
            echo_latency_us: 10,
            trials: 0,
        };
        let report = fresh_report();
        let (_tx, rx) = watch::channel(false);
        run_sweep(
            &mut link,
            &quick_config(vec![TestKind::FrameLoss]),
            1000.0,
            rx,
            report.clone(),
        )
        .await;
        let locked = report.lock().unwrap();
        assert_eq!(locked.frame_loss.len(), 10);
        // 100% of nominal offered over a 500 Mbps link: half lost
        let worst = &locked.frame_loss[0];
        assert_eq!(worst.percent_of_nominal, 100);
        assert!((worst.loss_ratio - 0.5).abs() < 0.01);
        // 50% offered: clean
        let mid = locked
            .frame_loss
            .iter()
            .find(|s| s.percent_of_nominal == 50)
            .unwrap();
        assert_eq!(mid.loss_ratio, 0.0);
    }

    #[tokio::test]
    async fn back_to_back_finds_burst_boundary() {
        let mut link = MockLink {
            capacity_mbps: 1000.0,
            burst_limit: 3000,
            echo_latency_us: 10,
            trials: 0,
        };
        let report = fresh_report();
        let (_tx, rx) = watch::channel(false);
        run_sweep(
            &mut link,
            &quick_config(vec![TestKind::BackToBack]),
            1000.0,
            rx,
            report.clone(),
        )
        .await;
        let locked = report.lock().unwrap();
        let b = &locked.back_to_back[0];
        assert!(
            b.longest_clean_burst >= 2900 && b.longest_clean_burst <= 3000,
            "{}",
            b.longest_clean_burst
        );
    }

    #[tokio::test]
    async fn cancellation_stops_at_step_boundary() {
        let mut link = MockLink {
            capacity_mbps: 500.0,
            burst_limit: 1000,
            echo_latency_us: 10,
            trials: 0,
        };
        let report = fresh_report();
        let (cancel_tx, cancel_rx) = watch::channel(true);
        run_sweep(
            &mut link,
            &quick_config(vec![TestKind::Throughput, TestKind::FrameLoss]),
            1000.0,
            cancel_rx,
            report.clone(),
        )
        .await;
        drop(cancel_tx);
        let locked = report.lock().unwrap();
        assert_eq!(locked.status, SweepStatus::Cancelled);
        assert!(locked.frame_loss.is_empty());
    }

    #[tokio::test]
    async fn failing_step_is_recorded_and_sweep_completes() {
        struct FlakyLink;
        impl TrialIo for FlakyLink {
            async fn run_trial(
                &mut self,
                _frame_size: u32,
                _rate_mbps: f64,
                _duration: Duration,
            ) -> Result<TrialOutcome> {
                Err(CoreError::PortUnavailable("eth1".into()))
            }
            async fn run_burst(&mut self, _f: u32, burst_len: u64) -> Result<TrialOutcome> {
                Ok(TrialOutcome {
                    sent: burst_len,
                    received: burst_len,
                    latencies_us: Vec::new(),
                })
            }
        }
        let report = fresh_report();
        let (_tx, rx) = watch::channel(false);
        run_sweep(
            &mut FlakyLink,
            &quick_config(vec![TestKind::Throughput]),
            1000.0,
            rx,
            report.clone(),
        )
        .await;
        let locked = report.lock().unwrap();
        assert_eq!(locked.status, SweepStatus::Completed);
        assert_eq!(locked.notes.len(), 1);
        assert!(locked.throughput.is_empty());
    }
}
