//! Traffic profile descriptors, validation, and live counters.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::frame;
use crate::imix::ImixPattern;

pub const MIN_FRAME_SIZE: u32 = 64;
pub const MAX_FRAME_SIZE: u32 = 9000;
pub const DEFAULT_DST_PORT: u16 = 9999;
pub const DNS_PORT: u16 = 53;

/// Protocol encapsulation for a profile's frames. Tag-specific fields
/// live on the variant, so a descriptor can never carry a VNI without
/// being VXLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum Protocol {
    Ipv4,
    Ipv6,
    Mpls {
        #[serde(rename = "mpls_label")]
        label: u32,
    },
    Vxlan {
        vni: u32,
    },
    Qinq {
        #[serde(rename = "vlan_outer")]
        outer_vid: u16,
        #[serde(rename = "vlan_inner")]
        inner_vid: u16,
    },
    UdpFlood,
    TcpSynFlood,
    HttpFlood,
    DnsAmp,
}

impl Protocol {
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Ipv4 => "ipv4",
            Protocol::Ipv6 => "ipv6",
            Protocol::Mpls { .. } => "mpls",
            Protocol::Vxlan { .. } => "vxlan",
            Protocol::Qinq { .. } => "qinq",
            Protocol::UdpFlood => "udp-flood",
            Protocol::TcpSynFlood => "tcp-syn-flood",
            Protocol::HttpFlood => "http-flood",
            Protocol::DnsAmp => "dns-amp",
        }
    }

    /// Flood tags draw per-frame randomized fields from the profile PRNG.
    pub fn is_flood(&self) -> bool {
        matches!(
            self,
            Protocol::UdpFlood | Protocol::TcpSynFlood | Protocol::HttpFlood | Protocol::DnsAmp
        )
    }
}

/// Per-profile impairment block. All percentages are 0–100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Impairments {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    pub burst_loss_pct: f64,
    pub reorder_pct: f64,
    pub duplicate_pct: f64,
    pub corrupt_pct: f64,
    /// Optional release-rate cap below the pacer rate; overflow is
    /// queued then tail-dropped as `shaper_overrun`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shaping_mbps: Option<f64>,
}

impl Default for Impairments {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            burst_loss_pct: 0.0,
            reorder_pct: 0.0,
            duplicate_pct: 0.0,
            corrupt_pct: 0.0,
            shaping_mbps: None,
        }
    }
}

impl Impairments {
    pub fn is_passthrough(&self) -> bool {
        *self == Impairments::default()
    }

    /// Upper bound on delay the shaper can add to a frame; sizes the
    /// drain grace on disable.
    pub fn max_delay_ms(&self) -> f64 {
        self.latency_ms + 3.0 * self.jitter_ms
    }
}

/// A named traffic descriptor. `name` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDescriptor {
    pub name: String,
    pub src_port: String,
    pub dst_port: String,
    pub dst_ip: IpAddr,
    #[serde(default)]
    pub dst_l4_port: Option<u16>,
    #[serde(default)]
    pub src_l4_port: Option<u16>,
    #[serde(flatten)]
    pub protocol: Protocol,
    pub bandwidth_mbps: f64,
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,
    /// When set, per-frame sizes are drawn from the mixture and
    /// `frame_size` is ignored for everything but display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imix: Option<ImixPattern>,
    #[serde(default)]
    pub dscp: u8,
    #[serde(default)]
    pub impairments: Impairments,
    #[serde(default)]
    pub enabled: bool,
}

fn default_frame_size() -> u32 {
    512
}

impl ProfileDescriptor {
    /// Destination L4 port after defaulting: 53 for dns-amp, 9999
    /// otherwise.
    pub fn effective_dst_l4_port(&self) -> u16 {
        self.dst_l4_port.unwrap_or(match self.protocol {
            Protocol::DnsAmp => DNS_PORT,
            _ => DEFAULT_DST_PORT,
        })
    }

    /// Validate and normalize in place. Returns human-readable warnings
    /// for values that were clamped rather than rejected.
    pub fn normalize(&mut self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.name.is_empty() {
            return Err(CoreError::Validation("profile name is empty".into()));
        }
        if self.name.len() > 64 || !self.name.chars().all(|c| c.is_ascii_graphic()) {
            return Err(CoreError::Validation(format!(
                "profile name '{}' must be 1-64 printable ASCII characters",
                self.name
            )));
        }
        if self.src_port.is_empty() || self.dst_port.is_empty() {
            return Err(CoreError::Validation(
                "src_port and dst_port are required".into(),
            ));
        }
        if self.bandwidth_mbps < 0.0 || !self.bandwidth_mbps.is_finite() {
            return Err(CoreError::Validation(format!(
                "bandwidth_mbps {} out of range",
                self.bandwidth_mbps
            )));
        }
        if self.dscp > 63 {
            return Err(CoreError::Validation(format!(
                "dscp {} out of range 0-63",
                self.dscp
            )));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.frame_size) {
            return Err(CoreError::Validation(format!(
                "frame_size {} out of range {}-{}",
                self.frame_size, MIN_FRAME_SIZE, MAX_FRAME_SIZE
            )));
        }

        match self.protocol {
            Protocol::Mpls { label } if label >= 1 << 20 => {
                return Err(CoreError::Validation(format!(
                    "MPLS label {label} exceeds 20 bits"
                )));
            }
            Protocol::Vxlan { vni } if vni >= 1 << 24 => {
                return Err(CoreError::Validation(format!("VNI {vni} exceeds 24 bits")));
            }
            Protocol::Qinq {
                outer_vid,
                inner_vid,
            } if outer_vid >= 4095 || inner_vid >= 4095 || outer_vid == 0 || inner_vid == 0 => {
                return Err(CoreError::Validation(format!(
                    "VLAN IDs {outer_vid}/{inner_vid} must be 1-4094"
                )));
            }
            _ => {}
        }

        // Frames must fit the encapsulation overhead.
        let min = frame::min_frame_len(&self.protocol) as u32;
        let smallest = self.imix.map(|p| p.min_size()).unwrap_or(self.frame_size);
        if smallest < min {
            return Err(CoreError::Validation(format!(
                "frame_size {} below {} byte minimum for protocol {}",
                smallest,
                min,
                self.protocol.tag()
            )));
        }

        let imp = &mut self.impairments;
        for (label, v) in [
            ("latency_ms", imp.latency_ms),
            ("jitter_ms", imp.jitter_ms),
            ("loss_pct", imp.loss_pct),
            ("burst_loss_pct", imp.burst_loss_pct),
            ("reorder_pct", imp.reorder_pct),
            ("duplicate_pct", imp.duplicate_pct),
            ("corrupt_pct", imp.corrupt_pct),
        ] {
            if v < 0.0 || !v.is_finite() {
                return Err(CoreError::Validation(format!("{label} {v} out of range")));
            }
        }
        for (label, v) in [
            ("loss_pct", &mut imp.loss_pct),
            ("burst_loss_pct", &mut imp.burst_loss_pct),
            ("reorder_pct", &mut imp.reorder_pct),
            ("duplicate_pct", &mut imp.duplicate_pct),
            ("corrupt_pct", &mut imp.corrupt_pct),
        ] {
            if *v > 100.0 {
                warnings.push(format!("{label} clamped from {v} to 100"));
                *v = 100.0;
            }
        }
        let sum = imp.loss_pct + imp.duplicate_pct + imp.reorder_pct;
        if sum > 100.0 {
            // Scale the three down proportionally so their sum is 100.
            let scale = 100.0 / sum;
            imp.loss_pct *= scale;
            imp.duplicate_pct *= scale;
            imp.reorder_pct *= scale;
            warnings.push(format!(
                "loss+duplicate+reorder sum {sum:.1} exceeds 100, scaled down proportionally"
            ));
        }
        if let Some(cap) = imp.shaping_mbps {
            if cap <= 0.0 || !cap.is_finite() {
                return Err(CoreError::Validation(format!(
                    "shaping_mbps {cap} out of range"
                )));
            }
        }

        Ok(warnings)
    }

    /// Mean frame size driving the pacer: the IMIX mixture mean when one
    /// is configured, the fixed size otherwise.
    pub fn pacing_frame_size(&self) -> f64 {
        self.imix
            .map(|p| p.mean_size())
            .unwrap_or(self.frame_size as f64)
    }
}

/// Partial update applied by `update_profile`. Hot fields (bandwidth,
/// frame size, impairments) may change while running; everything else
/// requires a disable/enable cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub dst_ip: Option<IpAddr>,
    pub dst_l4_port: Option<u16>,
    pub src_l4_port: Option<u16>,
    #[serde(flatten)]
    pub protocol: Option<Protocol>,
    pub bandwidth_mbps: Option<f64>,
    pub frame_size: Option<u32>,
    pub imix: Option<ImixPattern>,
    pub dscp: Option<u8>,
    pub impairments: Option<Impairments>,
}

impl ProfileUpdate {
    /// Names of cold fields this update touches; non-empty while the
    /// profile runs means the update is rejected.
    pub fn cold_fields(&self) -> Vec<&'static str> {
        let mut cold = Vec::new();
        if self.src_port.is_some() {
            cold.push("src_port");
        }
        if self.dst_port.is_some() {
            cold.push("dst_port");
        }
        if self.dst_ip.is_some() {
            cold.push("dst_ip");
        }
        if self.dst_l4_port.is_some() {
            cold.push("dst_l4_port");
        }
        if self.src_l4_port.is_some() {
            cold.push("src_l4_port");
        }
        if self.protocol.is_some() {
            cold.push("protocol");
        }
        if self.dscp.is_some() {
            cold.push("dscp");
        }
        cold
    }

    pub fn apply_to(&self, desc: &mut ProfileDescriptor) {
        if let Some(v) = &self.src_port {
            desc.src_port = v.clone();
        }
        if let Some(v) = &self.dst_port {
            desc.dst_port = v.clone();
        }
        if let Some(v) = self.dst_ip {
            desc.dst_ip = v;
        }
        if let Some(v) = self.dst_l4_port {
            desc.dst_l4_port = Some(v);
        }
        if let Some(v) = self.src_l4_port {
            desc.src_l4_port = Some(v);
        }
        if let Some(v) = self.protocol {
            desc.protocol = v;
        }
        if let Some(v) = self.bandwidth_mbps {
            desc.bandwidth_mbps = v;
        }
        if let Some(v) = self.frame_size {
            desc.frame_size = v;
        }
        if let Some(v) = self.imix {
            desc.imix = Some(v);
        }
        if let Some(v) = self.dscp {
            desc.dscp = v;
        }
        if let Some(v) = self.impairments {
            desc.impairments = v;
        }
    }
}

/// Runner lifecycle state as surfaced to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Starting,
    Running,
    Updating,
    Stopping,
    Failed { cause: String },
}

impl RunnerState {
    /// States a profile may be deleted from.
    pub fn is_removable(&self) -> bool {
        matches!(self, RunnerState::Idle | RunnerState::Failed { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunnerState::Starting | RunnerState::Running | RunnerState::Updating
        )
    }
}

/// Live counters for one profile. Reset when the profile is disabled and
/// then re-enabled; stores release, loads acquire.
#[derive(Debug, Default)]
pub struct ProfileCounters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    loss_drops: AtomicU64,
    dup_emits: AtomicU64,
    reorder_events: AtomicU64,
    corrupt_emits: AtomicU64,
    shaper_overrun: AtomicU64,
    last_send_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCounterSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub loss_drops: u64,
    pub dup_emits: u64,
    pub reorder_events: u64,
    pub corrupt_emits: u64,
    pub shaper_overrun: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_send_micros: Option<u64>,
}

impl ProfileCounters {
    pub fn record_sent(&self, bytes: u64, micros: u64) {
        self.frames_sent.fetch_add(1, Ordering::Release);
        self.bytes_sent.fetch_add(bytes, Ordering::Release);
        self.last_send_micros.store(micros, Ordering::Release);
    }

    pub fn record_loss(&self) {
        self.loss_drops.fetch_add(1, Ordering::Release);
    }

    pub fn record_duplicate(&self) {
        self.dup_emits.fetch_add(1, Ordering::Release);
    }

    pub fn record_reorder(&self) {
        self.reorder_events.fetch_add(1, Ordering::Release);
    }

    pub fn record_corrupt(&self) {
        self.corrupt_emits.fetch_add(1, Ordering::Release);
    }

    pub fn record_overrun(&self) {
        self.shaper_overrun.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> ProfileCounterSnapshot {
        let ts = self.last_send_micros.load(Ordering::Acquire);
        ProfileCounterSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Acquire),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            loss_drops: self.loss_drops.load(Ordering::Acquire),
            dup_emits: self.dup_emits.load(Ordering::Acquire),
            reorder_events: self.reorder_events.load(Ordering::Acquire),
            corrupt_emits: self.corrupt_emits.load(Ordering::Acquire),
            shaper_overrun: self.shaper_overrun.load(Ordering::Acquire),
            last_send_micros: (ts != 0).then_some(ts),
        }
    }

    pub fn reset(&self) {
        self.frames_sent.store(0, Ordering::Release);
        self.bytes_sent.store(0, Ordering::Release);
        self.loss_drops.store(0, Ordering::Release);
        self.dup_emits.store(0, Ordering::Release);
        self.reorder_events.store(0, Ordering::Release);
        self.corrupt_emits.store(0, Ordering::Release);
        self.shaper_overrun.store(0, Ordering::Release);
        self.last_send_micros.store(0, Ordering::Release);
    }
}

/// Conventional name for a DSCP value (EF, CSn, AFxy, BE).
pub fn dscp_class_name(dscp: u8) -> String {
    match dscp {
        0 => "BE".into(),
        46 => "EF".into(),
        44 => "VA".into(),
        n if n % 8 == 0 && n <= 56 => format!("CS{}", n / 8),
        n @ (10 | 12 | 14 | 18 | 20 | 22 | 26 | 28 | 30 | 34 | 36 | 38) => {
            let class = n / 8;
            let drop = (n % 8) / 2;
            format!("AF{class}{drop}")
        }
        n => format!("DSCP{n}"),
    }
}
