//! Neighbor discovery: ARP/NDP tables, LLDP peers, and link state.
//!
//! The prober is strictly read-only: it parses `/proc/net/arp`, asks the
//! kernel for the IPv6 neighbor table, optionally consults a host-side
//! `lldpctl`, and reads link state from `/sys`. Results replace a port's
//! neighbor cache atomically via the registry; a timed-out scan keeps
//! the previous cache.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::port::{link_is_up, MacAddr};
use crate::registry::Registry;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub ip: IpAddr,
    pub mac: MacAddr,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chassis_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u32>,
}

impl LldpEntry {
    fn is_empty(&self) -> bool {
        self.chassis_id.is_none()
            && self.port_id.is_none()
            && self.system_name.is_none()
            && self.system_description.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborCache {
    pub arp: Vec<ArpEntry>,
    pub lldp: Vec<LldpEntry>,
    pub link: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanned_at: Option<DateTime<Utc>>,
}

impl NeighborCache {
    /// MAC for an IP if the cache knows it; builders fall back to
    /// broadcast otherwise.
    pub fn lookup_mac(&self, ip: &IpAddr) -> Option<MacAddr> {
        self.arp
            .iter()
            .find(|e| &e.ip == ip && !e.mac.is_zero())
            .map(|e| e.mac)
    }
}

/// Parse `/proc/net/arp`, keeping entries witnessed on `device`.
///
/// Columns: IP address, HW type, Flags, HW address, Mask, Device.
/// Flag 0x2 marks a complete entry.
pub fn parse_proc_arp(text: &str, device: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in text.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 || parts[5] != device {
            continue;
        }
        let ip: IpAddr = match parts[0].parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        let mac: MacAddr = match parts[3].parse() {
            Ok(mac) => mac,
            Err(_) => continue,
        };
        if mac.is_zero() {
            continue;
        }
        let complete = u32::from_str_radix(parts[2].trim_start_matches("0x"), 16)
            .map(|f| f & 0x2 != 0)
            .unwrap_or(false);
        entries.push(ArpEntry {
            ip,
            mac,
            state: if complete { "reachable" } else { "stale" }.to_string(),
        });
    }
    entries
}

/// Parse `ip -6 neigh show dev <device>` output:
/// `fe80::1 lladdr aa:bb:cc:dd:ee:ff router REACHABLE`.
pub fn parse_ip_neigh(text: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let ip: IpAddr = match parts[0].parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        let mac = parts
            .iter()
            .position(|p| *p == "lladdr")
            .and_then(|i| parts.get(i + 1))
            .and_then(|m| m.parse::<MacAddr>().ok());
        let mac = match mac {
            Some(m) => m,
            None => continue,
        };
        let state = parts
            .last()
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".into());
        entries.push(ArpEntry { ip, mac, state });
    }
    entries
}

/// Parse `lldpctl -f keyvalue` output for one device. Lines look like
/// `lldp.eth1.chassis.name=sw-lab-1`.
pub fn parse_lldpctl(text: &str, device: &str) -> Vec<LldpEntry> {
    let prefix = format!("lldp.{device}.");
    let mut entry = LldpEntry::default();
    for line in text.lines() {
        let rest = match line.strip_prefix(&prefix) {
            Some(r) => r,
            None => continue,
        };
        let (key, value) = match rest.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        let value = value.trim().to_string();
        match key {
            "chassis.mac" | "chassis.local" => entry.chassis_id = Some(value),
            "chassis.name" => entry.system_name = Some(value),
            "chassis.descr" => entry.system_description = Some(value),
            "port.ifname" | "port.mac" | "port.local" => {
                if entry.port_id.is_none() {
                    entry.port_id = Some(value);
                }
            }
            "ttl" => entry.ttl_secs = value.parse().ok(),
            _ => {}
        }
    }
    if entry.is_empty() {
        Vec::new()
    } else {
        vec![entry]
    }
}

fn read_link_status(device: &str) -> LinkStatus {
    let speed = std::fs::read_to_string(format!("/sys/class/net/{device}/speed"))
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|s| *s > 0)
        .map(|s| s as u32);
    let duplex = std::fs::read_to_string(format!("/sys/class/net/{device}/duplex"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s != "unknown");
    LinkStatus {
        up: link_is_up(device),
        speed_mbps: speed,
        duplex,
    }
}

async fn command_stdout(cmd: &str, args: &[&str]) -> Option<String> {
    match Command::new(cmd).args(args).output().await {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(cmd, status = %out.status, "probe command failed");
            None
        }
        Err(e) => {
            debug!(cmd, error = %e, "probe command unavailable");
            None
        }
    }
}

async fn scan_port_inner(device: &str) -> Result<NeighborCache> {
    let mut arp = match tokio::fs::read_to_string("/proc/net/arp").await {
        Ok(text) => parse_proc_arp(&text, device),
        Err(e) => return Err(CoreError::Interface(e)),
    };

    if let Some(text) = command_stdout("ip", &["-6", "neigh", "show", "dev", device]).await {
        arp.extend(parse_ip_neigh(&text));
    }

    let lldp = match command_stdout("lldpctl", &["-f", "keyvalue"]).await {
        Some(text) => parse_lldpctl(&text, device),
        None => Vec::new(),
    };

    Ok(NeighborCache {
        arp,
        lldp,
        link: read_link_status(device),
        scanned_at: Some(Utc::now()),
    })
}

/// Scan one port with the per-port timeout.
pub async fn scan_port(device: &str, timeout: Duration) -> Result<NeighborCache> {
    tokio::time::timeout(timeout, scan_port_inner(device))
        .await
        .map_err(|_| CoreError::Timeout(timeout))?
}

/// On-demand refresh over a set of ports. Timed-out ports keep their
/// previous cache; the call fails with `Timeout` only when every port
/// timed out.
pub async fn refresh_ports(
    registry: &Registry,
    ports: &[String],
    timeout: Duration,
) -> Result<()> {
    let mut timed_out = 0usize;
    for name in ports {
        match scan_port(name, timeout).await {
            Ok(cache) => registry.update_neighbors(name, cache).await?,
            Err(CoreError::Timeout(_)) => {
                warn!(port = %name, "neighbor scan timed out, keeping previous cache");
                timed_out += 1;
            }
            Err(e) => {
                warn!(port = %name, error = %e, "neighbor scan failed");
            }
        }
    }
    if !ports.is_empty() && timed_out == ports.len() {
        return Err(CoreError::Timeout(timeout));
    }
    Ok(())
}

/// Periodic prober task over a fixed port set.
pub fn spawn_prober(
    registry: Arc<Registry>,
    ports: Vec<String>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_ports(&registry, &ports, timeout).await {
                warn!(error = %e, "periodic neighbor scan failed");
            }
        }
    })
}
