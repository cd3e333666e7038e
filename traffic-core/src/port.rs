//! Host port model and enumeration.
//!
//! Ports are discovered once at startup from `/sys/class/net` and
//! `getifaddrs`, published to the registry, and never destroyed. Link
//! state tracks kernel operstate; TX counters are atomics owned here and
//! bumped by the transmitter only after a successful kernel write.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{CoreError, Result};

pub const ETH_HEADER_LEN: usize = 14;
/// Room for one 802.1ad plus one 802.1Q tag on top of the MTU.
pub const VLAN_ALLOWANCE: usize = 8;

/// A MAC address, formatted `aa:bb:cc:dd:ee:ff` on the wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<u8> = s
            .trim()
            .split(':')
            .filter_map(|p| u8::from_str_radix(p, 16).ok())
            .collect();
        if parts.len() != 6 {
            return Err(CoreError::Validation(format!("invalid MAC address: {s}")));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&parts);
        Ok(MacAddr(mac))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Physical flavor of a port, used by the control plane for display and
/// by the fast-path capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortType {
    Copper,
    Sfp,
    FastPathCapable,
}

/// Live TX counters for one port. Monotonic until an explicit reset.
///
/// Stores use release ordering and loads acquire, so any single reader
/// observes a non-decreasing sequence.
#[derive(Debug, Default)]
pub struct PortCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    /// Microseconds of the most recent TX timestamp (hardware when the
    /// port supports capture, software otherwise). Zero until first send.
    last_tx_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounterSnapshot {
    pub frames: u64,
    pub bytes: u64,
    pub dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tx_micros: Option<u64>,
}

impl PortCounters {
    pub fn record_tx(&self, bytes: u64, tx_micros: u64) {
        self.frames.fetch_add(1, Ordering::Release);
        self.bytes.fetch_add(bytes, Ordering::Release);
        self.last_tx_micros.store(tx_micros, Ordering::Release);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Release);
    }

    pub fn snapshot(&self) -> PortCounterSnapshot {
        let ts = self.last_tx_micros.load(Ordering::Acquire);
        PortCounterSnapshot {
            frames: self.frames.load(Ordering::Acquire),
            bytes: self.bytes.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            last_tx_micros: (ts != 0).then_some(ts),
        }
    }

    pub fn reset(&self) {
        self.frames.store(0, Ordering::Release);
        self.bytes.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Release);
        self.last_tx_micros.store(0, Ordering::Release);
    }
}

/// Static description of one host Ethernet port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub mac: MacAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_prefix: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_prefix: Option<u8>,
    /// Nominal speed in Mbps as reported by the kernel; None when the
    /// driver does not report one (link down on some NICs).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mbps: Option<u32>,
    pub port_type: PortType,
    pub mtu: u32,
    pub hardware_timestamps: bool,
}

impl Port {
    /// Largest on-wire frame (sans FCS) the transmitter accepts for this
    /// port: MTU plus L2 header plus stacked VLAN tags.
    pub fn max_frame_len(&self) -> usize {
        self.mtu as usize + ETH_HEADER_LEN + VLAN_ALLOWANCE
    }

    /// Source IPv4 for generated traffic; documentation range fallback
    /// keeps the builder total when the port has no address.
    pub fn source_ipv4(&self) -> Ipv4Addr {
        self.ipv4.unwrap_or(Ipv4Addr::new(192, 0, 2, 1))
    }

    pub fn source_ipv6(&self) -> Ipv6Addr {
        self.ipv6
            .unwrap_or(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))
    }
}

fn read_sys<T: FromStr>(dev: &str, attr: &str) -> Option<T> {
    let path = format!("/sys/class/net/{dev}/{attr}");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Kernel operstate for a device: `true` when `up`.
pub fn link_is_up(dev: &str) -> bool {
    read_sys::<String>(dev, "operstate").as_deref() == Some("up")
}

fn classify(dev: &str, speed_mbps: Option<u32>) -> PortType {
    // Virtual devices are useful in lab namespaces; treat them as copper.
    if dev.starts_with("veth") || dev.starts_with("tap") {
        return PortType::Copper;
    }
    match speed_mbps {
        Some(s) if s >= 25_000 => PortType::FastPathCapable,
        Some(s) if s >= 10_000 => PortType::Sfp,
        _ => PortType::Copper,
    }
}

/// Per-interface addresses collected from getifaddrs.
#[derive(Debug, Clone, Default)]
struct HostAddrs {
    ipv4: Option<Ipv4Addr>,
    ipv4_prefix: Option<u8>,
    ipv6: Option<Ipv6Addr>,
    ipv6_prefix: Option<u8>,
}

fn prefix_from_mask(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(m) => u32::from(m).count_ones() as u8,
        IpAddr::V6(m) => u128::from(m).count_ones() as u8,
    }
}

fn sockaddr_to_ip(sa: *const libc::sockaddr) -> Option<IpAddr> {
    if sa.is_null() {
        return None;
    }
    unsafe {
        match (*sa).sa_family as i32 {
            libc::AF_INET => {
                let sin = &*(sa as *const libc::sockaddr_in);
                Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                    sin.sin_addr.s_addr,
                ))))
            }
            libc::AF_INET6 => {
                let sin6 = &*(sa as *const libc::sockaddr_in6);
                Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
            }
            _ => None,
        }
    }
}

fn collect_host_addrs() -> Result<HashMap<String, HostAddrs>> {
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
        return Err(CoreError::Interface(std::io::Error::last_os_error()));
    }

    let mut out: HashMap<String, HostAddrs> = HashMap::new();
    let mut cur = ifaddrs;
    while !cur.is_null() {
        let entry = unsafe { &*cur };
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let slot = out.entry(name).or_default();

        if let Some(addr) = sockaddr_to_ip(entry.ifa_addr) {
            let prefix = sockaddr_to_ip(entry.ifa_netmask).map(prefix_from_mask);
            match addr {
                IpAddr::V4(v4) if slot.ipv4.is_none() => {
                    slot.ipv4 = Some(v4);
                    slot.ipv4_prefix = prefix;
                }
                IpAddr::V6(v6) if slot.ipv6.is_none() && !v6.is_loopback() => {
                    slot.ipv6 = Some(v6);
                    slot.ipv6_prefix = prefix;
                }
                _ => {}
            }
        }
        cur = entry.ifa_next;
    }

    unsafe { libc::freeifaddrs(ifaddrs) };
    Ok(out)
}

/// Enumerate host Ethernet ports from `/sys/class/net`.
///
/// Loopback and bridge-internal devices are skipped. When `only` is set,
/// enumeration is restricted to those device names and a missing device
/// is an error (a cabled test port that vanished is a deployment fault).
pub fn enumerate_ports(only: Option<&[String]>) -> Result<Vec<Port>> {
    let sys = Path::new("/sys/class/net");
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(sys).map_err(CoreError::Interface)? {
        let entry = entry.map_err(CoreError::Interface)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" || name.starts_with("docker") || name.starts_with("br-") {
            continue;
        }
        names.push(name);
    }
    names.sort();

    if let Some(wanted) = only {
        for w in wanted {
            if !names.contains(w) {
                return Err(CoreError::UnknownPort(w.clone()));
            }
        }
        names.retain(|n| wanted.contains(n));
    }

    let addrs = collect_host_addrs().unwrap_or_default();

    let mut ports = Vec::with_capacity(names.len());
    for name in names {
        let mac = match read_sys::<String>(&name, "address")
            .and_then(|s| s.parse::<MacAddr>().ok())
        {
            Some(mac) if !mac.is_zero() => mac,
            _ => {
                debug!(port = %name, "skipping device without a MAC");
                continue;
            }
        };
        // speed reads -1 while the link is down
        let speed_mbps = read_sys::<i64>(&name, "speed")
            .filter(|s| *s > 0)
            .map(|s| s as u32);
        let mtu = read_sys::<u32>(&name, "mtu").unwrap_or(1500);
        let host = addrs.get(&name).cloned().unwrap_or_default();

        ports.push(Port {
            port_type: classify(&name, speed_mbps),
            name,
            mac,
            ipv4: host.ipv4,
            ipv4_prefix: host.ipv4_prefix,
            ipv6: host.ipv6,
            ipv6_prefix: host.ipv6_prefix,
            speed_mbps,
            mtu,
            // Capture capability is sensed per-socket at bind time; the
            // flag here only seeds the capability set.
            hardware_timestamps: false,
        });
    }
    Ok(ports)
}

/// Interface index for a device name, needed to bind the raw socket.
pub fn interface_index(name: &str) -> Result<i32> {
    let cstr = std::ffi::CString::new(name)
        .map_err(|_| CoreError::UnknownPort(name.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(cstr.as_ptr()) };
    if idx == 0 {
        return Err(CoreError::UnknownPort(name.to_string()));
    }
    Ok(idx as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trips_through_display() {
        let mac: MacAddr = "02:00:00:aa:bb:cc".parse().unwrap();
        assert_eq!(mac.to_string(), "02:00:00:aa:bb:cc");
        assert_eq!(mac.octets(), [0x02, 0, 0, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!("hello".parse::<MacAddr>().is_err());
        assert!("02:00:00:aa:bb".parse::<MacAddr>().is_err());
    }

    #[test]
    fn counters_are_monotonic_and_resettable() {
        let c = PortCounters::default();
        c.record_tx(100, 5);
        c.record_tx(200, 9);
        c.record_dropped(1);
        let snap = c.snapshot();
        assert_eq!(snap.frames, 2);
        assert_eq!(snap.bytes, 300);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.last_tx_micros, Some(9));

        c.reset();
        let snap = c.snapshot();
        assert_eq!(snap.frames, 0);
        assert_eq!(snap.last_tx_micros, None);
    }

    #[test]
    fn max_frame_len_includes_vlan_allowance() {
        let port = Port {
            name: "eth0".into(),
            mac: MacAddr([2, 0, 0, 0, 0, 1]),
            ipv4: None,
            ipv4_prefix: None,
            ipv6: None,
            ipv6_prefix: None,
            speed_mbps: Some(1000),
            port_type: PortType::Copper,
            mtu: 1500,
            hardware_timestamps: false,
        };
        assert_eq!(port.max_frame_len(), 1500 + 14 + 8);
    }

    #[test]
    fn classify_by_speed() {
        assert_eq!(classify("eth0", Some(1000)), PortType::Copper);
        assert_eq!(classify("eth1", Some(10_000)), PortType::Sfp);
        assert_eq!(classify("eth2", Some(100_000)), PortType::FastPathCapable);
        assert_eq!(classify("veth0", Some(100_000)), PortType::Copper);
    }

    #[test]
    fn prefix_from_netmask() {
        assert_eq!(prefix_from_mask("255.255.255.0".parse().unwrap()), 24);
        assert_eq!(prefix_from_mask("255.255.0.0".parse().unwrap()), 16);
    }
}
