//! Process-wide port and profile catalogue.
//!
//! One reader/writer lock serializes every descriptor mutation; readers
//! get copy-on-read views and never observe a partial update. Counters
//! live outside the lock as atomics, so `snapshot_stats` reads them
//! lock-free under a single timestamp.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::monotonic_micros;
use crate::neighbor::NeighborCache;
use crate::port::{Port, PortCounterSnapshot, PortCounters};
use crate::profile::{
    ProfileCounterSnapshot, ProfileCounters, ProfileDescriptor, ProfileUpdate, RunnerState,
    dscp_class_name,
};

struct PortEntry {
    port: Port,
    counters: Arc<PortCounters>,
    link_up: Arc<AtomicBool>,
    neighbors: Arc<NeighborCache>,
}

struct ProfileEntry {
    descriptor: ProfileDescriptor,
    state: RunnerState,
    counters: Arc<ProfileCounters>,
    warnings: Vec<String>,
}

#[derive(Default)]
struct Inner {
    ports: BTreeMap<String, PortEntry>,
    profiles: BTreeMap<String, ProfileEntry>,
}

/// Copy-on-read view of one port.
#[derive(Debug, Clone, Serialize)]
pub struct PortView {
    #[serde(flatten)]
    pub port: Port,
    pub status: &'static str,
    pub counters: PortCounterSnapshot,
    pub neighbors: NeighborCache,
}

/// Copy-on-read view of one profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    #[serde(flatten)]
    pub descriptor: ProfileDescriptor,
    #[serde(flatten)]
    pub state: RunnerState,
    pub dscp_class: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub counters: ProfileCounterSnapshot,
}

/// All counters under one consistent timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp_micros: u64,
    pub ports: BTreeMap<String, PortCounterSnapshot>,
    pub profiles: BTreeMap<String, ProfileCounterSnapshot>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one enumerated port. Called once per port at startup;
    /// ports are never removed.
    pub async fn register_port(
        &self,
        port: Port,
        counters: Arc<PortCounters>,
        link_up: Arc<AtomicBool>,
    ) {
        let mut inner = self.inner.write().await;
        info!(port = %port.name, mac = %port.mac, "port registered");
        inner.ports.insert(
            port.name.clone(),
            PortEntry {
                port,
                counters,
                link_up,
                neighbors: Arc::new(NeighborCache::default()),
            },
        );
    }

    fn port_view(entry: &PortEntry) -> PortView {
        PortView {
            port: entry.port.clone(),
            status: if entry.link_up.load(Ordering::Acquire) {
                "ready"
            } else {
                "unavailable"
            },
            counters: entry.counters.snapshot(),
            neighbors: (*entry.neighbors).clone(),
        }
    }

    fn profile_view(entry: &ProfileEntry) -> ProfileView {
        ProfileView {
            descriptor: entry.descriptor.clone(),
            state: entry.state.clone(),
            dscp_class: dscp_class_name(entry.descriptor.dscp),
            warnings: entry.warnings.clone(),
            counters: entry.counters.snapshot(),
        }
    }

    pub async fn list_ports(&self) -> Vec<PortView> {
        let inner = self.inner.read().await;
        inner.ports.values().map(Self::port_view).collect()
    }

    pub async fn get_port(&self, name: &str) -> Result<PortView> {
        let inner = self.inner.read().await;
        inner
            .ports
            .get(name)
            .map(Self::port_view)
            .ok_or_else(|| CoreError::UnknownPort(name.to_string()))
    }

    /// Resolve a port for a profile pipeline: descriptor plus the shared
    /// pieces the runner binds to.
    pub async fn resolve_port(&self, name: &str) -> Result<(Port, Arc<NeighborCache>)> {
        let inner = self.inner.read().await;
        let entry = inner
            .ports
            .get(name)
            .ok_or_else(|| CoreError::UnknownPort(name.to_string()))?;
        Ok((entry.port.clone(), entry.neighbors.clone()))
    }

    pub async fn list_profiles(&self) -> Vec<ProfileView> {
        let inner = self.inner.read().await;
        inner.profiles.values().map(Self::profile_view).collect()
    }

    pub async fn get_profile(&self, name: &str) -> Result<ProfileView> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .get(name)
            .map(Self::profile_view)
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))
    }

    pub async fn descriptor(&self, name: &str) -> Result<ProfileDescriptor> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .get(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))
    }

    pub async fn profile_counters(&self, name: &str) -> Result<Arc<ProfileCounters>> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .get(name)
            .map(|e| e.counters.clone())
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))
    }

    /// Insert a new profile after normalization. Source and destination
    /// ports must already exist; duplicates are rejected on name.
    pub async fn create_profile(&self, mut desc: ProfileDescriptor) -> Result<Vec<String>> {
        let warnings = desc.normalize()?;
        let mut inner = self.inner.write().await;
        if inner.profiles.contains_key(&desc.name) {
            return Err(CoreError::DuplicateProfile(desc.name));
        }
        for port in [&desc.src_port, &desc.dst_port] {
            if !inner.ports.contains_key(port) {
                return Err(CoreError::UnknownPort(port.clone()));
            }
        }
        info!(profile = %desc.name, protocol = desc.protocol.tag(), "profile created");
        inner.profiles.insert(
            desc.name.clone(),
            ProfileEntry {
                descriptor: desc,
                state: RunnerState::Idle,
                counters: Arc::new(ProfileCounters::default()),
                warnings: warnings.clone(),
            },
        );
        Ok(warnings)
    }

    /// Apply a partial update. Hot fields apply any time; cold fields
    /// are rejected while the profile is active.
    pub async fn update_profile(
        &self,
        name: &str,
        update: &ProfileUpdate,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .profiles
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))?;

        let cold = update.cold_fields();
        if entry.state.is_active() && !cold.is_empty() {
            return Err(CoreError::ImmutableWhileRunning(cold.join(", ")));
        }

        let mut candidate = entry.descriptor.clone();
        update.apply_to(&mut candidate);
        candidate.name = entry.descriptor.name.clone();
        let warnings = candidate.normalize()?;
        entry.descriptor = candidate;
        entry.warnings = warnings.clone();
        Ok(warnings)
    }

    /// Remove a profile; callers disable first, active states refuse.
    pub async fn remove_profile(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .profiles
            .get(name)
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))?;
        if !entry.state.is_removable() {
            return Err(CoreError::Validation(format!(
                "profile {name} is still active"
            )));
        }
        inner.profiles.remove(name);
        info!(profile = %name, "profile removed");
        Ok(())
    }

    pub async fn set_state(&self, name: &str, state: RunnerState) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.profiles.get_mut(name) {
            entry.state = state;
        }
    }

    pub async fn state(&self, name: &str) -> Result<RunnerState> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .get(name)
            .map(|e| e.state.clone())
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .profiles
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownProfile(name.to_string()))?;
        entry.descriptor.enabled = enabled;
        Ok(())
    }

    /// Names of profiles flagged enabled, for bulk start.
    pub async fn enabled_profiles(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .values()
            .filter(|e| e.descriptor.enabled)
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    /// Names of profiles currently active, for bulk stop and shutdown.
    pub async fn active_profiles(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .values()
            .filter(|e| e.state.is_active())
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    /// Swap-in a fresh neighbor cache for one port.
    pub async fn update_neighbors(&self, port: &str, cache: NeighborCache) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .ports
            .get_mut(port)
            .ok_or_else(|| CoreError::UnknownPort(port.to_string()))?;
        entry.neighbors = Arc::new(cache);
        Ok(())
    }

    /// Every counter under one timestamp. Lock-free counter reads; the
    /// registry lock only pins the catalogue shape.
    pub async fn snapshot_stats(&self) -> StatsSnapshot {
        let inner = self.inner.read().await;
        let timestamp_micros = monotonic_micros();
        StatsSnapshot {
            timestamp_micros,
            ports: inner
                .ports
                .iter()
                .map(|(n, e)| (n.clone(), e.counters.snapshot()))
                .collect(),
            profiles: inner
                .profiles
                .iter()
                .map(|(n, e)| (n.clone(), e.counters.snapshot()))
                .collect(),
        }
    }

    /// Zero all port and profile counters.
    pub async fn reset_stats(&self) {
        let inner = self.inner.read().await;
        for entry in inner.ports.values() {
            entry.counters.reset();
        }
        for entry in inner.profiles.values() {
            entry.counters.reset();
        }
        info!("counters reset");
    }

    /// Descriptors for persistence, in name order.
    pub async fn export_profiles(&self) -> Vec<ProfileDescriptor> {
        let inner = self.inner.read().await;
        inner
            .profiles
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }
}
