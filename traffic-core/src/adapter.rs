//! Control adapter: the one point where external requests cross into
//! the core. Each command validates its arguments, turns into a
//! registry mutation and/or a runner lifecycle event, persists the
//! configuration on success, and returns a structured result. Every
//! command carries a five second deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::PersistedConfig;
use crate::core::{Capabilities, Core};
use crate::error::{CoreError, Result};
use crate::neighbor;
use crate::profile::{ProfileDescriptor, ProfileUpdate};
use crate::registry::{PortView, ProfileView, StatsSnapshot};
use crate::rfc2544::{SweepConfig, SweepReport};
use crate::runner::HotUpdate;

pub const COMMAND_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct ControlAdapter {
    core: Arc<Core>,
}

impl ControlAdapter {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.core.capabilities()
    }

    async fn deadline<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(COMMAND_DEADLINE, op)
            .await
            .map_err(|_| CoreError::Timeout(COMMAND_DEADLINE))?
    }

    /// Rewrite the persisted file after a successful mutation.
    async fn persist(&self) {
        if let Some(path) = self.core.config_path().cloned() {
            let profiles = self.core.registry().export_profiles().await;
            PersistedConfig { profiles }.save_best_effort(&path);
        }
    }

    pub async fn list_ports(&self) -> Result<Vec<PortView>> {
        self.deadline(async { Ok(self.core.registry().list_ports().await) })
            .await
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileView>> {
        self.deadline(async { Ok(self.core.registry().list_profiles().await) })
            .await
    }

    pub async fn get_profile(&self, name: &str) -> Result<ProfileView> {
        self.deadline(self.core.registry().get_profile(name)).await
    }

    pub async fn create_profile(&self, desc: ProfileDescriptor) -> Result<CreateOutcome> {
        let outcome = self
            .deadline(async {
                let name = desc.name.clone();
                let enable = desc.enabled;
                let warnings = self.core.registry().create_profile(desc).await?;
                if enable {
                    self.core.enable_profile(&name).await?;
                }
                Ok(CreateOutcome { name, warnings })
            })
            .await?;
        self.persist().await;
        Ok(outcome)
    }

    pub async fn update_profile(&self, name: &str, update: ProfileUpdate) -> Result<Vec<String>> {
        let warnings = self
            .deadline(async {
                let warnings = self.core.registry().update_profile(name, &update).await?;
                // Push the hot subset into a live runner.
                let state = self.core.registry().state(name).await?;
                if state.is_active() {
                    let desc = self.core.registry().descriptor(name).await?;
                    self.core
                        .runner_handle_update(
                            name,
                            HotUpdate {
                                bandwidth_mbps: desc.bandwidth_mbps,
                                frame_size: desc.frame_size,
                                imix: desc.imix,
                                impairments: desc.impairments,
                            },
                        )
                        .await?;
                }
                Ok(warnings)
            })
            .await?;
        self.persist().await;
        Ok(warnings)
    }

    pub async fn delete_profile(&self, name: &str) -> Result<()> {
        self.deadline(async {
            let state = self.core.registry().state(name).await?;
            if state.is_active() {
                self.core.disable_profile(name).await?;
            }
            self.core.registry().remove_profile(name).await
        })
        .await?;
        self.persist().await;
        Ok(())
    }

    pub async fn enable_profile(&self, name: &str) -> Result<()> {
        self.deadline(self.core.enable_profile(name)).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn disable_profile(&self, name: &str) -> Result<()> {
        self.deadline(self.core.disable_profile(name)).await?;
        self.persist().await;
        Ok(())
    }

    /// Bulk start over every profile flagged enabled.
    pub async fn start_all(&self) -> Result<usize> {
        let started = self
            .deadline(async {
                let mut started = 0usize;
                for name in self.core.registry().enabled_profiles().await {
                    match self.core.enable_profile(&name).await {
                        Ok(()) => started += 1,
                        Err(e) => info!(profile = %name, error = %e, "bulk start skipped"),
                    }
                }
                Ok(started)
            })
            .await?;
        self.persist().await;
        Ok(started)
    }

    /// Bulk stop over every profile flagged enabled.
    pub async fn stop_all(&self) -> Result<usize> {
        let stopped = self
            .deadline(async {
                let mut stopped = 0usize;
                for name in self.core.registry().enabled_profiles().await {
                    match self.core.disable_profile(&name).await {
                        Ok(()) => stopped += 1,
                        Err(e) => info!(profile = %name, error = %e, "bulk stop skipped"),
                    }
                }
                Ok(stopped)
            })
            .await?;
        self.persist().await;
        Ok(stopped)
    }

    pub async fn get_stats(&self) -> Result<StatsSnapshot> {
        self.deadline(async { Ok(self.core.registry().snapshot_stats().await) })
            .await
    }

    pub async fn reset_stats(&self) -> Result<()> {
        self.deadline(async {
            self.core.registry().reset_stats().await;
            Ok(())
        })
        .await
    }

    /// On-demand neighbor refresh, then the refreshed port views.
    pub async fn discover_neighbors(&self, ports: Option<Vec<String>>) -> Result<Vec<PortView>> {
        self.deadline(async {
            let names = match ports {
                Some(names) => names,
                None => self
                    .core
                    .registry()
                    .list_ports()
                    .await
                    .into_iter()
                    .map(|v| v.port.name)
                    .collect(),
            };
            neighbor::refresh_ports(
                self.core.registry(),
                &names,
                neighbor::DEFAULT_SCAN_TIMEOUT,
            )
            .await?;
            let mut views = Vec::with_capacity(names.len());
            for name in &names {
                views.push(self.core.registry().get_port(name).await?);
            }
            Ok(views)
        })
        .await
    }

    /// Start a sweep; the run is identified by the profile name.
    pub async fn rfc2544_start(&self, profile: &str, cfg: SweepConfig) -> Result<String> {
        self.deadline(async {
            self.core.start_sweep(profile, cfg).await?;
            Ok(profile.to_string())
        })
        .await
    }

    pub async fn rfc2544_status(&self, profile: &str) -> Result<SweepReport> {
        self.deadline(self.core.sweep_report(profile)).await
    }
}
