//! Process lifecycle: one `Core` value owns the registry, the per-port
//! transmitters, the per-profile runners, the prober, and any benchmark
//! sweeps. Constructed at startup, passed to the control adapter, torn
//! down explicitly on shutdown. No module-level singletons.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PersistedConfig;
use crate::error::{CoreError, Result};
use crate::neighbor;
use crate::port::{enumerate_ports, MacAddr, Port, PortCounters};
use crate::registry::Registry;
use crate::rfc2544::{self, RawTrialIo, SweepConfig, SweepReport, SweepStatus};
use crate::runner::{self, RunnerHandle};
use crate::transmitter::{self, FrameSink, RawSocket, TxHandle, TX_QUEUE_DEPTH};

/// Subsystem presence, fixed at startup. The control plane registers
/// endpoints only for capabilities that are present; there is no
/// runtime "maybe available" state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    /// Kernel-bypass datapath; declared, never required.
    pub fast_path: bool,
    pub hardware_timestamps: bool,
    pub rfc2544: bool,
    pub neighbor_discovery: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            fast_path: false,
            hardware_timestamps: false,
            rfc2544: true,
            neighbor_discovery: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Persisted configuration path; None runs without persistence.
    pub config_path: Option<PathBuf>,
    /// Restrict enumeration to these devices; None takes every port.
    pub interfaces: Option<Vec<String>>,
    pub prober_interval: Duration,
    pub capabilities: Capabilities,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            interfaces: None,
            prober_interval: neighbor::DEFAULT_SCAN_INTERVAL,
            capabilities: Capabilities::default(),
        }
    }
}

struct SweepHandle {
    report: Arc<std::sync::Mutex<SweepReport>>,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct Core {
    registry: Arc<Registry>,
    transmitters: Arc<HashMap<String, TxHandle>>,
    runners: Mutex<HashMap<String, RunnerHandle>>,
    sweeps: Mutex<HashMap<String, SweepHandle>>,
    capabilities: Capabilities,
    config_path: Option<PathBuf>,
    prober: Option<JoinHandle<()>>,
}

impl Core {
    /// Enumerate host ports, bind a raw socket per port, recreate the
    /// persisted profiles, and bring the enabled ones up.
    pub async fn start(opts: CoreOptions) -> Result<Arc<Self>> {
        let ports = enumerate_ports(opts.interfaces.as_deref())?;
        if ports.is_empty() {
            return Err(CoreError::Config(
                "no usable network ports enumerated".into(),
            ));
        }

        let mut bound: Vec<(Port, Box<dyn FrameSink>)> = Vec::with_capacity(ports.len());
        for mut port in ports {
            let socket = RawSocket::open(&port.name)?;
            if opts.capabilities.hardware_timestamps {
                port.hardware_timestamps = socket.try_enable_hw_timestamps();
            }
            bound.push((port, Box::new(socket)));
        }
        Self::assemble(bound, opts).await
    }

    /// Wire a core from already-bound ports. Test entry point; `start`
    /// is the production path.
    pub(crate) async fn assemble(
        ports: Vec<(Port, Box<dyn FrameSink>)>,
        opts: CoreOptions,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Registry::new());
        let mut transmitters = HashMap::new();
        let mut port_names = Vec::new();

        for (port, sink) in ports {
            let counters = Arc::new(PortCounters::default());
            let link_up = Arc::new(AtomicBool::new(false));
            let handle = transmitter::spawn(
                &port,
                sink,
                counters.clone(),
                link_up.clone(),
                TX_QUEUE_DEPTH,
            );
            port_names.push(port.name.clone());
            registry
                .register_port(port, counters, link_up)
                .await;
            transmitters.insert(handle.port().to_string(), handle);
        }

        let prober = opts.capabilities.neighbor_discovery.then(|| {
            neighbor::spawn_prober(
                registry.clone(),
                port_names,
                opts.prober_interval,
                neighbor::DEFAULT_SCAN_TIMEOUT,
            )
        });

        let core = Arc::new(Self {
            registry,
            transmitters: Arc::new(transmitters),
            runners: Mutex::new(HashMap::new()),
            sweeps: Mutex::new(HashMap::new()),
            capabilities: opts.capabilities,
            config_path: opts.config_path,
            prober,
        });

        core.restore_persisted().await?;
        Ok(core)
    }

    /// Recreate profiles from the persisted file and enable the ones
    /// that were enabled when the process last ran.
    async fn restore_persisted(&self) -> Result<()> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let persisted = PersistedConfig::load(&path)?;
        for desc in persisted.profiles {
            let name = desc.name.clone();
            let was_enabled = desc.enabled;
            match self.registry.create_profile(desc).await {
                Ok(_) => {
                    if was_enabled {
                        if let Err(e) = self.enable_profile(&name).await {
                            warn!(profile = %name, error = %e, "restore enable failed");
                        }
                    }
                }
                Err(e) => warn!(profile = %name, error = %e, "persisted profile rejected"),
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub(crate) fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    /// Bring one profile up. Enabling an already-active profile is a
    /// no-op, so enable/disable/enable converges to a single enable.
    pub(crate) async fn enable_profile(&self, name: &str) -> Result<()> {
        let state = self.registry.state(name).await?;
        if state.is_active() {
            return Ok(());
        }
        let mut runners = self.runners.lock().await;
        if let Some(stale) = runners.remove(name) {
            // A failed runner's task has already exited; drop the handle.
            drop(stale);
        }
        let (handle, ready) = runner::spawn(
            name.to_string(),
            self.registry.clone(),
            self.transmitters.clone(),
        );
        match ready.await {
            Ok(Ok(())) => {
                runners.insert(name.to_string(), handle);
                self.registry.set_enabled(name, true).await?;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::UnknownProfile(name.to_string())),
        }
    }

    /// Take one profile down, waiting out the drain grace.
    pub(crate) async fn disable_profile(&self, name: &str) -> Result<()> {
        // Existence check first so unknown names 404 rather than no-op.
        let _ = self.registry.state(name).await?;
        self.registry.set_enabled(name, false).await?;
        let handle = self.runners.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.disable(&self.registry).await;
        }
        Ok(())
    }

    pub(crate) async fn runner_handle_update(
        &self,
        name: &str,
        update: runner::HotUpdate,
    ) -> Result<()> {
        let runners = self.runners.lock().await;
        match runners.get(name) {
            Some(handle) => handle.update(update).await,
            None => Ok(()), // not running; registry change suffices
        }
    }

    /// Kick off an RFC2544 sweep for one profile.
    pub(crate) async fn start_sweep(&self, profile: &str, cfg: SweepConfig) -> Result<()> {
        if !self.capabilities.rfc2544 {
            return Err(CoreError::Validation(
                "rfc2544 capability not present in this build".into(),
            ));
        }
        let desc = self.registry.descriptor(profile).await?;
        let (src_port, src_neighbors) = self.registry.resolve_port(&desc.src_port).await?;
        let _ = self.registry.resolve_port(&desc.dst_port).await?;
        let tx = self
            .transmitters
            .get(&desc.src_port)
            .cloned()
            .ok_or_else(|| CoreError::UnknownPort(desc.src_port.clone()))?;

        let dst_mac = src_neighbors
            .lookup_mac(&desc.dst_ip)
            .unwrap_or(MacAddr::BROADCAST);
        let (template, _) = runner::make_template(&desc, &src_port, dst_mac);
        let nominal = src_port.speed_mbps.unwrap_or(1000) as f64;

        let io = RawTrialIo::new(template, tx, desc.dst_port.clone());
        self.spawn_sweep(profile, cfg, nominal, io).await
    }

    /// Register and launch the sweep task; the I/O seam is generic so
    /// the duplicate/cancel plumbing is testable without raw sockets.
    async fn spawn_sweep<T: rfc2544::TrialIo + 'static>(
        &self,
        profile: &str,
        cfg: SweepConfig,
        nominal: f64,
        io: T,
    ) -> Result<()> {
        let mut sweeps = self.sweeps.lock().await;
        if let Some(existing) = sweeps.get(profile) {
            if existing.report.lock().unwrap().status == SweepStatus::Running {
                return Err(CoreError::SweepInProgress(profile.to_string()));
            }
        }

        let report = Arc::new(std::sync::Mutex::new(SweepReport::new(profile)));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let report_for_task = report.clone();
        let join = tokio::spawn(async move {
            let mut io = io;
            rfc2544::run_sweep(&mut io, &cfg, nominal, cancel_rx, report_for_task).await;
        });

        info!(profile = %profile, "rfc2544 sweep started");
        sweeps.insert(
            profile.to_string(),
            SweepHandle {
                report,
                cancel: cancel_tx,
                join,
            },
        );
        Ok(())
    }

    pub(crate) async fn sweep_report(&self, profile: &str) -> Result<SweepReport> {
        let sweeps = self.sweeps.lock().await;
        sweeps
            .get(profile)
            .map(|h| h.report.lock().unwrap().clone())
            .ok_or_else(|| CoreError::UnknownProfile(profile.to_string()))
    }

    /// Signal-driven teardown: disable every active profile within its
    /// grace, cancel sweeps, stop the prober, drain the transmitters.
    pub async fn shutdown(&self) {
        info!("core shutting down");
        for name in self.registry.active_profiles().await {
            if let Err(e) = self.disable_profile(&name).await {
                warn!(profile = %name, error = %e, "disable during shutdown failed");
            }
        }

        let mut sweeps = self.sweeps.lock().await;
        for (name, mut handle) in sweeps.drain() {
            let _ = handle.cancel.send(true);
            // One second to reach a step boundary, then hard abort.
            if tokio::time::timeout(Duration::from_secs(1), &mut handle.join)
                .await
                .is_err()
            {
                warn!(profile = %name, "sweep missed cancel window, aborting");
                handle.join.abort();
            }
        }

        if let Some(prober) = &self.prober {
            prober.abort();
        }
        for handle in self.transmitters.values() {
            handle.shutdown().await;
        }
        info!("core stopped");
    }
}
