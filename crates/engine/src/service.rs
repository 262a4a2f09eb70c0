//! Control surface of the update engine.
//!
//! [`UpdateService`] is the long-lived object a frontend (D-Bus shim, CLI,
//! tests) talks to. Install requests are acknowledged immediately; the
//! actual cycle runs on its own task and publishes its life through the
//! status bus. At most one cycle is in flight at a time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sprout_config::Config;
use sprout_errors::{Error, UpdateError};
use sprout_events::{StatusBus, StatusRecord, StatusSubscription};
use sprout_net::{NetClient, NetConfig, SourceFetcher, UpdateSource};
use sprout_signing::{MinisignKey, VerifierFactory};
use sprout_snapshot::{BtrfsSink, SnapshotSink};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gate::{ConfirmationGate, PendingUpdate};
use crate::pipeline::{self, PipelineContext};
use crate::status::StatusMachine;

pub struct UpdateService {
    machine: Arc<StatusMachine>,
    bus: Arc<StatusBus>,
    gate: Arc<ConfirmationGate>,
    fetcher: SourceFetcher,
    sink: Arc<dyn SnapshotSink>,
    verifiers: Arc<dyn VerifierFactory>,
    auto_install: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateService {
    /// Assemble a service around explicit collaborators.
    ///
    /// Runs the startup sweep (when configured) before accepting requests,
    /// so snapshots staged by a previous process never linger.
    pub async fn new(
        config: &Config,
        sink: Arc<dyn SnapshotSink>,
        verifiers: Arc<dyn VerifierFactory>,
    ) -> Result<Self, Error> {
        if config.updates.sweep_staged_on_startup {
            match sink.sweep_staged().await {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => info!(?removed, "swept orphaned staged snapshots"),
                Err(err) => warn!(%err, "startup sweep failed; continuing"),
            }
        }

        let net = NetConfig {
            timeout: Duration::from_secs(config.network.timeout),
            connect_timeout: Duration::from_secs(config.network.connect_timeout),
            ..NetConfig::default()
        };
        let fetcher = SourceFetcher::new(NetClient::new(&net)?);

        let bus = Arc::new(StatusBus::new());
        Ok(Self {
            machine: Arc::new(StatusMachine::new(Arc::clone(&bus))),
            bus,
            gate: Arc::new(ConfirmationGate::new()),
            fetcher,
            sink,
            verifiers,
            auto_install: config.updates.auto_install,
            task: Mutex::new(None),
        })
    }

    /// Production wiring: btrfs sink plus the configured minisign key.
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        let key = MinisignKey::load(config.public_key_path()?)?;
        let sink = BtrfsSink::new(config.rootfs_dir()?, config.deployments_dir()?).await?;
        Self::new(config, Arc::new(sink), Arc::new(key)).await
    }

    /// Current status snapshot. Repeated calls with no intervening
    /// transition return the same record.
    pub fn status(&self) -> StatusRecord {
        self.machine.current()
    }

    /// Subscribe to status transitions. Dropping the subscription is the
    /// only cancellation needed.
    pub fn subscribe(&self) -> StatusSubscription {
        self.bus.subscribe()
    }

    /// Start an update from a local archive file.
    ///
    /// # Errors
    ///
    /// [`UpdateError::AlreadyInProgress`] if a cycle is already running or
    /// parked at the confirmation gate.
    pub fn install_from_file(&self, path: impl Into<std::path::PathBuf>) -> Result<String, Error> {
        self.install(UpdateSource::File(path.into()))
    }

    /// Start an update from a URL.
    ///
    /// # Errors
    ///
    /// [`UpdateError::AlreadyInProgress`] if a cycle is already running or
    /// parked at the confirmation gate.
    pub fn install_from_url(&self, url: impl Into<String>) -> Result<String, Error> {
        self.install(UpdateSource::Url(url.into()))
    }

    fn install(&self, source: UpdateSource) -> Result<String, Error> {
        if self.gate.pending().is_some() {
            return Err(UpdateError::AlreadyInProgress.into());
        }
        // Claims the status machine; the losing side of a race gets
        // AlreadyInProgress here and nothing was spawned for it.
        let desc = source.describe();
        self.machine.begin_cycle(&desc)?;
        self.gate.reset();

        let ctx = PipelineContext {
            machine: Arc::clone(&self.machine),
            gate: Arc::clone(&self.gate),
            sink: Arc::clone(&self.sink),
            verifiers: Arc::clone(&self.verifiers),
            auto_install: self.auto_install,
        };
        let fetcher = self.fetcher.clone();
        let handle = tokio::spawn(pipeline::run(ctx, fetcher, source));
        // Dropping a previous (finished) handle just detaches it.
        *self.task.lock().unwrap() = Some(handle);

        Ok(format!("update from {desc} started"))
    }

    /// The update parked at the confirmation gate, if any.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NoPendingUpdate`] when nothing is awaiting
    /// confirmation.
    pub fn pending_update(&self) -> Result<PendingUpdate, Error> {
        self.gate
            .pending()
            .ok_or_else(|| UpdateError::NoPendingUpdate.into())
    }

    /// Resolve the pending update: `true` commits it, `false` clears it.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NoPendingUpdate`] when nothing is parked;
    /// [`UpdateError::AlreadyResolved`] when this cycle's decision was
    /// already delivered.
    pub fn confirm_update(&self, accept: bool) -> Result<String, Error> {
        self.gate.resolve(accept)?;
        Ok(if accept {
            "update accepted, installing".to_string()
        } else {
            "update rejected, clearing".to_string()
        })
    }

    /// Abandon the in-flight cycle, if any. Mirrors process shutdown: a
    /// staged-but-unconfirmed snapshot is left for the next startup sweep.
    pub async fn shutdown(&self) {
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}
