//! Server coordinator.
//!
//! A [`Server`] ties one server's environment controller, event bus and log
//! sinks together and orchestrates the flows that span them: installation,
//! reinstallation and panel state reporting. Single-flight gates guarantee
//! that only one install, transfer or restore runs at a time.

mod configuration;
mod install;

use std::{
    os::unix::fs::PermissionsExt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    fs,
    sync::{broadcast, RwLock},
};
use tracing::{debug, info, warn};

use crate::{
    cluster::ClusterApi,
    config::AgentConfig,
    environment::{Environment, ProcessState},
    events::{EventBus, CONSOLE_OUTPUT_EVENT, INSTALL_COMPLETED_EVENT, INSTALL_STARTED_EVENT},
    panel::{InstallStatusRequest, PanelClient},
    sink::{Sink, SinkName},
    WardenError, WardenResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One logical game workload managed by this agent.
///
/// Cloning is cheap and shares all state; long-running flows hold a clone so
/// the server outlives the call that spawned them.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    uuid: String,
    config: Arc<AgentConfig>,
    cluster: Arc<dyn ClusterApi>,
    panel: Arc<dyn PanelClient>,
    configuration: Arc<RwLock<ServerConfiguration>>,
    environment: Environment,
    events: EventBus,
    console_sink: Sink,
    install_sink: Sink,
    installing: AtomicBool,
    transferring: AtomicBool,
    restoring: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// Holds the single-flight installation gate; releases it when dropped so
/// every exit path of an install gives the lock back.
pub(crate) struct InstallLock {
    server: Server,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Server {
    /// Creates a server from its panel-provided configuration snapshot.
    pub fn new(
        configuration: ServerConfiguration,
        config: Arc<AgentConfig>,
        cluster: Arc<dyn ClusterApi>,
        panel: Arc<dyn PanelClient>,
    ) -> Self {
        let uuid = configuration.get_uuid().clone();
        let configuration = Arc::new(RwLock::new(configuration));
        let events = EventBus::new();
        let console_sink = Sink::new();
        let install_sink = Sink::new();
        let (shutdown_tx, _) = broadcast::channel(1);

        let environment = Environment::new(
            uuid.clone(),
            configuration.clone(),
            config.clone(),
            cluster.clone(),
            events.clone(),
        );

        // Console output fans out to the sink and the event bus.
        {
            let sink = console_sink.clone();
            let events = events.clone();
            environment.set_log_callback(move |line| {
                sink.push(Bytes::copy_from_slice(line));
                events.publish(
                    CONSOLE_OUTPUT_EVENT,
                    String::from_utf8_lossy(line).into_owned(),
                );
            });
        }

        Self {
            inner: Arc::new(ServerInner {
                uuid,
                config,
                cluster,
                panel,
                configuration,
                environment,
                events,
                console_sink,
                install_sink,
                installing: AtomicBool::new(false),
                transferring: AtomicBool::new(false),
                restoring: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// The server's unique identifier.
    pub fn id(&self) -> &str {
        &self.inner.uuid
    }

    /// The server's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The server's environment controller.
    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    /// One of the server's named log sinks.
    pub fn sink(&self, name: SinkName) -> Sink {
        match name {
            SinkName::Console => self.inner.console_sink.clone(),
            SinkName::Install => self.inner.install_sink.clone(),
        }
    }

    /// A snapshot of the server's current configuration.
    pub async fn configuration(&self) -> ServerConfiguration {
        self.inner.configuration.read().await.clone()
    }

    /// Cancels the server's long-running flows, such as an in-flight install.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
    }

    pub(crate) fn agent_config(&self) -> &Arc<AgentConfig> {
        &self.inner.config
    }

    pub(crate) fn cluster(&self) -> Arc<dyn ClusterApi> {
        self.inner.cluster.clone()
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Whether an installation process currently holds the install lock.
    pub fn is_installing(&self) -> bool {
        self.inner.installing.load(Ordering::SeqCst)
    }

    /// Whether the server is being transferred to another node.
    pub fn is_transferring(&self) -> bool {
        self.inner.transferring.load(Ordering::SeqCst)
    }

    /// Flags the server as being transferred.
    pub fn set_transferring(&self, state: bool) {
        self.inner.transferring.store(state, Ordering::SeqCst);
    }

    /// Whether a backup is currently being restored into the server.
    pub fn is_restoring(&self) -> bool {
        self.inner.restoring.load(Ordering::SeqCst)
    }

    /// Flags the server as having a backup restored into it.
    pub fn set_restoring(&self, state: bool) {
        self.inner.restoring.store(state, Ordering::SeqCst);
    }

    pub(crate) fn acquire_install_lock(&self) -> WardenResult<InstallLock> {
        if self
            .inner
            .installing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(InstallLock {
                server: self.clone(),
            })
        } else {
            Err(WardenError::InstallationLock)
        }
    }

    /// Executes the installation stack for this server and reports the
    /// outcome to the panel.
    pub async fn install(&self) -> WardenResult<()> {
        self.install_with(false).await
    }

    /// Reinstalls the server using the panel's installation script.
    ///
    /// A running server is stopped first, forcibly after ten seconds, and the
    /// configuration is re-synced with the panel before the install runs so
    /// the latest definition is used.
    pub async fn reinstall(&self) -> WardenResult<()> {
        if self.inner.environment.state() != ProcessState::Offline {
            debug!(server = %self.id(), "waiting for server instance to enter a stopped state");
            self.inner
                .environment
                .wait_for_stop(Duration::from_secs(10), true)
                .await?;
        }

        info!(
            server = %self.id(),
            "syncing server state with remote source before executing re-installation process"
        );
        self.sync().await?;

        self.install_with(true).await
    }

    async fn install_with(&self, reinstall: bool) -> WardenResult<()> {
        let configuration = self.configuration().await;

        let result = if !configuration.get_skip_egg_scripts() {
            // Only announce the start when a process will actually run,
            // otherwise the panel flashes through an install that never was.
            self.inner.events.publish(INSTALL_STARTED_EVENT, "");
            self.internal_install().await
        } else {
            info!(
                server = %self.id(),
                "server configured to skip running installation scripts, not executing process"
            );
            Ok(())
        };

        debug!(
            server = %self.id(),
            was_successful = result.is_ok(),
            "notifying panel of server install state"
        );
        if let Err(err) = self.sync_install_state(result.is_ok(), reinstall).await {
            warn!(
                server = %self.id(),
                was_successful = result.is_ok(),
                error = %err,
                "failed to notify panel of server install state"
            );
        }

        // Whatever happened above, the server is not running at this point.
        self.inner.environment.set_state(ProcessState::Offline);

        self.inner.events.publish(INSTALL_COMPLETED_EVENT, "");

        result
    }

    async fn internal_install(&self) -> WardenResult<()> {
        let script = self.inner.panel.installation_script(self.id()).await?;
        let process = InstallationProcess::new(self.clone(), script);

        info!(server = %self.id(), "beginning installation process for server");
        process.run().await?;

        info!(server = %self.id(), "completed installation process for server");
        Ok(())
    }

    /// Replaces the configuration snapshot with the panel's current one.
    pub async fn sync(&self) -> WardenResult<()> {
        let configuration = self.inner.panel.server_configuration(self.id()).await?;
        *self.inner.configuration.write().await = configuration;
        Ok(())
    }

    /// Reports the terminal status of an installation to the panel.
    pub async fn sync_install_state(&self, successful: bool, reinstall: bool) -> WardenResult<()> {
        self.inner
            .panel
            .set_installation_status(
                self.id(),
                InstallStatusRequest {
                    successful,
                    reinstall,
                },
            )
            .await
    }

    /// Creates the server's host-side data directory if it is missing.
    pub async fn ensure_data_directory_exists(&self) -> WardenResult<()> {
        let dir = self
            .inner
            .config
            .get_system()
            .get_data_directory()
            .join(self.id());

        fs::create_dir_all(&dir).await?;
        let mut perms = fs::metadata(&dir).await?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&dir, perms).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for InstallLock {
    fn drop(&mut self) {
        debug!(server = %self.server.id(), "releasing installation process lock");
        self.server.inner.installing.store(false, Ordering::SeqCst);
    }
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use configuration::*;
pub use install::*;
