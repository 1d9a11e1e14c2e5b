use std::{collections::BTreeMap, os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use futures::AsyncReadExt;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::{fs, io::AsyncWriteExt, time};
use tracing::{debug, info, warn};

use crate::{
    cluster::{self, pod_phase, LogOptions, PodPhase},
    config::{EnvPair, UserConfig},
    environment::pod::{container_env, security_context, LABEL_UUID},
    environment::ResourceLimits,
    events::DAEMON_MESSAGE_EVENT,
    panel::InstallationScript,
    scanner::scan_reader,
    sink::SinkName,
    WardenError, WardenResult,
};

use super::Server;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of the container inside the installer pod.
pub const INSTALLER_CONTAINER_NAME: &str = "installer";

/// Where the installation script is mounted inside the installer pod.
const INSTALL_MOUNT_PATH: &str = "/mnt/install";

/// Where the server volume is mounted inside the installer pod.
const SERVER_MOUNT_PATH: &str = "/mnt/server";

/// How often the installer pod's phase is polled.
const PHASE_POLL_INTERVAL: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single run of a server's installation script.
///
/// Installation is two-phased by necessity: the install image and the runtime
/// image differ, the script must fail fast without ever starting the game
/// process, and the volume claim has to be reset before the install yet kept
/// afterwards. An ephemeral pod runs the script against the claim; the claim
/// then carries the installed files into the runtime pod.
pub struct InstallationProcess {
    server: Server,
    script: InstallationScript,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstallationProcess {
    /// Creates a new installation process for the server.
    pub fn new(server: Server, script: InstallationScript) -> Self {
        Self { server, script }
    }

    /// Runs the full installation stack while holding the per-server install
    /// lock. At most one installation runs per server at any moment; a second
    /// caller fails immediately rather than queueing.
    pub async fn run(&self) -> WardenResult<()> {
        debug!(server = %self.uuid(), "acquiring installation process lock");
        let _lock = self.server.acquire_install_lock()?;

        self.before_execute().await?;

        match self.execute().await {
            Err(err) => {
                // Never leave a half-finished installer behind.
                let _ = self.remove_container().await;
                Err(err)
            }
            Ok(container_id) => {
                // A failure here is internal bookkeeping and does not affect
                // the installed server.
                if let Err(err) = self.after_execute(&container_id).await {
                    warn!(
                        server = %self.uuid(),
                        error = %err,
                        "failed to complete after-execute step of installation process"
                    );
                }
                Ok(())
            }
        }
    }

    /// Prepares the node and the cluster for a clean install: writes the
    /// script to disk and removes any volume claim, installer pod or config
    /// map left over from a previous run. Deleting the claim is the reset
    /// point that guarantees installs start from empty storage.
    pub async fn before_execute(&self) -> WardenResult<()> {
        self.write_script_to_disk().await?;

        match self
            .server
            .cluster()
            .pvc_delete(&cluster::volume_claim_name(self.uuid()))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return Err(WardenError::install(
                    "failed to remove pvc before running installation",
                    err,
                ))
            }
        }

        self.remove_container().await
    }

    /// Provisions the install artifacts and runs the script to completion.
    ///
    /// Returns the installer pod's unique id. The claim survives this call;
    /// the pod and config map are removed afterwards.
    pub async fn execute(&self) -> WardenResult<String> {
        let result = self.execute_inner().await;

        // The script reaches the pod through the config map; the on-disk copy
        // has served its purpose.
        if let Err(err) = fs::remove_dir_all(self.temp_dir()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    server = %self.uuid(),
                    error = %err,
                    "failed to remove temporary data directory after install process"
                );
            }
        }

        result
    }

    /// Persists the installer output to the install log, then removes the
    /// installer pod and config map.
    pub async fn after_execute(&self, container_id: &str) -> WardenResult<()> {
        let result = self.write_install_log(container_id).await;

        if let Err(err) = self.remove_container().await {
            warn!(
                server = %self.uuid(),
                error = %err,
                "failed to remove installer artifacts after installation"
            );
        }

        result
    }

    /// Removes the installer pod and its config map. Objects that are already
    /// gone count as removed.
    pub async fn remove_container(&self) -> WardenResult<()> {
        let client = self.server.cluster();

        match client
            .pod_delete(&cluster::installer_pod_name(self.uuid()))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(WardenError::install("failed to remove installer pod", err)),
        }

        match client
            .config_map_delete(&cluster::config_map_name(self.uuid()))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return Err(WardenError::install(
                    "failed to remove install config map",
                    err,
                ))
            }
        }

        Ok(())
    }

    /// The location of the persisted install log for this server.
    pub fn log_path(&self) -> PathBuf {
        self.server
            .agent_config()
            .get_system()
            .get_log_directory()
            .join("install")
            .join(format!("{}.log", self.uuid()))
    }

    fn uuid(&self) -> &str {
        self.server.id()
    }

    fn temp_dir(&self) -> PathBuf {
        self.server
            .agent_config()
            .get_system()
            .get_tmp_directory()
            .join(self.uuid())
    }

    /// Writes the installation script to the node so the config map can be
    /// built from exactly what would run. Lines are normalised to `\n`.
    async fn write_script_to_disk(&self) -> WardenResult<()> {
        let dir = self.temp_dir();
        fs::create_dir_all(&dir).await?;
        let mut perms = fs::metadata(&dir).await?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&dir, perms).await?;

        let mut contents = String::new();
        for line in self.script.get_script().lines() {
            contents.push_str(line);
            contents.push('\n');
        }

        let path = dir.join("install.sh");
        fs::write(&path, contents).await?;
        let mut perms = fs::metadata(&path).await?.permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).await?;

        Ok(())
    }

    async fn execute_inner(&self) -> WardenResult<String> {
        let client = self.server.cluster();
        let contents = fs::read_to_string(self.temp_dir().join("install.sh")).await?;

        let map = build_config_map(self.uuid(), &contents);
        match client.config_map_create(map).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {
                warn!(server = %self.uuid(), "install config map already exists, reusing it");
            }
            Err(err) => return Err(WardenError::install("failed to create config map", err)),
        }

        let configuration = self.server.configuration().await;
        let claim = build_volume_claim(
            self.uuid(),
            configuration.get_settings().get_limits(),
            self.server.agent_config().get_cluster().get_storage_class(),
        );
        client
            .pvc_create(claim)
            .await
            .map_err(|err| WardenError::install("failed to create pvc", err))?;

        self.server.ensure_data_directory_exists().await?;

        let pod = build_installer_pod(
            self.uuid(),
            &self.script,
            configuration.get_settings().get_environment(),
            self.server.agent_config().get_system().get_user(),
        );
        info!(
            server = %self.uuid(),
            install_script = %self.temp_dir().join("install.sh").display(),
            "creating install container for server process"
        );
        let created = client
            .pod_create(pod)
            .await
            .map_err(|err| WardenError::install("failed to create installer pod", err))?;
        let container_id = created.metadata.uid.unwrap_or_default();
        info!(
            server = %self.uuid(),
            container_id = %container_id,
            "running installation script for server in container"
        );

        // Follow the installer output in the background; the install itself
        // works without it, the console just stays quiet.
        tokio::spawn(stream_output(self.server.clone()));

        // Poll until the script terminates. There is no upper bound here;
        // cancellation comes from the server being shut down.
        let installer_name = cluster::installer_pod_name(self.uuid());
        let mut shutdown = self.server.subscribe_shutdown();
        let mut ticker = time::interval(PHASE_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Err(WardenError::InstallationCancelled),
                _ = ticker.tick() => {
                    let pod = client
                        .pod_get(&installer_name)
                        .await
                        .map_err(|err| WardenError::install("failed to inspect installer pod", err))?;
                    match pod_phase(&pod) {
                        PodPhase::Succeeded => break,
                        PodPhase::Failed => {
                            return Err(WardenError::InstallFailed(
                                "installation pod entered a failed phase".to_string(),
                            ))
                        }
                        _ => {}
                    }
                }
            }
        }

        self.server
            .events()
            .publish(DAEMON_MESSAGE_EVENT, "Installation process completed.");

        Ok(container_id)
    }

    /// Writes a human-readable header followed by the full installer output
    /// to the install log file.
    async fn write_install_log(&self, container_id: &str) -> WardenResult<()> {
        debug!(
            server = %self.uuid(),
            container_id = %container_id,
            "pulling installation logs for server"
        );
        let mut stream = self
            .server
            .cluster()
            .pod_logs(
                &cluster::installer_pod_name(self.uuid()),
                LogOptions {
                    follow: false,
                    tail_lines: None,
                },
            )
            .await
            .map_err(|err| WardenError::install("failed to open installer log stream", err))?;

        let path = self.log_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        debug!(
            server = %self.uuid(),
            path = %path.display(),
            "writing most recent installation logs to disk"
        );

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        let mut perms = fs::metadata(&path).await?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms).await?;

        let configuration = self.server.configuration().await;
        let header = render_log_header(
            self.uuid(),
            &self.script,
            configuration.get_settings().get_environment(),
        );
        file.write_all(header.as_bytes()).await?;

        let mut buffer = [0u8; 8192];
        loop {
            let read = stream.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Waits for the installer pod to start, then relays its output into the
/// install sink until the stream closes.
async fn stream_output(server: Server) {
    let uuid = server.id().to_string();
    let client = server.cluster();
    let name = cluster::installer_pod_name(&uuid);

    server.events().publish(
        DAEMON_MESSAGE_EVENT,
        "Starting installation process, this could take a few minutes...",
    );

    let mut shutdown = server.subscribe_shutdown();
    let mut ticker = time::interval(PHASE_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                match client.pod_get(&name).await {
                    // Terminal phases still have logs worth collecting.
                    Ok(pod) => match pod_phase(&pod) {
                        PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed => break,
                        _ => {}
                    },
                    Err(err) if err.is_not_found() => return,
                    Err(err) => {
                        debug!(server = %uuid, error = %err, "failed to poll installer pod phase");
                    }
                }
            }
        }
    }

    let options = LogOptions {
        follow: true,
        tail_lines: None,
    };
    let stream = match client.pod_logs(&name, options).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(server = %uuid, error = %err, "error connecting to server install stream output");
            return;
        }
    };

    let sink = server.sink(SinkName::Install);
    if let Err(err) = scan_reader(stream, |line| sink.push(Bytes::copy_from_slice(line))).await {
        warn!(server = %uuid, error = %err, "error processing install output lines");
    }
}

/// Renders the header written above the script output in the install log.
fn render_log_header(uuid: &str, script: &InstallationScript, envs: &[EnvPair]) -> String {
    let mut variables = String::new();
    for pair in envs {
        variables.push_str("  ");
        variables.push_str(&pair.to_string());
        variables.push('\n');
    }

    format!(
        "Pterodactyl Server Installation Log\n\
         \n\
         |\n\
         | Details\n\
         | ------------------------------\n\
         \x20 Server UUID:          {uuid}\n\
         \x20 Container Image:      {image}\n\
         \x20 Container Entrypoint: {entrypoint}\n\
         \x20 Pulled At:            {pulled_at}\n\
         \n\
         |\n\
         | Environment Variables\n\
         | ------------------------------\n\
         {variables}\n\
         |\n\
         | Script Output\n\
         | ------------------------------\n",
        uuid = uuid,
        image = script.get_container_image(),
        entrypoint = script.get_entrypoint(),
        pulled_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        variables = variables,
    )
}

/// Builds the config map carrying the installation script.
fn build_config_map(uuid: &str, script: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(cluster::config_map_name(uuid)),
            labels: Some(BTreeMap::from([(LABEL_UUID.to_string(), uuid.to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "install.sh".to_string(),
            script.to_string(),
        )])),
        ..Default::default()
    }
}

/// Builds the server's volume claim, sized to the disk quota.
fn build_volume_claim(
    uuid: &str,
    limits: &ResourceLimits,
    storage_class: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(cluster::volume_claim_name(uuid)),
            labels: Some(BTreeMap::from([(LABEL_UUID.to_string(), uuid.to_string())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    limits.disk_quantity(),
                )])),
                ..Default::default()
            }),
            storage_class_name: Some(storage_class.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the ephemeral installer pod: script mounted read-only from the
/// config map, the server volume mounted where the script expects to write.
fn build_installer_pod(
    uuid: &str,
    script: &InstallationScript,
    envs: &[EnvPair],
    user: &UserConfig,
) -> Pod {
    let env = container_env(envs);

    Pod {
        metadata: ObjectMeta {
            name: Some(cluster::installer_pod_name(uuid)),
            labels: Some(BTreeMap::from([(LABEL_UUID.to_string(), uuid.to_string())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![
                Volume {
                    name: "storage".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: cluster::volume_claim_name(uuid),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "configmap".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(cluster::config_map_name(uuid)),
                        default_mode: Some(0o755),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            containers: vec![Container {
                name: INSTALLER_CONTAINER_NAME.to_string(),
                image: Some(script.get_container_image().clone()),
                command: Some(vec![format!("{}/install.sh", INSTALL_MOUNT_PATH)]),
                env: if env.is_empty() { None } else { Some(env) },
                security_context: if *user.get_rootless().get_enabled() {
                    Some(security_context(user))
                } else {
                    None
                },
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "configmap".to_string(),
                        mount_path: INSTALL_MOUNT_PATH.to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "storage".to_string(),
                        mount_path: SERVER_MOUNT_PATH.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use crate::cluster::fake::FakeCluster;
    use crate::config::{AgentConfig, ClusterConfig, SystemConfig};
    use crate::environment::{
        Allocation, ProcessState, ResourceLimits, Settings, StopConfiguration, StopMethod,
    };
    use crate::events::{Event, INSTALL_COMPLETED_EVENT, INSTALL_STARTED_EVENT};
    use crate::panel::{InstallStatusRequest, PanelClient};
    use crate::server::ServerConfiguration;

    const UUID: &str = "0e4059ca-d79b-46a5-8ec4-95bd0736d150";

    struct MockPanel {
        script: Mutex<InstallationScript>,
        configuration: Mutex<Option<ServerConfiguration>>,
        statuses: Mutex<Vec<InstallStatusRequest>>,
        syncs: AtomicUsize,
    }

    impl MockPanel {
        fn new(script: InstallationScript) -> Self {
            Self {
                script: Mutex::new(script),
                configuration: Mutex::new(None),
                statuses: Mutex::new(Vec::new()),
                syncs: AtomicUsize::new(0),
            }
        }

        fn statuses(&self) -> Vec<InstallStatusRequest> {
            self.statuses.lock().unwrap().clone()
        }

        fn set_configuration(&self, configuration: ServerConfiguration) {
            *self.configuration.lock().unwrap() = Some(configuration);
        }

        fn sync_count(&self) -> usize {
            self.syncs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PanelClient for MockPanel {
        async fn installation_script(&self, _uuid: &str) -> WardenResult<InstallationScript> {
            Ok(self.script.lock().unwrap().clone())
        }

        async fn set_installation_status(
            &self,
            _uuid: &str,
            status: InstallStatusRequest,
        ) -> WardenResult<()> {
            self.statuses.lock().unwrap().push(status);
            Ok(())
        }

        async fn server_configuration(&self, _uuid: &str) -> WardenResult<ServerConfiguration> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            self.configuration
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| WardenError::Panel("no configuration staged".to_string()))
        }
    }

    fn test_script() -> InstallationScript {
        InstallationScript::builder()
            .container_image("alpine:3.18")
            .entrypoint("ash")
            .script("#!/bin/sh\necho ok")
            .build()
    }

    fn test_settings() -> Settings {
        Settings::builder()
            .image("ghcr.io/parkervcp/yolks:java_17")
            .stop(
                StopConfiguration::builder()
                    .method(StopMethod::Command)
                    .value("stop")
                    .build(),
            )
            .environment(vec![EnvPair::new("SERVER_JARFILE", "server.jar")])
            .allocation(Allocation::builder().default_port(25565).build())
            .limits(ResourceLimits::new(100, 512, 1024))
            .build()
    }

    fn test_configuration() -> ServerConfiguration {
        ServerConfiguration::builder()
            .uuid(UUID)
            .settings(test_settings())
            .build()
    }

    fn agent_config(root: &std::path::Path) -> AgentConfig {
        AgentConfig::builder()
            .cluster(
                ClusterConfig::builder()
                    .namespace("gameservers")
                    .storage_class("local-path")
                    .build(),
            )
            .system(
                SystemConfig::builder()
                    .data_directory(root.join("data"))
                    .tmp_directory(root.join("tmp"))
                    .log_directory(root.join("log"))
                    .build(),
            )
            .build()
    }

    fn test_server(
        fake: &Arc<FakeCluster>,
        panel: &Arc<MockPanel>,
        root: &std::path::Path,
    ) -> Server {
        Server::new(
            test_configuration(),
            Arc::new(agent_config(root)),
            fake.clone(),
            panel.clone(),
        )
    }

    async fn drain_until_completed(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut seen = Vec::new();
        time::timeout(Duration::from_secs(30), async {
            loop {
                let event = rx.recv().await.unwrap();
                let done = event.get_topic() == INSTALL_COMPLETED_EVENT;
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_runs_the_two_phase_flow() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let server = test_server(&fake, &panel, root.path());

        let installer = cluster::installer_pod_name(UUID);
        fake.script_phases(&installer, &["Pending", "Running", "Succeeded"]);
        fake.set_logs(&installer, b"ok\n");

        let mut events = server.events().subscribe();
        server.install().await?;

        // The claim is provisioned to the disk quota and survives the run.
        let claim = fake
            .claim(&cluster::volume_claim_name(UUID))
            .expect("claim should survive the install");
        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce".to_string()]);
        assert_eq!(spec.storage_class_name.as_deref(), Some("local-path"));
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            k8s_openapi::apimachinery::pkg::api::resource::Quantity("1Gi".into())
        );

        // The installer pod and config map do not outlive the run.
        assert!(fake.pod(&installer).is_none());
        assert!(fake.config_map(&cluster::config_map_name(UUID)).is_none());

        // The install log carries the header banner, then the script output.
        let log_path = root.path().join("log").join("install").join(format!("{}.log", UUID));
        let contents = std::fs::read_to_string(&log_path)?;
        let first_line = contents
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap();
        assert!(first_line.starts_with("Pterodactyl Server Installation Log"));
        assert!(contents.contains("SERVER_JARFILE=server.jar"));
        assert!(contents.contains("Container Image:      alpine:3.18"));
        assert!(contents.ends_with("| ------------------------------\nok\n"));

        // The transient script directory is gone.
        assert!(!root.path().join("tmp").join(UUID).exists());

        // The panel heard about the outcome exactly once.
        assert_eq!(
            panel.statuses(),
            vec![InstallStatusRequest {
                successful: true,
                reinstall: false,
            }]
        );

        let seen = drain_until_completed(&mut events).await;
        assert!(seen.iter().any(|e| e.get_topic() == INSTALL_STARTED_EVENT));
        assert!(seen
            .iter()
            .any(|e| e.get_topic() == DAEMON_MESSAGE_EVENT
                && e.get_data() == "Installation process completed."));

        assert_eq!(server.environment().state(), ProcessState::Offline);
        assert!(!server.is_installing());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_install_reports_and_cleans_up() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let server = test_server(&fake, &panel, root.path());

        let installer = cluster::installer_pod_name(UUID);
        fake.script_phases(&installer, &["Pending", "Failed"]);

        let mut events = server.events().subscribe();
        let err = server.install().await.unwrap_err();
        assert!(matches!(err, WardenError::InstallFailed(_)));

        // The installer artifacts are force-removed on failure; the claim is
        // left for the next attempt to reset.
        assert!(fake.pod(&installer).is_none());
        assert!(fake.config_map(&cluster::config_map_name(UUID)).is_none());
        assert!(fake.claim(&cluster::volume_claim_name(UUID)).is_some());

        assert_eq!(
            panel.statuses(),
            vec![InstallStatusRequest {
                successful: false,
                reinstall: false,
            }]
        );

        let seen = drain_until_completed(&mut events).await;
        assert!(seen.iter().any(|e| e.get_topic() == INSTALL_COMPLETED_EVENT));
        assert_eq!(server.environment().state(), ProcessState::Offline);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_installs_are_single_flight() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let server = test_server(&fake, &panel, root.path());

        let installer = cluster::installer_pod_name(UUID);
        fake.script_phases(&installer, &["Pending", "Running", "Succeeded"]);
        fake.set_logs(&installer, b"ok\n");

        let second = server.clone();
        let (first_result, second_result) = tokio::join!(server.install(), second.install());

        let failures: Vec<String> = [&first_result, &second_result]
            .iter()
            .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
            .collect();
        assert_eq!(failures, vec!["install: cannot obtain installation lock".to_string()]);
        assert_eq!(
            first_result.is_ok() as u8 + second_result.is_ok() as u8,
            1,
            "exactly one install may win the lock"
        );

        // Both outcomes were reported, and no duplicate artifacts exist.
        let statuses = panel.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.iter().filter(|s| s.successful).count(), 1);
        assert!(fake.pod(&installer).is_none());
        assert!(!server.is_installing());
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_egg_scripts_bypasses_the_installer() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let configuration = ServerConfiguration::builder()
            .uuid(UUID)
            .skip_egg_scripts(true)
            .settings(test_settings())
            .build();
        let server = Server::new(
            configuration,
            Arc::new(agent_config(root.path())),
            fake.clone(),
            panel.clone(),
        );

        let mut events = server.events().subscribe();
        server.install().await?;

        assert!(fake.pod(&cluster::installer_pod_name(UUID)).is_none());
        assert!(fake.claim(&cluster::volume_claim_name(UUID)).is_none());
        assert_eq!(
            panel.statuses(),
            vec![InstallStatusRequest {
                successful: true,
                reinstall: false,
            }]
        );

        let seen = drain_until_completed(&mut events).await;
        assert!(!seen.iter().any(|e| e.get_topic() == INSTALL_STARTED_EVENT));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinstall_stops_server_then_syncs_and_installs() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let server = test_server(&fake, &panel, root.path());

        let base = test_settings();
        let updated = Settings::builder()
            .image("ghcr.io/parkervcp/yolks:java_21")
            .stop(base.get_stop().clone())
            .environment(base.get_environment().clone())
            .allocation(base.get_allocation().clone())
            .limits(*base.get_limits())
            .build();
        panel.set_configuration(
            ServerConfiguration::builder()
                .uuid(UUID)
                .settings(updated)
                .build(),
        );

        let installer = cluster::installer_pod_name(UUID);
        fake.script_phases(&installer, &["Pending", "Running", "Succeeded"]);
        fake.set_logs(&installer, b"ok\n");

        // A running server has to be stopped before reinstalling; with no
        // process to exit, the ten second grace elapses and the environment
        // is destroyed.
        server.environment().create().await?;
        server.environment().set_state(ProcessState::Running);

        server.reinstall().await?;

        assert_eq!(panel.sync_count(), 1);
        assert_eq!(
            server.configuration().await.get_settings().get_image(),
            "ghcr.io/parkervcp/yolks:java_21"
        );
        assert_eq!(
            panel.statuses(),
            vec![InstallStatusRequest {
                successful: true,
                reinstall: true,
            }]
        );
        assert_eq!(server.environment().state(), ProcessState::Offline);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_a_hung_install() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let server = test_server(&fake, &panel, root.path());

        // The installer pod never leaves Pending, e.g. an unpullable image.
        let installer = cluster::installer_pod_name(UUID);
        fake.script_phases(&installer, &["Pending"]);

        let installing = server.clone();
        let handle = tokio::spawn(async move { installing.install().await });

        // Give the install time to reach the phase-polling loop.
        time::sleep(Duration::from_secs(5)).await;
        server.shutdown();

        let err = handle.await?.unwrap_err();
        assert!(matches!(err, WardenError::InstallationCancelled));
        assert!(fake.pod(&installer).is_none());
        assert_eq!(
            panel.statuses(),
            vec![InstallStatusRequest {
                successful: false,
                reinstall: false,
            }]
        );
        assert!(!server.is_installing());
        Ok(())
    }

    #[tokio::test]
    async fn test_before_execute_is_idempotent() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let fake = Arc::new(FakeCluster::new());
        let panel = Arc::new(MockPanel::new(test_script()));
        let server = test_server(&fake, &panel, root.path());
        let process = InstallationProcess::new(
            server,
            InstallationScript::builder()
                .container_image("alpine:3.18")
                .entrypoint("ash")
                .script("#!/bin/sh\r\necho ok")
                .build(),
        );

        for _ in 0..2 {
            process.before_execute().await?;

            assert!(fake.claim(&cluster::volume_claim_name(UUID)).is_none());
            assert!(fake.pod(&cluster::installer_pod_name(UUID)).is_none());
            assert!(fake.config_map(&cluster::config_map_name(UUID)).is_none());

            // The script lands on disk with normalised line endings.
            let script = std::fs::read_to_string(
                root.path().join("tmp").join(UUID).join("install.sh"),
            )?;
            assert_eq!(script, "#!/bin/sh\necho ok\n");
        }
        Ok(())
    }

    #[test]
    fn test_log_header_layout() {
        let header = render_log_header(
            UUID,
            &test_script(),
            &[EnvPair::new("SERVER_JARFILE", "server.jar")],
        );

        assert!(header.starts_with("Pterodactyl Server Installation Log\n"));
        assert!(header.contains(&format!("Server UUID:          {}", UUID)));
        assert!(header.contains("Container Image:      alpine:3.18"));
        assert!(header.contains("Container Entrypoint: ash"));
        assert!(header.contains("Pulled At:            20"));
        assert!(header.contains("  SERVER_JARFILE=server.jar\n"));
        assert!(header.ends_with("| Script Output\n| ------------------------------\n"));
    }

    #[test]
    fn test_installer_pod_spec() {
        let pod = build_installer_pod(
            UUID,
            &test_script(),
            &[EnvPair::new("SERVER_JARFILE", "server.jar"), EnvPair::new("EMPTY", "")],
            &crate::config::UserConfig::default(),
        );

        assert_eq!(pod.metadata.name.as_deref(), Some(format!("{}-installer", UUID).as_str()));
        assert_eq!(
            pod.metadata.labels.unwrap().get("uuid"),
            Some(&UUID.to_string())
        );

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let container = &spec.containers[0];
        assert_eq!(container.name, INSTALLER_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("alpine:3.18"));
        assert_eq!(
            container.command.clone().unwrap(),
            vec!["/mnt/install/install.sh".to_string()]
        );
        assert_eq!(container.env.as_ref().unwrap().len(), 1);
        // Rootless mode is off, so the installer runs with the image default.
        assert!(container.security_context.is_none());

        let mounts: Vec<(String, String)> = container
            .volume_mounts
            .clone()
            .unwrap()
            .into_iter()
            .map(|m| (m.name, m.mount_path))
            .collect();
        assert_eq!(
            mounts,
            vec![
                ("configmap".to_string(), "/mnt/install".to_string()),
                ("storage".to_string(), "/mnt/server".to_string()),
            ]
        );

        let volumes = spec.volumes.unwrap();
        assert_eq!(
            volumes[1].config_map.as_ref().unwrap().default_mode,
            Some(0o755)
        );
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            format!("{}-pvc", UUID)
        );
    }
}
