use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource,
    Pod, PodDNSConfig, PodSpec, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::api::core::v1::ResourceRequirements;
use tokio::{
    sync::{broadcast, watch, RwLock},
    time,
};
use tracing::{debug, warn};

use crate::{
    cluster::{self, ClusterApi, LogOptions},
    config::{AgentConfig, EnvPair, ServiceType, UserConfig},
    events::{EventBus, STATS_EVENT},
    scanner::scan_reader,
    server::ServerConfiguration,
    WardenError, WardenResult,
};

use super::{Allocation, Mount, ProcessState, ResourceUsage, Settings, StatePublisher};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of the container running the server process inside its pod.
pub const CONTAINER_NAME: &str = "process";

/// The reserved label carrying the server id on every created object.
pub const LABEL_UUID: &str = "uuid";

/// The reserved label identifying objects managed by this agent.
pub const LABEL_SERVICE: &str = "Service";

/// The reserved label identifying the runtime pod's role.
pub const LABEL_CONTAINER_TYPE: &str = "ContainerType";

const SERVICE_LABEL_VALUE: &str = "Pterodactyl";
const CONTAINER_TYPE_LABEL_VALUE: &str = "server_process";

/// How often resource usage is sampled while attached.
const RESOURCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Invoked with each line of console output while attached.
pub type LogCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// The environment controller for a single server.
///
/// Owns the server's cluster footprint and its in-process lifecycle state.
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Environment {
    id: String,
    config: Arc<AgentConfig>,
    cluster: Arc<dyn ClusterApi>,
    configuration: Arc<RwLock<ServerConfiguration>>,
    state: StatePublisher,
    events: EventBus,
    log_callback: Arc<Mutex<Option<LogCallback>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Environment {
    /// Creates a controller for the given server. The initial state is
    /// [`ProcessState::Offline`].
    pub fn new(
        id: impl Into<String>,
        configuration: Arc<RwLock<ServerConfiguration>>,
        config: Arc<AgentConfig>,
        cluster: Arc<dyn ClusterApi>,
        events: EventBus,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            cluster,
            configuration,
            state: StatePublisher::new(),
            events,
            log_callback: Arc::new(Mutex::new(None)),
        }
    }

    /// The server id this environment manages.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state.state()
    }

    /// Transitions the lifecycle state, notifying subscribers on change.
    pub fn set_state(&self, state: ProcessState) {
        self.state.set_state(state);
    }

    /// Subscribes to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Installs the callback invoked with each console output line.
    /// Invocations are serialised; the callback never runs concurrently with
    /// itself.
    pub fn set_log_callback(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        if let Ok(mut guard) = self.log_callback.lock() {
            *guard = Some(Box::new(callback));
        }
    }

    /// The configured extra mounts, normalised for the workload.
    pub async fn mounts(&self) -> Vec<Mount> {
        self.configuration.read().await.get_settings().get_mounts().clone()
    }

    /// Provisions the server's runtime pod and exposing service.
    ///
    /// Idempotent: if the pod already exists this returns success without
    /// touching anything. The service is created first and may already exist
    /// from an earlier attempt; the pod may not.
    pub async fn create(&self) -> WardenResult<()> {
        match self.cluster.pod_get(&self.id).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(WardenError::environment("failed to inspect pod", err)),
        }

        let configuration = self.configuration.read().await.clone();
        let settings = configuration.get_settings();

        let service = build_service_spec(
            &self.id,
            settings.get_allocation(),
            *self.config.get_cluster().get_service_type(),
        );
        match self.cluster.service_create(service).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(WardenError::environment("failed to create service", err)),
        }

        let pod = build_pod_spec(&self.id, settings, &self.config);
        self.cluster
            .pod_create(pod)
            .await
            .map(|_| ())
            .map_err(|err| WardenError::environment("failed to create pod", err))
    }

    /// Removes the server's pod, service and volume claim.
    ///
    /// Objects that are already gone count as removed. The state passes
    /// through `Stopping` first so the disappearance of the process is not
    /// treated as a crash, and always ends `Offline`.
    pub async fn destroy(&self) -> WardenResult<()> {
        self.state.set_state(ProcessState::Stopping);

        let mut first_error = None;
        let results = [
            self.cluster.pod_delete(&self.id).await,
            self.cluster
                .service_delete(&cluster::service_name(&self.id))
                .await,
            self.cluster
                .pvc_delete(&cluster::volume_claim_name(&self.id))
                .await,
        ];
        for result in results {
            if let Err(err) = result {
                if !err.is_not_found() && first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        self.state.set_state(ProcessState::Offline);

        match first_error {
            None => Ok(()),
            Some(err) => Err(WardenError::environment(
                "failed to remove server resources",
                err,
            )),
        }
    }

    /// Attaches to the running workload without blocking the caller.
    ///
    /// A background task follows the pod's log stream, feeding each line to
    /// the console callback; a second task polls resource usage. Both outlive
    /// this call and wind down when the stream closes or the server goes
    /// offline, at which point the state is forced to `Offline`.
    pub fn attach(&self) {
        let env = self.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        // The poller gets its own lifetime rather than the caller's so that
        // attach returning cannot tear it down mid-flight.
        tokio::spawn(poll_resources(self.clone(), shutdown_rx));

        tokio::spawn(async move {
            let options = LogOptions {
                follow: true,
                tail_lines: None,
            };
            let stream = match env.cluster.pod_logs(&env.id, options).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(server = %env.id, error = %err, "failed to open console log stream");
                    env.state.set_state(ProcessState::Offline);
                    let _ = shutdown_tx.send(());
                    return;
                }
            };

            let callback = env.log_callback.clone();
            let result = scan_reader(stream, |line| {
                if let Ok(mut guard) = callback.lock() {
                    if let Some(callback) = guard.as_mut() {
                        callback(line);
                    }
                }
            })
            .await;

            if let Err(err) = result {
                warn!(server = %env.id, error = %err, "error processing console output stream");
            }

            // The stream closing means the process is gone.
            env.state.set_state(ProcessState::Offline);
            let _ = shutdown_tx.send(());
        });
    }

    /// Writes a command to the server process's stdin.
    ///
    /// There is no acknowledgement that the process consumed it. If the
    /// command is the configured stop command, the server is marked as
    /// stopping before the bytes go out so the exit that follows is not
    /// treated as a crash.
    pub async fn send_command(&self, command: &str) -> WardenResult<()> {
        let stop = self
            .configuration
            .read()
            .await
            .get_settings()
            .get_stop()
            .clone();

        if stop.is_stop_command(command) {
            self.state.set_state(ProcessState::Stopping);
        }

        self.cluster
            .pod_write_stdin(&self.id, CONTAINER_NAME, format!("{}\n", command).as_bytes())
            .await
            .map_err(|err| {
                WardenError::environment("could not write to container stream", err)
            })
    }

    /// Reads the last `lines` lines of the server's log output.
    pub async fn readlog(&self, lines: i64) -> WardenResult<Vec<String>> {
        let options = LogOptions {
            follow: false,
            tail_lines: Some(lines),
        };
        let stream = self
            .cluster
            .pod_logs(&self.id, options)
            .await
            .map_err(|err| WardenError::environment("failed to open log stream", err))?;

        let mut out = Vec::new();
        scan_reader(stream, |line| {
            out.push(String::from_utf8_lossy(line).into_owned());
        })
        .await?;
        Ok(out)
    }

    /// Applies updated resource limits to the running workload.
    ///
    /// Limits cannot change in place in this cluster model; the pod must be
    /// recreated for new values to take effect. This succeeds without doing
    /// anything so callers can persist configuration unconditionally.
    pub async fn in_situ_update(&self) -> WardenResult<()> {
        Ok(())
    }

    /// Blocks until the server reaches `Offline`, up to `timeout`.
    ///
    /// On timeout with `kill` set the environment is destroyed; otherwise the
    /// timeout surfaces as an error.
    pub async fn wait_for_stop(&self, timeout: Duration, kill: bool) -> WardenResult<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == ProcessState::Offline {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if time::timeout(timeout, wait).await.is_ok() {
            return Ok(());
        }
        if kill {
            return self.destroy().await;
        }
        Err(WardenError::StopTimeout)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Samples the workload's resource usage once a second and publishes each
/// snapshot on the event bus.
///
/// Sampling failures are logged and the loop keeps going; the cluster being
/// momentarily unreachable must not kill an attachment. The loop ends on
/// shutdown or once the server is offline.
async fn poll_resources(env: Environment, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = time::interval(RESOURCE_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if env.state.state() == ProcessState::Offline {
                    break;
                }

                match env.cluster.pod_metrics(&env.id).await {
                    Ok(stats) => {
                        // A usage sample exists only for a running pod, so an
                        // optimistic `Starting` can be promoted.
                        if env.state.state() == ProcessState::Starting {
                            env.state.set_state(ProcessState::Running);
                        }

                        let limits = *env
                            .configuration
                            .read()
                            .await
                            .get_settings()
                            .get_limits();
                        let usage = ResourceUsage {
                            memory_bytes: stats.memory_bytes,
                            memory_limit_bytes: limits.bounded_memory_limit().max(0) as u64,
                            cpu_absolute: stats.cpu_nanocores as f64 / 10_000_000.0,
                            state: env.state.state(),
                        };
                        if let Ok(payload) = serde_json::to_string(&usage) {
                            env.events.publish(STATS_EVENT, payload);
                        }
                    }
                    Err(err) => {
                        debug!(server = %env.id, error = %err, "failed to poll resource usage");
                    }
                }
            }
        }
    }
}

/// Merges user labels with the reserved set; reserved keys always win.
pub(crate) fn assemble_labels(
    id: &str,
    user_labels: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = user_labels
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    labels.insert(LABEL_UUID.to_string(), id.to_string());
    labels.insert(LABEL_SERVICE.to_string(), SERVICE_LABEL_VALUE.to_string());
    labels.insert(
        LABEL_CONTAINER_TYPE.to_string(),
        CONTAINER_TYPE_LABEL_VALUE.to_string(),
    );
    labels
}

/// Builds the container environment, dropping pairs with an empty side.
pub(crate) fn container_env(pairs: &[EnvPair]) -> Vec<EnvVar> {
    pairs
        .iter()
        .filter(|pair| pair.is_injectable())
        .map(|pair| EnvVar {
            name: pair.get_var().clone(),
            value: Some(pair.get_value().clone()),
            ..Default::default()
        })
        .collect()
}

/// The security context containers run with, honouring rootless mode.
pub(crate) fn security_context(user: &UserConfig) -> SecurityContext {
    let rootless = user.get_rootless();
    if *rootless.get_enabled() {
        SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(*rootless.get_container_uid()),
            run_as_group: Some(*rootless.get_container_gid()),
            ..Default::default()
        }
    } else {
        SecurityContext {
            run_as_non_root: Some(false),
            run_as_user: Some(*user.get_uid()),
            run_as_group: Some(*user.get_gid()),
            ..Default::default()
        }
    }
}

fn container_ports(allocation: &Allocation) -> Vec<ContainerPort> {
    let default_port = *allocation.get_default_port() as i32;
    let mut ports = vec![
        ContainerPort {
            container_port: default_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ContainerPort {
            container_port: default_port,
            protocol: Some("UDP".to_string()),
            ..Default::default()
        },
    ];
    for binding in allocation.get_bindings() {
        ports.push(ContainerPort {
            container_port: *binding.get_port() as i32,
            protocol: Some(binding.get_proto().as_kubernetes_protocol().to_string()),
            ..Default::default()
        });
    }
    ports
}

fn service_ports(allocation: &Allocation) -> Vec<ServicePort> {
    let default_port = *allocation.get_default_port();
    let mut ports = vec![
        ServicePort {
            name: Some(format!("tcp{}", default_port)),
            port: default_port as i32,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ServicePort {
            name: Some(format!("udp{}", default_port)),
            port: default_port as i32,
            protocol: Some("UDP".to_string()),
            ..Default::default()
        },
    ];
    for binding in allocation.get_bindings() {
        ports.push(ServicePort {
            name: Some(binding.service_port_name()),
            port: *binding.get_port() as i32,
            protocol: Some(binding.get_proto().as_kubernetes_protocol().to_string()),
            ..Default::default()
        });
    }
    ports
}

/// Builds the runtime pod for a server.
pub(crate) fn build_pod_spec(id: &str, settings: &Settings, config: &AgentConfig) -> Pod {
    let limits = settings.get_limits();
    let resources: BTreeMap<String, _> = BTreeMap::from([
        ("cpu".to_string(), limits.cpu_quantity()),
        ("memory".to_string(), limits.memory_quantity()),
    ]);

    let env = container_env(settings.get_environment());

    Pod {
        metadata: ObjectMeta {
            name: Some(id.to_string()),
            labels: Some(assemble_labels(id, settings.get_labels())),
            ..Default::default()
        },
        spec: Some(PodSpec {
            dns_policy: Some("None".to_string()),
            dns_config: Some(PodDNSConfig {
                nameservers: Some(config.get_cluster().get_network().get_dns().clone()),
                ..Default::default()
            }),
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![
                Volume {
                    name: "tmp".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some("Memory".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "storage".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: cluster::volume_claim_name(id),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(settings.get_image().clone()),
                image_pull_policy: Some("Always".to_string()),
                tty: Some(true),
                stdin: Some(true),
                working_dir: Some("/home/container".to_string()),
                ports: Some(container_ports(settings.get_allocation())),
                env: if env.is_empty() { None } else { Some(env) },
                security_context: Some(security_context(config.get_system().get_user())),
                resources: Some(ResourceRequirements {
                    limits: Some(resources.clone()),
                    requests: Some(resources),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "tmp".to_string(),
                        mount_path: "/tmp".to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "storage".to_string(),
                        mount_path: "/home/container".to_string(),
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

/// Builds the service exposing a server's ports.
pub(crate) fn build_service_spec(
    id: &str,
    allocation: &Allocation,
    service_type: ServiceType,
) -> Service {
    let selector = BTreeMap::from([(LABEL_UUID.to_string(), id.to_string())]);

    Service {
        metadata: ObjectMeta {
            name: Some(cluster::service_name(id)),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(service_ports(allocation)),
            selector: Some(selector),
            type_: Some(service_type.as_kubernetes_type().to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
