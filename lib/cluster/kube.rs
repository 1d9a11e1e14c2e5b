use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use kube::{
    api::{Api, AttachParams, DeleteParams, LogParams, PostParams},
    Client,
};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::config::ClusterConfig;

use super::{ClusterApi, ClusterError, ClusterResult, LogOptions, LogStream, PodStats};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The production [`ClusterApi`] implementation over a Kubernetes client,
/// scoped to the configured namespace.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Wire shape of a `metrics.k8s.io` pod metrics object.
#[derive(Debug, Deserialize)]
struct PodMetricsObject {
    #[serde(default)]
    containers: Vec<ContainerMetricsObject>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetricsObject {
    usage: ContainerUsage,
}

#[derive(Debug, Deserialize)]
struct ContainerUsage {
    #[serde(default)]
    cpu: String,
    #[serde(default)]
    memory: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KubeCluster {
    /// Creates a new facade over an existing client.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connects using the ambient kubeconfig or in-cluster environment and
    /// scopes the facade to the configured namespace.
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let client = Client::try_default().await.map_err(classify)?;
        Ok(Self::new(client, config.get_namespace().clone()))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Deletions remove dependents before reporting completion and skip any
    /// grace period so that stop commands do not race the process shutdown.
    fn delete_params() -> DeleteParams {
        DeleteParams::foreground().grace_period(0)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn pod_create(&self, pod: Pod) -> ClusterResult<Pod> {
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(classify)
    }

    async fn pod_get(&self, name: &str) -> ClusterResult<Pod> {
        self.pods().get(name).await.map_err(classify)
    }

    async fn pod_delete(&self, name: &str) -> ClusterResult<()> {
        self.pods()
            .delete(name, &Self::delete_params())
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn service_create(&self, service: Service) -> ClusterResult<Service> {
        self.services()
            .create(&PostParams::default(), &service)
            .await
            .map_err(classify)
    }

    async fn service_delete(&self, name: &str) -> ClusterResult<()> {
        self.services()
            .delete(name, &Self::delete_params())
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn pvc_create(&self, claim: PersistentVolumeClaim) -> ClusterResult<PersistentVolumeClaim> {
        self.claims()
            .create(&PostParams::default(), &claim)
            .await
            .map_err(classify)
    }

    async fn pvc_delete(&self, name: &str) -> ClusterResult<()> {
        self.claims()
            .delete(name, &Self::delete_params())
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn config_map_create(&self, map: ConfigMap) -> ClusterResult<ConfigMap> {
        self.config_maps()
            .create(&PostParams::default(), &map)
            .await
            .map_err(classify)
    }

    async fn config_map_delete(&self, name: &str) -> ClusterResult<()> {
        self.config_maps()
            .delete(name, &Self::delete_params())
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn pod_logs(&self, name: &str, opts: LogOptions) -> ClusterResult<LogStream> {
        let params = LogParams {
            follow: opts.follow,
            tail_lines: opts.tail_lines,
            ..Default::default()
        };
        let stream = self
            .pods()
            .log_stream(name, &params)
            .await
            .map_err(classify)?;
        Ok(Box::pin(stream))
    }

    async fn pod_write_stdin(&self, name: &str, container: &str, data: &[u8]) -> ClusterResult<()> {
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(false)
            .stderr(false)
            .tty(true);

        let mut attached = self.pods().attach(name, &params).await.map_err(classify)?;
        let mut stdin = attached
            .stdin()
            .ok_or_else(|| ClusterError::Fatal("attach stream exposes no stdin".to_string()))?;

        stdin
            .write_all(data)
            .await
            .map_err(|err| ClusterError::Transient(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| ClusterError::Transient(err.to_string()))?;
        drop(stdin);

        // The write is enqueued; let the websocket wind down on its own so
        // the caller is not held hostage by a slow peer.
        tokio::spawn(async move {
            let _ = attached.join().await;
        });

        Ok(())
    }

    async fn pod_metrics(&self, name: &str) -> ClusterResult<PodStats> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            self.namespace, name
        );
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|err| ClusterError::Fatal(err.to_string()))?;

        let metrics: PodMetricsObject = self.client.request(request).await.map_err(classify)?;

        let mut stats = PodStats::default();
        for container in &metrics.containers {
            stats.cpu_nanocores += parse_cpu_quantity(&container.usage.cpu).unwrap_or_default();
            stats.memory_bytes += parse_memory_quantity(&container.usage.memory).unwrap_or_default();
        }
        Ok(stats)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a raw client error onto the agent's error taxonomy.
fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ClusterError::NotFound,
            409 if response.reason == "AlreadyExists" => ClusterError::AlreadyExists,
            409 => ClusterError::Conflict(response.message),
            429 | 500 | 503 | 504 => ClusterError::Transient(response.message),
            _ => ClusterError::Fatal(response.message),
        },
        kube::Error::HyperError(err) => ClusterError::Transient(err.to_string()),
        kube::Error::Service(err) => ClusterError::Transient(err.to_string()),
        other => ClusterError::Fatal(other.to_string()),
    }
}

/// Parses a CPU quantity (`250n`, `12u`, `5m` or whole cores) to nanocores.
pub(crate) fn parse_cpu_quantity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let (digits, scale) = match quantity.as_bytes().last()? {
        b'n' => (&quantity[..quantity.len() - 1], 1),
        b'u' => (&quantity[..quantity.len() - 1], 1_000),
        b'm' => (&quantity[..quantity.len() - 1], 1_000_000),
        _ => (quantity, 1_000_000_000),
    };
    digits.parse::<u64>().ok().map(|v| v * scale)
}

/// Parses a memory quantity (`128974848`, `64Mi`, `1Gi`, `129M`, ...) to bytes.
pub(crate) fn parse_memory_quantity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let suffixes: [(&str, u64); 10] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
    ];

    for (suffix, scale) in suffixes {
        if let Some(digits) = quantity.strip_suffix(suffix) {
            return digits.parse::<u64>().ok().map(|v| v * scale);
        }
    }
    quantity.parse::<u64>().ok()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
