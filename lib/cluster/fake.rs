//! An in-memory cluster double used by lifecycle tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use futures::{channel::mpsc, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, PodStatus, Service};

use super::{ClusterApi, ClusterError, ClusterResult, LogOptions, LogStream, PodStats};

type LogSender = mpsc::UnboundedSender<Result<Vec<u8>, std::io::Error>>;

/// A scriptable, assertable [`ClusterApi`] implementation backed by hash maps.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    pods: HashMap<String, Pod>,
    services: HashMap<String, Service>,
    claims: HashMap<String, PersistentVolumeClaim>,
    config_maps: HashMap<String, ConfigMap>,
    phases: HashMap<String, VecDeque<&'static str>>,
    logs: HashMap<String, Vec<u8>>,
    stdin: HashMap<String, Vec<u8>>,
    stats: PodStats,
    hold_open_logs: bool,
    open_streams: Vec<LogSender>,
    fail_next_pod_create: Option<ClusterError>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Scripts the sequence of phases reported for a pod; the last phase
    /// repeats once the sequence is exhausted.
    pub(crate) fn script_phases(&self, name: &str, phases: &[&'static str]) {
        let mut state = self.state.lock().unwrap();
        state.phases.insert(name.to_string(), phases.iter().copied().collect());
    }

    /// Sets the canned log output returned for a pod.
    pub(crate) fn set_logs(&self, name: &str, logs: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.logs.insert(name.to_string(), logs.to_vec());
    }

    /// Keeps follow-mode log streams open until [`close_log_streams`] is
    /// called, instead of ending them after the canned bytes.
    ///
    /// [`close_log_streams`]: FakeCluster::close_log_streams
    pub(crate) fn hold_open_logs(&self, hold: bool) {
        self.state.lock().unwrap().hold_open_logs = hold;
    }

    /// Ends every follow-mode log stream currently held open.
    pub(crate) fn close_log_streams(&self) {
        self.state.lock().unwrap().open_streams.clear();
    }

    /// Makes the next pod create call fail with the given error.
    pub(crate) fn fail_next_pod_create(&self, err: ClusterError) {
        self.state.lock().unwrap().fail_next_pod_create = Some(err);
    }

    /// Sets the usage sample returned by the metrics endpoint.
    pub(crate) fn set_stats(&self, stats: PodStats) {
        self.state.lock().unwrap().stats = stats;
    }

    pub(crate) fn pod(&self, name: &str) -> Option<Pod> {
        self.state.lock().unwrap().pods.get(name).cloned()
    }

    pub(crate) fn service(&self, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(name).cloned()
    }

    pub(crate) fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.state.lock().unwrap().claims.get(name).cloned()
    }

    pub(crate) fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.state.lock().unwrap().config_maps.get(name).cloned()
    }

    /// Bytes written to a pod's stdin so far.
    pub(crate) fn stdin_for(&self, name: &str) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .stdin
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn advance_phase(state: &mut FakeState, name: &str) -> &'static str {
        match state.phases.get_mut(name) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().copied().unwrap_or("Running"),
            None => "Running",
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn pod_create(&self, pod: Pod) -> ClusterResult<Pod> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next_pod_create.take() {
            return Err(err);
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        if state.pods.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }

        let mut pod = pod;
        pod.metadata.uid = Some(format!("uid-{}", name));
        state.pods.insert(name, pod.clone());
        Ok(pod)
    }

    async fn pod_get(&self, name: &str) -> ClusterResult<Pod> {
        let mut state = self.state.lock().unwrap();
        if !state.pods.contains_key(name) {
            return Err(ClusterError::NotFound);
        }

        let phase = Self::advance_phase(&mut state, name);
        let mut pod = state.pods.get(name).cloned().ok_or(ClusterError::NotFound)?;
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        Ok(pod)
    }

    async fn pod_delete(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or(ClusterError::NotFound)
    }

    async fn service_create(&self, service: Service) -> ClusterResult<Service> {
        let mut state = self.state.lock().unwrap();
        let name = service.metadata.name.clone().unwrap_or_default();
        if state.services.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        state.services.insert(name, service.clone());
        Ok(service)
    }

    async fn service_delete(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .services
            .remove(name)
            .map(|_| ())
            .ok_or(ClusterError::NotFound)
    }

    async fn pvc_create(&self, claim: PersistentVolumeClaim) -> ClusterResult<PersistentVolumeClaim> {
        let mut state = self.state.lock().unwrap();
        let name = claim.metadata.name.clone().unwrap_or_default();
        if state.claims.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        state.claims.insert(name, claim.clone());
        Ok(claim)
    }

    async fn pvc_delete(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .claims
            .remove(name)
            .map(|_| ())
            .ok_or(ClusterError::NotFound)
    }

    async fn config_map_create(&self, map: ConfigMap) -> ClusterResult<ConfigMap> {
        let mut state = self.state.lock().unwrap();
        let name = map.metadata.name.clone().unwrap_or_default();
        if state.config_maps.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        state.config_maps.insert(name, map.clone());
        Ok(map)
    }

    async fn config_map_delete(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .config_maps
            .remove(name)
            .map(|_| ())
            .ok_or(ClusterError::NotFound)
    }

    async fn pod_logs(&self, name: &str, opts: LogOptions) -> ClusterResult<LogStream> {
        let mut state = self.state.lock().unwrap();
        if !state.pods.contains_key(name) {
            return Err(ClusterError::NotFound);
        }

        let mut bytes = state.logs.get(name).cloned().unwrap_or_default();
        if let Some(tail) = opts.tail_lines {
            bytes = tail_bytes(&bytes, tail as usize);
        }

        if opts.follow && state.hold_open_logs {
            let (tx, rx) = mpsc::unbounded();
            let _ = tx.unbounded_send(Ok(bytes));
            state.open_streams.push(tx);
            Ok(Box::pin(rx.into_async_read()))
        } else {
            Ok(Box::pin(futures::io::Cursor::new(bytes)))
        }
    }

    async fn pod_write_stdin(&self, name: &str, _container: &str, data: &[u8]) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.pods.contains_key(name) {
            return Err(ClusterError::NotFound);
        }
        state
            .stdin
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn pod_metrics(&self, name: &str) -> ClusterResult<PodStats> {
        let state = self.state.lock().unwrap();
        if !state.pods.contains_key(name) {
            return Err(ClusterError::NotFound);
        }
        Ok(state.stats)
    }
}

/// Keeps the last `lines` newline-terminated lines of `bytes`.
fn tail_bytes(bytes: &[u8], lines: usize) -> Vec<u8> {
    let split: Vec<&[u8]> = bytes.split_inclusive(|&b| b == b'\n').collect();
    let skip = split.len().saturating_sub(lines);
    split[skip..].concat()
}
