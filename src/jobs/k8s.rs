//! In-cluster Kubernetes broker.
//!
//! A thin REST client over the batch/v1, core/v1, and metrics.k8s.io/v1beta1
//! APIs, authenticated with the pod's service account. Only `v1beta1` is
//! implemented for pod metrics; that is the contract.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::broker::{
    ContainerUsage, JobHandle, JobStatusCounts, JobSummary, Orchestrator, PodSummary,
};
use super::spec::JobSpec;
use crate::config::Config;
use crate::error::{Error, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Kubernetes-backed [`Orchestrator`].
pub struct KubeBroker {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    token: String,
}

impl KubeBroker {
    /// Construct from the in-cluster environment (service host/port env vars
    /// plus the mounted service-account token and CA bundle).
    pub fn in_cluster(config: &Config) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Config("KUBERNETES_SERVICE_HOST not set (not in a cluster?)".into()))?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa.join("token"))
            .map_err(|e| Error::Config(format!("cannot read service account token: {e}")))?;
        let ca = std::fs::read(sa.join("ca.crt"))
            .map_err(|e| Error::Config(format!("cannot read cluster CA bundle: {e}")))?;
        let certificate = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| Error::Config(format!("invalid cluster CA bundle: {e}")))?;

        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .timeout(std::time::Duration::from_secs(
                config.orchestrator.api_timeout_seconds,
            ))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            namespace: config.orchestrator.namespace.clone(),
            token: token.trim().to_string(),
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.base_url, self.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }

    fn pod_metrics_url(&self, pod: &str) -> String {
        format!(
            "{}/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            self.base_url, self.namespace, pod
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let response = self.authorized(self.client.get(url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Dispatch(format!("GET {url} returned {status}: {body}")));
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl Orchestrator for KubeBroker {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle> {
        let manifest = job_manifest(spec);
        let response = self
            .authorized(self.client.post(self.jobs_url()))
            .json(&manifest)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Dispatch(format!(
                "job submission rejected ({status}): {body}"
            )));
        }
        let created: Value = response.json().await?;
        let handle = JobHandle {
            id: created["metadata"]["uid"].as_str().unwrap_or_default().to_string(),
            name: created["metadata"]["name"]
                .as_str()
                .unwrap_or(&spec.name)
                .to_string(),
        };
        debug!(job = %handle.name, uid = %handle.id, "job created");
        Ok(handle)
    }

    async fn job_status(&self, name: &str) -> Result<Option<JobStatusCounts>> {
        let url = format!("{}/{}", self.jobs_url(), name);
        Ok(self.get_json(&url).await?.map(|job| status_counts(&job)))
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<JobSummary>> {
        let url = format!("{}?labelSelector={}", self.jobs_url(), selector);
        let Some(list) = self.get_json(&url).await? else {
            return Ok(Vec::new());
        };
        let items = list["items"].as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .map(|job| JobSummary {
                id: job["metadata"]["uid"].as_str().unwrap_or_default().to_string(),
                name: job["metadata"]["name"].as_str().unwrap_or_default().to_string(),
                labels: labels_of(job),
                status: status_counts(job),
            })
            .collect())
    }

    async fn delete_job(&self, name: &str, grace_seconds: i64) -> Result<()> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let options = json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "gracePeriodSeconds": grace_seconds,
            "propagationPolicy": "Background",
        });
        let response = self
            .authorized(self.client.delete(&url))
            .json(&options)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Dispatch(format!(
                "failed to delete job {name} ({status})"
            )));
        }
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSummary>> {
        let url = format!("{}?labelSelector={}", self.pods_url(), selector);
        let Some(list) = self.get_json(&url).await? else {
            return Ok(Vec::new());
        };
        let items = list["items"].as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|pod| pod["metadata"]["name"].as_str())
            .map(|name| PodSummary { name: name.to_string() })
            .collect())
    }

    async fn container_usage(
        &self,
        pod: &str,
        container: &str,
    ) -> Result<Option<ContainerUsage>> {
        let Some(metrics) = self.get_json(&self.pod_metrics_url(pod)).await? else {
            return Ok(None);
        };
        let containers = metrics["containers"].as_array().cloned().unwrap_or_default();
        for entry in &containers {
            if entry["name"].as_str() == Some(container) {
                let cpu = entry["usage"]["cpu"]
                    .as_str()
                    .and_then(parse_cpu_millis)
                    .unwrap_or(0);
                let memory = entry["usage"]["memory"]
                    .as_str()
                    .and_then(parse_memory_bytes)
                    .unwrap_or(0);
                return Ok(Some(ContainerUsage {
                    cpu_millis: cpu,
                    memory_bytes: memory,
                }));
            }
        }
        Ok(None)
    }
}

/// Render a [`JobSpec`] as a batch/v1 Job manifest.
fn job_manifest(spec: &JobSpec) -> Value {
    let mut container = json!({
        "name": spec.container_name,
        "image": spec.image,
        "command": wrapped_command(spec),
        "workingDir": spec.working_dir,
        "env": spec.env.iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect::<Vec<_>>(),
    });

    let mut requests = serde_json::Map::new();
    if let Some(cores) = spec.cores_min {
        requests.insert("cpu".to_string(), json!(cores.to_string()));
    }
    if let Some(ram) = spec.ram_min_mb {
        requests.insert("memory".to_string(), json!(format!("{ram}M")));
    }
    if !requests.is_empty() {
        container["resources"] = json!({
            "requests": requests.clone(),
            "limits": requests,
        });
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [container],
    });
    if let Some(mount) = &spec.mount {
        pod_spec["containers"][0]["volumeMounts"] = json!([
            {"name": "run-data", "mountPath": mount}
        ]);
        pod_spec["volumes"] = json!([
            {"name": "run-data", "hostPath": {"path": mount}}
        ]);
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": spec.name,
            "labels": spec.labels,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {"labels": spec.labels},
                "spec": pod_spec,
            },
        },
    })
}

/// Task containers have their stdout redirected into the `stdout` file of
/// the (bind-mounted) working directory, where output capture reads it.
/// Engine containers run their command untouched.
fn wrapped_command(spec: &JobSpec) -> Vec<String> {
    if spec.container_name != super::spec::TASK_CONTAINER {
        return spec.command.clone();
    }
    let mut command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("exec \"$@\" > {}", super::local::STDOUT_FILE),
        "sh".to_string(),
    ];
    command.extend(spec.command.iter().cloned());
    command
}

fn labels_of(job: &Value) -> BTreeMap<String, String> {
    job["metadata"]["labels"]
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn status_counts(job: &Value) -> JobStatusCounts {
    JobStatusCounts {
        active: job["status"]["active"].as_i64().unwrap_or(0),
        succeeded: job["status"]["succeeded"].as_i64().unwrap_or(0),
        failed: job["status"]["failed"].as_i64().unwrap_or(0),
    }
}

/// Parse a Kubernetes CPU quantity into millicores (`1000m == 1 cpu`).
pub(crate) fn parse_cpu_millis(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    if let Some(n) = q.strip_suffix('n') {
        return n.parse::<f64>().ok().map(|v| (v / 1_000_000.0).round() as i64);
    }
    if let Some(u) = q.strip_suffix('u') {
        return u.parse::<f64>().ok().map(|v| (v / 1_000.0).round() as i64);
    }
    if let Some(m) = q.strip_suffix('m') {
        return m.parse::<f64>().ok().map(|v| v.round() as i64);
    }
    q.parse::<f64>().ok().map(|v| (v * 1000.0).round() as i64)
}

/// Parse a Kubernetes memory quantity into bytes.
pub(crate) fn parse_memory_bytes(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    let binary = [
        ("Ki", 1_024_f64),
        ("Mi", 1_048_576_f64),
        ("Gi", 1_073_741_824_f64),
        ("Ti", 1_099_511_627_776_f64),
    ];
    for (suffix, scale) in binary {
        if let Some(n) = q.strip_suffix(suffix) {
            return n.parse::<f64>().ok().map(|v| (v * scale) as i64);
        }
    }
    let decimal = [
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, scale) in decimal {
        if let Some(n) = q.strip_suffix(suffix) {
            return n.parse::<f64>().ok().map(|v| (v * scale) as i64);
        }
    }
    q.parse::<f64>().ok().map(|v| v as i64)
}
