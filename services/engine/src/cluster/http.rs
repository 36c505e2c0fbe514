//! Kubernetes API client using server-side apply.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ApplyOutcome, ClusterApi, ClusterError, ContainerIssue, RolloutStatus};
use crate::config::ClusterConfig;
use crate::manifest::{ClusterObject, ObjectKind, RenderedManifest, WorkloadRef};
use railyard_reconcile::RolloutProgress;

const APPLY_CONTENT_TYPE: &str = "application/apply-patch+yaml";

/// Cluster API client.
pub struct HttpClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    field_manager: String,
}

impl HttpClusterClient {
    /// Create a new client. Reads the bearer token file once.
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClusterError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        let token = match &config.token_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    ClusterError::Unreachable(format!(
                        "failed to read token file {}: {e}",
                        path.display()
                    ))
                })?;
                Some(raw.trim().to_string())
            }
            None => None,
        };

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            field_manager: config.field_manager.clone(),
        })
    }

    fn object_url(&self, kind: ObjectKind, namespace: &str, name: &str) -> String {
        let collection = match kind {
            ObjectKind::Deployment => "apis/apps/v1",
            ObjectKind::Service => "api/v1",
            ObjectKind::CronJob => "apis/batch/v1",
        };
        let resource = match kind {
            ObjectKind::Deployment => "deployments",
            ObjectKind::Service => "services",
            ObjectKind::CronJob => "cronjobs",
        };
        format!(
            "{}/{}/namespaces/{}/{}/{}",
            self.base_url, collection, namespace, resource, name
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn apply_object(&self, object: &ClusterObject) -> Result<ApplyOutcome, ClusterError> {
        let url = self.object_url(object.kind, &object.namespace, &object.name);
        let body = serde_json::to_vec(&object.body)
            .map_err(|e| ClusterError::InvalidResponse(e.to_string()))?;

        debug!(url = %url, kind = object.kind.as_str(), "Applying object");

        let response = self
            .authorize(self.client.patch(&url))
            .query(&[
                ("fieldManager", self.field_manager.as_str()),
                ("force", "true"),
            ])
            .header(reqwest::header::CONTENT_TYPE, APPLY_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::CREATED => Ok(ApplyOutcome::Created),
            status if status.is_success() => Ok(ApplyOutcome::Configured),
            status => Err(error_from_response(status, response).await),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClusterError> {
        let response = self
            .authorize(self.client.get(url))
            .query(query)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(status, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClusterError::InvalidResponse(e.to_string()))
    }

    async fn deployment_progress(&self, workload: &WorkloadRef) -> Result<RolloutProgress, ClusterError> {
        let url = self.object_url(ObjectKind::Deployment, &workload.namespace, &workload.name);
        let object: DeploymentObject = self.get_json(&url, &[]).await?;

        let desired = object.spec.replicas.unwrap_or(1);
        let status = object.status.unwrap_or_default();
        Ok(RolloutProgress {
            desired,
            updated: status.updated_replicas,
            ready: status.ready_replicas,
            available: status.available_replicas,
            observed: status.observed_generation >= object.metadata.generation,
        })
    }

    async fn container_issues(&self, workload: &WorkloadRef) -> Result<Vec<ContainerIssue>, ClusterError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods",
            self.base_url, workload.namespace
        );
        let selector = workload.pod_selector();
        let pods: PodList = self
            .get_json(&url, &[("labelSelector", selector.as_str())])
            .await?;

        let mut issues = Vec::new();
        for pod in pods.items {
            let statuses = pod.status.map(|s| s.container_statuses).unwrap_or_default();
            for container in statuses {
                if let Some(waiting) = container.state.and_then(|s| s.waiting) {
                    issues.push(ContainerIssue {
                        pod: pod.metadata.name.clone(),
                        container: container.name.clone(),
                        reason: waiting.reason.unwrap_or_default(),
                        message: waiting.message.unwrap_or_default(),
                        restart_count: container.restart_count,
                    });
                }
            }
        }
        Ok(issues)
    }
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn apply(&self, manifest: &RenderedManifest) -> Result<ApplyOutcome, ClusterError> {
        let mut created = false;
        for object in &manifest.objects {
            if self.apply_object(object).await? == ApplyOutcome::Created {
                created = true;
            }
        }
        Ok(if created {
            ApplyOutcome::Created
        } else {
            ApplyOutcome::Configured
        })
    }

    async fn rollout_status(&self, workload: &WorkloadRef) -> Result<RolloutStatus, ClusterError> {
        match workload.kind {
            ObjectKind::CronJob => {
                let url = self.object_url(ObjectKind::CronJob, &workload.namespace, &workload.name);
                let _: serde_json::Value = self.get_json(&url, &[]).await?;
                Ok(RolloutStatus {
                    progress: RolloutProgress {
                        observed: true,
                        ..Default::default()
                    },
                    issues: Vec::new(),
                })
            }
            ObjectKind::Deployment | ObjectKind::Service => {
                let progress = self.deployment_progress(workload).await?;
                let issues = match self.container_issues(workload).await {
                    Ok(issues) => issues,
                    Err(e) => {
                        // Counters alone still let the rollout converge.
                        warn!(workload = %workload.name, error = %e, "Failed to list pods");
                        Vec::new()
                    }
                };
                Ok(RolloutStatus { progress, issues })
            }
        }
    }
}

fn request_error(err: reqwest::Error) -> ClusterError {
    if err.is_decode() {
        ClusterError::InvalidResponse(err.to_string())
    } else {
        ClusterError::Unreachable(err.to_string())
    }
}

async fn error_from_response(status: StatusCode, response: reqwest::Response) -> ClusterError {
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StatusObject>(&body)
        .ok()
        .and_then(|s| s.message)
        .unwrap_or(body);
    ClusterError::from_status(status.as_u16(), message)
}

// =============================================================================
// Wire types (only the fields we read)
// =============================================================================

#[derive(Debug, Deserialize)]
struct StatusObject {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    generation: i64,
}

#[derive(Debug, Deserialize)]
struct DeploymentObject {
    #[serde(default)]
    metadata: ObjectMeta,
    spec: DeploymentSpec,
    status: Option<DeploymentStatusWire>,
}

#[derive(Debug, Deserialize)]
struct DeploymentSpec {
    replicas: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DeploymentStatusWire {
    observed_generation: i64,
    updated_replicas: u32,
    ready_replicas: u32,
    available_replicas: u32,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    status: Option<PodStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PodStatus {
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    name: String,
    #[serde(default)]
    restart_count: u32,
    state: Option<ContainerState>,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    waiting: Option<WaitingState>,
}

#[derive(Debug, Deserialize)]
struct WaitingState {
    reason: Option<String>,
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use railyard_id::DeploymentId;
    use railyard_reconcile::SpecHash;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpClusterClient {
        HttpClusterClient::new(&ClusterConfig {
            api_url: server.uri(),
            token_file: None,
            request_timeout: Duration::from_secs(2),
            field_manager: "railyard".to_string(),
            mock: false,
        })
        .unwrap()
    }

    fn manifest() -> RenderedManifest {
        let workload = WorkloadRef {
            kind: ObjectKind::Deployment,
            namespace: "shop".to_string(),
            name: "api".to_string(),
            deployment_id: DeploymentId::new(),
        };
        RenderedManifest {
            objects: vec![ClusterObject {
                kind: ObjectKind::Deployment,
                namespace: "shop".to_string(),
                name: "api".to_string(),
                body: json!({"apiVersion": "apps/v1", "kind": "Deployment"}),
            }],
            workload,
            spec_hash: SpecHash::from_raw("sha256:test"),
        }
    }

    #[tokio::test]
    async fn test_apply_uses_server_side_apply() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/shop/deployments/api"))
            .and(query_param("fieldManager", "railyard"))
            .and(query_param("force", "true"))
            .and(header("content-type", APPLY_CONTENT_TYPE))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server).apply(&manifest()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);
    }

    #[tokio::test]
    async fn test_apply_conflict_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_json(json!({"kind": "Status", "message": "object was modified"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).apply(&manifest()).await.unwrap_err();
        assert_eq!(err, ClusterError::Conflict("object was modified".to_string()));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_apply_validation_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(422).set_body_string("spec.replicas: invalid"))
            .mount(&server)
            .await;

        let err = client(&server).apply(&manifest()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { status: 422, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let server = MockServer::start().await;
        let c = client(&server);
        drop(server);
        let err = c.apply(&manifest()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_rollout_status_reads_counters_and_waiting_pods() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/shop/deployments/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"name": "api", "generation": 4},
                "spec": {"replicas": 3},
                "status": {
                    "observedGeneration": 4,
                    "updatedReplicas": 3,
                    "readyReplicas": 2,
                    "availableReplicas": 2
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/shop/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "metadata": {"name": "api-7d9f-abcde"},
                    "status": {"containerStatuses": [{
                        "name": "api",
                        "restartCount": 6,
                        "state": {"waiting": {
                            "reason": "CrashLoopBackOff",
                            "message": "back-off 5m0s restarting failed container"
                        }}
                    }]}
                }]
            })))
            .mount(&server)
            .await;

        let workload = manifest().workload;
        let status = client(&server).rollout_status(&workload).await.unwrap();
        assert_eq!(
            status.progress,
            RolloutProgress {
                desired: 3,
                updated: 3,
                ready: 2,
                available: 2,
                observed: true
            }
        );
        assert_eq!(status.issues.len(), 1);
        assert_eq!(status.issues[0].reason, "CrashLoopBackOff");
        assert_eq!(status.issues[0].restart_count, 6);
    }

    #[tokio::test]
    async fn test_rollout_status_stale_generation_not_observed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/shop/deployments/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"name": "api", "generation": 5},
                "spec": {"replicas": 1},
                "status": {"observedGeneration": 4, "readyReplicas": 1}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/shop/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;

        let status = client(&server)
            .rollout_status(&manifest().workload)
            .await
            .unwrap();
        assert!(!status.progress.observed);
        assert!(status.issues.is_empty());
    }
}
