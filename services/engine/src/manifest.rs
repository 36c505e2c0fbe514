//! Cluster manifest rendering.
//!
//! One render function per workload kind. Rendering is pure: the same
//! service, release, environment and deployment always yield byte-identical
//! objects and therefore the same [`SpecHash`].

use railyard_id::DeploymentId;
use railyard_reconcile::{ReconcileError, RollingUpdate, RolloutBound, SpecHash};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::model::{
    Deployment, Environment, Release, ResourceSpec, Service, ServiceConfig, WorkloadKind,
    DEFAULT_PORT,
};

pub const LABEL_SERVICE: &str = "railyard.dev/service";
pub const LABEL_PROJECT: &str = "railyard.dev/project";
pub const LABEL_RELEASE: &str = "railyard.dev/release";
pub const LABEL_DEPLOYMENT: &str = "railyard.dev/deployment";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const ANNOTATION_SPEC_HASH: &str = "railyard.dev/spec-hash";
pub const ANNOTATION_COMMIT: &str = "railyard.dev/source-commit";
pub const ANNOTATION_VERSION: &str = "railyard.dev/release-version";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("release {0} has no deployable image")]
    MissingImage(String),

    #[error("service name {0:?} cannot be used as a cluster object name")]
    InvalidName(String),

    #[error(transparent)]
    InvalidRollout(#[from] ReconcileError),
}

/// The cluster object types the engine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Deployment,
    Service,
    CronJob,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::CronJob => "CronJob",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Deployment => "apps/v1",
            Self::Service => "v1",
            Self::CronJob => "batch/v1",
        }
    }
}

/// One object to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObject {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub body: Value,
}

/// The object whose rollout the health verifier watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub deployment_id: DeploymentId,
}

impl WorkloadRef {
    /// Label selector matching this deployment's pods.
    pub fn pod_selector(&self) -> String {
        format!("{}={}", LABEL_DEPLOYMENT, self.deployment_id)
    }
}

/// Output of [`render_manifest`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedManifest {
    pub workload: WorkloadRef,
    pub objects: Vec<ClusterObject>,
    pub spec_hash: SpecHash,
}

/// Everything a manifest is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct ManifestInput<'a> {
    pub service: &'a Service,
    pub release: &'a Release,
    pub environment: &'a Environment,
    pub deployment: &'a Deployment,
}

/// Renders the cluster objects for one deployment.
pub fn render_manifest(input: &ManifestInput<'_>) -> Result<RenderedManifest, ManifestError> {
    let image = input
        .release
        .deployable_image()
        .ok_or_else(|| ManifestError::MissingImage(input.release.id.to_string()))?;
    let name = object_name(&input.service.name)?;
    let ctx = RenderContext {
        input,
        image,
        name,
        namespace: input.environment.namespace.clone(),
    };

    let config = &input.service.config;
    let (workload, mut objects) = match &config.workload {
        WorkloadKind::Web {
            port,
            health_path,
            readiness_path,
        } => {
            let port = resolve_port(*port, config);
            let readiness = readiness_path.as_deref().unwrap_or(health_path);
            render_web(&ctx, port, health_path, readiness)?
        }
        WorkloadKind::Worker { command } => render_worker(&ctx, command)?,
        WorkloadKind::Cron { schedule, command } => render_cron(&ctx, schedule, command),
    };

    let spec_hash = SpecHash::from_json(&Value::Array(
        objects.iter().map(|o| o.body.clone()).collect(),
    ));
    for object in &mut objects {
        if let Some(annotations) = object.body["metadata"]["annotations"].as_object_mut() {
            annotations.insert(
                ANNOTATION_SPEC_HASH.to_string(),
                Value::from(spec_hash.as_str()),
            );
        }
    }

    Ok(RenderedManifest {
        workload,
        objects,
        spec_hash,
    })
}

struct RenderContext<'a> {
    input: &'a ManifestInput<'a>,
    image: &'a str,
    name: String,
    namespace: String,
}

impl RenderContext<'_> {
    fn selector(&self) -> Value {
        json!({ LABEL_SERVICE: self.name })
    }

    fn labels(&self) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert(LABEL_SERVICE.into(), Value::from(self.name.as_str()));
        labels.insert(
            LABEL_PROJECT.into(),
            Value::from(self.input.service.project_id.to_string()),
        );
        labels.insert(
            LABEL_RELEASE.into(),
            Value::from(self.input.release.id.to_string()),
        );
        labels.insert(LABEL_MANAGED_BY.into(), Value::from("railyard"));
        labels
    }

    fn pod_labels(&self) -> Map<String, Value> {
        let mut labels = self.labels();
        labels.insert(
            LABEL_DEPLOYMENT.into(),
            Value::from(self.input.deployment.id.to_string()),
        );
        labels
    }

    fn metadata(&self, name: &str) -> Value {
        let mut annotations = Map::new();
        annotations.insert(
            ANNOTATION_VERSION.into(),
            Value::from(self.input.release.version.as_str()),
        );
        if let Some(commit) = &self.input.release.source_commit {
            annotations.insert(ANNOTATION_COMMIT.into(), Value::from(commit.as_str()));
        }
        json!({
            "name": name,
            "namespace": self.namespace,
            "labels": self.labels(),
            "annotations": annotations,
        })
    }

    fn object(&self, kind: ObjectKind, body: Map<String, Value>) -> ClusterObject {
        let mut full = Map::new();
        full.insert("apiVersion".into(), Value::from(kind.api_version()));
        full.insert("kind".into(), Value::from(kind.as_str()));
        full.insert("metadata".into(), self.metadata(&self.name));
        full.extend(body);
        ClusterObject {
            kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            body: Value::Object(full),
        }
    }

    fn workload_ref(&self, kind: ObjectKind) -> WorkloadRef {
        WorkloadRef {
            kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            deployment_id: self.input.deployment.id,
        }
    }

    fn env(&self, port: Option<u16>) -> Vec<Value> {
        let config = &self.input.service.config;
        let mut vars = config.env.clone();
        vars.insert("RAILYARD_SERVICE_NAME".into(), self.input.service.name.clone());
        vars.insert(
            "RAILYARD_RELEASE_VERSION".into(),
            self.input.release.version.clone(),
        );
        vars.insert(
            "RAILYARD_DEPLOYMENT_ID".into(),
            self.input.deployment.id.to_string(),
        );
        vars.insert(
            "RAILYARD_ENVIRONMENT".into(),
            self.input.environment.name.clone(),
        );
        if let Some(port) = port {
            vars.insert("PORT".into(), port.to_string());
        }
        vars.into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect()
    }

    fn container(&self, command: &[String], port: Option<u16>) -> Map<String, Value> {
        let mut container = Map::new();
        container.insert("name".into(), Value::from(self.name.as_str()));
        container.insert("image".into(), Value::from(self.image));
        container.insert("imagePullPolicy".into(), Value::from("IfNotPresent"));
        container.insert("env".into(), Value::Array(self.env(port)));
        container.insert(
            "resources".into(),
            resources(&self.input.service.config.resources),
        );
        if !command.is_empty() {
            container.insert("command".into(), json!(command));
        }
        container
    }

    fn rolling_update(&self) -> Result<Value, ManifestError> {
        let config = &self.input.service.config;
        let defaults = RollingUpdate::default();
        let rolling = RollingUpdate {
            max_surge: parse_bound(config.max_surge.as_deref(), defaults.max_surge)?,
            max_unavailable: parse_bound(
                config.max_unavailable.as_deref(),
                defaults.max_unavailable,
            )?,
        };
        Ok(json!({
            "type": "RollingUpdate",
            "rollingUpdate": {
                "maxSurge": rolling.max_surge.to_json(),
                "maxUnavailable": rolling.max_unavailable.to_json(),
            }
        }))
    }

    fn deployment(&self, container: Map<String, Value>) -> Result<ClusterObject, ManifestError> {
        let strategy = self.rolling_update()?;
        let spec = json!({
            "replicas": self.input.service.config.replicas,
            "revisionHistoryLimit": 10,
            "selector": { "matchLabels": self.selector() },
            "strategy": strategy,
            "template": {
                "metadata": { "labels": self.pod_labels() },
                "spec": { "containers": [container] },
            },
        });
        Ok(self.object(ObjectKind::Deployment, spec_body(spec)))
    }
}

fn render_web(
    ctx: &RenderContext<'_>,
    port: u16,
    health_path: &str,
    readiness_path: &str,
) -> Result<(WorkloadRef, Vec<ClusterObject>), ManifestError> {
    let mut container = ctx.container(&[], Some(port));
    container.insert(
        "ports".into(),
        json!([{ "name": "http", "containerPort": port, "protocol": "TCP" }]),
    );
    container.insert(
        "livenessProbe".into(),
        json!({
            "httpGet": { "path": health_path, "port": port },
            "initialDelaySeconds": 30,
            "timeoutSeconds": 5,
            "periodSeconds": 10,
            "failureThreshold": 3,
        }),
    );
    container.insert(
        "readinessProbe".into(),
        json!({
            "httpGet": { "path": readiness_path, "port": port },
            "initialDelaySeconds": 5,
            "timeoutSeconds": 3,
            "periodSeconds": 5,
            "failureThreshold": 2,
        }),
    );

    let deployment = ctx.deployment(container)?;
    let service = ctx.object(
        ObjectKind::Service,
        spec_body(json!({
            "type": "ClusterIP",
            "selector": ctx.selector(),
            "ports": [{ "name": "http", "port": 80, "targetPort": port, "protocol": "TCP" }],
        })),
    );

    Ok((ctx.workload_ref(ObjectKind::Deployment), vec![deployment, service]))
}

fn render_worker(
    ctx: &RenderContext<'_>,
    command: &[String],
) -> Result<(WorkloadRef, Vec<ClusterObject>), ManifestError> {
    let container = ctx.container(command, None);
    let deployment = ctx.deployment(container)?;
    Ok((ctx.workload_ref(ObjectKind::Deployment), vec![deployment]))
}

fn render_cron(
    ctx: &RenderContext<'_>,
    schedule: &str,
    command: &[String],
) -> (WorkloadRef, Vec<ClusterObject>) {
    let container = ctx.container(command, None);
    let cron = ctx.object(
        ObjectKind::CronJob,
        spec_body(json!({
            "schedule": schedule,
            "concurrencyPolicy": "Forbid",
            "successfulJobsHistoryLimit": 3,
            "failedJobsHistoryLimit": 1,
            "jobTemplate": {
                "spec": {
                    "backoffLimit": 2,
                    "template": {
                        "metadata": { "labels": ctx.pod_labels() },
                        "spec": {
                            "restartPolicy": "OnFailure",
                            "containers": [container],
                        },
                    },
                },
            },
        })),
    );
    (ctx.workload_ref(ObjectKind::CronJob), vec![cron])
}

fn spec_body(spec: Value) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("spec".into(), spec);
    body
}

fn resources(spec: &ResourceSpec) -> Value {
    json!({
        "requests": { "cpu": spec.cpu_request, "memory": spec.memory_request },
        "limits": { "cpu": spec.cpu_limit, "memory": spec.memory_limit },
    })
}

fn parse_bound(raw: Option<&str>, default: RolloutBound) -> Result<RolloutBound, ManifestError> {
    match raw {
        Some(raw) => Ok(RolloutBound::parse(raw)?),
        None => Ok(default),
    }
}

/// Port precedence: workload setting, then a numeric `PORT` env var, then
/// the platform default.
fn resolve_port(explicit: Option<u16>, config: &ServiceConfig) -> u16 {
    explicit
        .or_else(|| config.env.get("PORT").and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT)
}

/// Lowercases and replaces anything outside `[a-z0-9-]`.
fn object_name(service_name: &str) -> Result<String, ManifestError> {
    let mut name: String = service_name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(63);
    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        return Err(ManifestError::InvalidName(service_name.to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReleaseStatus, ServiceConfig};
    use chrono::Utc;
    use railyard_id::{EnvId, ProjectId, ReleaseId, ServiceId};
    use std::collections::BTreeMap;

    struct Fixture {
        service: Service,
        release: Release,
        environment: Environment,
        deployment: Deployment,
    }

    impl Fixture {
        fn new(workload: WorkloadKind) -> Self {
            let project_id = ProjectId::new();
            let service = Service {
                id: ServiceId::new(),
                project_id,
                name: "Checkout_API".to_string(),
                build_ref: "git@example.com:shop/checkout.git".to_string(),
                config: ServiceConfig {
                    workload,
                    replicas: 3,
                    env: BTreeMap::from([("LOG_FORMAT".to_string(), "json".to_string())]),
                    ..Default::default()
                },
                created_at: Utc::now(),
                deleted_at: None,
            };
            let release = Release {
                id: ReleaseId::new(),
                service_id: service.id,
                version: "v42".to_string(),
                image: Some("registry.example.com/checkout:v42".to_string()),
                source_commit: Some("abc123".to_string()),
                status: ReleaseStatus::Ready,
                created_at: Utc::now(),
                ready_at: Some(Utc::now()),
            };
            let environment = Environment {
                id: EnvId::new(),
                project_id,
                name: "production".to_string(),
                namespace: "shop-production".to_string(),
                created_at: Utc::now(),
            };
            let deployment = Deployment::pending(service.id, environment.id, release.id, 3);
            Self {
                service,
                release,
                environment,
                deployment,
            }
        }

        fn input(&self) -> ManifestInput<'_> {
            ManifestInput {
                service: &self.service,
                release: &self.release,
                environment: &self.environment,
                deployment: &self.deployment,
            }
        }
    }

    #[test]
    fn test_web_renders_deployment_and_service() {
        let fx = Fixture::new(WorkloadKind::web());
        let manifest = render_manifest(&fx.input()).unwrap();

        assert_eq!(manifest.objects.len(), 2);
        assert_eq!(manifest.workload.kind, ObjectKind::Deployment);
        assert_eq!(manifest.workload.name, "checkout-api");
        assert_eq!(manifest.workload.namespace, "shop-production");

        let deployment = &manifest.objects[0].body;
        assert_eq!(deployment["spec"]["replicas"], 3);
        let container = &deployment["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "registry.example.com/checkout:v42");
        assert_eq!(container["ports"][0]["containerPort"], 4200);
        assert_eq!(container["livenessProbe"]["httpGet"]["path"], "/health");
        assert_eq!(container["readinessProbe"]["failureThreshold"], 2);
        assert_eq!(container["resources"]["limits"]["memory"], "512Mi");
        assert_eq!(
            deployment["spec"]["strategy"]["rollingUpdate"]["maxSurge"],
            "25%"
        );

        let service = &manifest.objects[1].body;
        assert_eq!(service["kind"], "Service");
        assert_eq!(service["spec"]["ports"][0]["targetPort"], 4200);
    }

    #[test]
    fn test_standard_env_vars_injected() {
        let fx = Fixture::new(WorkloadKind::web());
        let manifest = render_manifest(&fx.input()).unwrap();
        let env = manifest.objects[0].body["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .clone();
        let get = |name: &str| {
            env.iter()
                .find(|e| e["name"] == name)
                .map(|e| e["value"].as_str().unwrap().to_string())
        };
        assert_eq!(get("RAILYARD_RELEASE_VERSION").as_deref(), Some("v42"));
        assert_eq!(get("PORT").as_deref(), Some("4200"));
        assert_eq!(get("LOG_FORMAT").as_deref(), Some("json"));
        assert_eq!(
            get("RAILYARD_DEPLOYMENT_ID"),
            Some(fx.deployment.id.to_string())
        );
    }

    #[test]
    fn test_port_from_env() {
        let mut fx = Fixture::new(WorkloadKind::web());
        fx.service
            .config
            .env
            .insert("PORT".to_string(), "8080".to_string());
        let manifest = render_manifest(&fx.input()).unwrap();
        let container = &manifest.objects[0].body["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 8080);
    }

    #[test]
    fn test_worker_has_no_service_or_probes() {
        let fx = Fixture::new(WorkloadKind::Worker {
            command: vec!["bin/worker".to_string()],
        });
        let manifest = render_manifest(&fx.input()).unwrap();
        assert_eq!(manifest.objects.len(), 1);
        let container = &manifest.objects[0].body["spec"]["template"]["spec"]["containers"][0];
        assert!(container.get("livenessProbe").is_none());
        assert_eq!(container["command"][0], "bin/worker");
    }

    #[test]
    fn test_cron_renders_cronjob() {
        let fx = Fixture::new(WorkloadKind::Cron {
            schedule: "0 3 * * *".to_string(),
            command: vec!["bin/nightly".to_string()],
        });
        let manifest = render_manifest(&fx.input()).unwrap();
        assert_eq!(manifest.workload.kind, ObjectKind::CronJob);
        let body = &manifest.objects[0].body;
        assert_eq!(body["apiVersion"], "batch/v1");
        assert_eq!(body["spec"]["concurrencyPolicy"], "Forbid");
        assert_eq!(
            body["spec"]["jobTemplate"]["spec"]["template"]["spec"]["restartPolicy"],
            "OnFailure"
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let fx = Fixture::new(WorkloadKind::web());
        let a = render_manifest(&fx.input()).unwrap();
        let b = render_manifest(&fx.input()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.objects[0].body["metadata"]["annotations"][ANNOTATION_SPEC_HASH],
            a.spec_hash.as_str()
        );
    }

    #[test]
    fn test_release_change_changes_hash() {
        let mut fx = Fixture::new(WorkloadKind::web());
        let before = render_manifest(&fx.input()).unwrap().spec_hash;
        fx.release.image = Some("registry.example.com/checkout:v43".to_string());
        let after = render_manifest(&fx.input()).unwrap().spec_hash;
        assert_ne!(before, after);
    }

    #[test]
    fn test_unready_release_rejected() {
        let mut fx = Fixture::new(WorkloadKind::web());
        fx.release.status = ReleaseStatus::Building;
        assert!(matches!(
            render_manifest(&fx.input()),
            Err(ManifestError::MissingImage(_))
        ));
    }

    #[test]
    fn test_invalid_rollout_bound_rejected() {
        let mut fx = Fixture::new(WorkloadKind::web());
        fx.service.config.max_surge = Some("lots".to_string());
        assert!(matches!(
            render_manifest(&fx.input()),
            Err(ManifestError::InvalidRollout(_))
        ));
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("Checkout_API").unwrap(), "checkout-api");
        assert_eq!(object_name("--api--").unwrap(), "api");
        assert!(object_name("___").is_err());
    }

    #[test]
    fn test_pod_selector() {
        let fx = Fixture::new(WorkloadKind::web());
        let manifest = render_manifest(&fx.input()).unwrap();
        assert_eq!(
            manifest.workload.pod_selector(),
            format!("railyard.dev/deployment={}", fx.deployment.id)
        );
    }
}
