//! Scheduler (§4.4) — creates the Job, Service, and credential Secret for a
//! run and wires its environment contract (§6.4).

pub mod naming;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    SecretKeySelector, SecurityContext, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityBroker;
use crate::registry::WorkflowVersion;
use crate::store::{NewRun, Run, RunStore, StatusPatch, WorkflowRef};
use naming::ResourceNaming;

pub struct CreateRunRequest {
    pub project: String,
    pub name: String,
    pub workflow_name: String,
    pub version: Option<String>,
    pub graph: String,
    pub inputs: serde_json::Value,
    pub display_name: Option<String>,
    pub parent_run: Option<String>,
    pub backend_event_url: String,
    pub ws_url: String,
    pub credential_secret_prefix: String,
}

struct ProvisionedResources {
    job_name: String,
    service_name: String,
    credential_secret: String,
}

pub struct Scheduler {
    client: Client,
    identity: IdentityBroker,
    config: RunConfig,
}

impl Scheduler {
    pub fn new(client: Client, identity: IdentityBroker, config: RunConfig) -> Self {
        Self {
            client,
            identity,
            config,
        }
    }

    /// Executes §4.4 steps 1-5: resolve, mint credential, ensure Service,
    /// create Job, mark `Creating`. On Job-create failure the run moves to
    /// `Error` with a one-shot retry budget. `caller_client` impersonates the
    /// HTTP caller and gates the request on the §4.2 SSAR check; the actual
    /// provisioning below still runs under the broker's service-account
    /// identity, since minting a Secret and creating the Job are privileged
    /// operations a caller need not hold RBAC for directly.
    #[instrument(skip(self, store, registry, caller_client, req))]
    pub async fn create_run(
        &self,
        store: &RunStore,
        registry: &crate::registry::Registry,
        caller_client: &Client,
        req: CreateRunRequest,
    ) -> Result<Run> {
        self.identity
            .authorize_create_run(caller_client, &req.project)
            .await?;

        let version = registry
            .resolve(&req.project, &req.workflow_name, req.version.as_deref(), &req.graph)
            .await?;

        if let Some(schema) = &version.inputs_schema {
            validate_inputs_against_schema(schema, &req.inputs)?;
        }

        let thread_id = match &req.parent_run {
            Some(parent_name) => store
                .get_run(&req.project, parent_name)
                .await?
                .thread_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let run = store
            .create_run(NewRun {
                project: req.project.clone(),
                name: req.name.clone(),
                workflow_ref: WorkflowRef {
                    name: req.workflow_name.clone(),
                    version: version.version.clone(),
                    graph: req.graph.clone(),
                },
                image_digest: version.image_digest.clone(),
                graphs: serde_json::to_value(&version.graphs)?,
                inputs: req.inputs.clone(),
                display_name: req.display_name.clone(),
                parent_run: req.parent_run.clone(),
                thread_id,
            })
            .await?;

        let provisioned = match self.provision(&req, &run, &version).await {
            Ok(names) => names,
            Err(e) => {
                warn!(run = %req.name, error = %e, "job provisioning failed, attempting retry budget");
                if self.config.job_create_retry_budget > 0 {
                    match self.provision(&req, &run, &version).await {
                        Ok(names) => names,
                        Err(retry_err) => {
                            warn!(run = %req.name, error = %retry_err, "retry exhausted");
                            self.mark_error(store, &req, &retry_err.to_string()).await?;
                            return Err(retry_err);
                        }
                    }
                } else {
                    self.mark_error(store, &req, &e.to_string()).await?;
                    return Err(e);
                }
            }
        };

        store
            .update_status(
                &req.project,
                &req.name,
                StatusPatch {
                    phase: Some(crate::store::Phase::Creating),
                    job_name: Some(provisioned.job_name),
                    service_name: Some(provisioned.service_name),
                    credential_secret: Some(provisioned.credential_secret),
                    ..Default::default()
                },
            )
            .await?;

        store.get_run(&req.project, &req.name).await
    }

    async fn mark_error(
        &self,
        store: &RunStore,
        req: &CreateRunRequest,
        message: &str,
    ) -> Result<()> {
        store
            .update_status(
                &req.project,
                &req.name,
                StatusPatch {
                    phase: Some(crate::store::Phase::Error),
                    message: Some(message.to_string()),
                    is_error: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn provision(
        &self,
        req: &CreateRunRequest,
        run: &Run,
        version: &WorkflowVersion,
    ) -> Result<ProvisionedResources> {
        let secret_name =
            ResourceNaming::credential_secret_name(&req.credential_secret_prefix, &run.id);
        let secret_fragment = secret_name
            .strip_prefix(&format!("{}-", req.credential_secret_prefix))
            .unwrap_or(&secret_name);
        let credential = self
            .identity
            .mint_runner_credential(&req.project, &req.credential_secret_prefix, secret_fragment)
            .await?;

        let job_name = ResourceNaming::job_name(&req.name);
        let service_name = ResourceNaming::service_name(&req.name);

        self.ensure_service(&req.project, &service_name, &job_name).await?;
        self.create_job(req, run, version, &job_name, &credential.secret_name)
            .await?;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &req.project);
        let job = jobs.get(&job_name).await.map_err(Error::Kube)?;
        let owner = OwnerReference {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            name: job_name.clone(),
            uid: job.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        self.identity
            .own_credential_by_job(&req.project, &credential.secret_name, owner)
            .await?;

        info!(run = %req.name, job_name, service_name, "provisioned run resources");
        Ok(ProvisionedResources {
            job_name,
            service_name,
            credential_secret: credential.secret_name,
        })
    }

    async fn ensure_service(&self, namespace: &str, service_name: &str, job_name: &str) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        if services.get(service_name).await.is_ok() {
            return Ok(());
        }

        let mut selector = BTreeMap::new();
        selector.insert("job-name".to_string(), job_name.to_string());

        let service = Service {
            metadata: ObjectMeta {
                name: Some(service_name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some("resume".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match services.create(&PostParams::default(), &service).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn create_job(
        &self,
        req: &CreateRunRequest,
        run: &Run,
        version: &WorkflowVersion,
        job_name: &str,
        credential_secret: &str,
    ) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &req.project);

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "orchestrator".to_string());
        labels.insert("component".to_string(), "run".to_string());
        labels.insert("run-name".to_string(), req.name.clone());
        labels.insert("project".to_string(), req.project.clone());

        let env = self.runner_env(req, run, credential_secret)?;

        let container = Container {
            name: "runner".to_string(),
            image: Some(version.image_digest.clone()),
            env: Some(env),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                allow_privilege_escalation: Some(false),
                capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            restart_policy: Some("Never".to_string()),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                ..Default::default()
            }),
            containers: vec![container],
            ..Default::default()
        };

        let job = Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                active_deadline_seconds: Some(self.config.active_deadline.as_secs() as i64),
                ttl_seconds_after_finished: Some(
                    self.config.ttl_after_finished.as_secs() as i32
                ),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            status: None,
        };

        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    fn runner_env(
        &self,
        req: &CreateRunRequest,
        run: &Run,
        credential_secret: &str,
    ) -> Result<Vec<EnvVar>> {
        let inputs_json = serde_json::to_string(&req.inputs)?;
        let mut env = vec![
            EnvVar {
                name: "RUN_ID".to_string(),
                value: Some(run.id.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "PROJECT".to_string(),
                value: Some(req.project.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "GRAPH".to_string(),
                value: Some(req.graph.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "INPUTS".to_string(),
                value: Some(inputs_json),
                ..Default::default()
            },
            EnvVar {
                name: "BACKEND_EVENT_URL".to_string(),
                value: Some(req.backend_event_url.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "WS_URL".to_string(),
                value: Some(req.ws_url.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "TIMEOUT_SECONDS".to_string(),
                value: Some(self.config.active_deadline.as_secs().to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "RUNNER_TOKEN".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: credential_secret.to_string(),
                        key: "token".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        if let Some(thread_id) = &run.thread_id {
            env.push(EnvVar {
                name: "THREAD_ID".to_string(),
                value: Some(thread_id.clone()),
                ..Default::default()
            });
        }

        if let Some(parent) = &req.parent_run {
            env.push(EnvVar {
                name: "PARENT_RUN_ID".to_string(),
                value: Some(parent.clone()),
                ..Default::default()
            });
        }
        Ok(env)
    }
}

/// Validates `inputs` as an instance of `schema` (§4.4 step 1 supplement,
/// §6.1 `POST /runs` 400 `input_schema_violation` contract). Distinct from
/// the registry's schema-shape check at registration time, which only
/// confirms the schema document itself is well-formed.
fn validate_inputs_against_schema(schema: &serde_json::Value, inputs: &serde_json::Value) -> Result<()> {
    let validator = jsonschema::validator_for(schema).map_err(|e| Error::InvalidSchema(e.to_string()))?;
    if let Err(first_error) = validator.validate(inputs) {
        return Err(Error::InputSchemaViolation(first_error.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod schema_tests {
    use super::*;

    #[test]
    fn accepts_inputs_matching_schema() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        });
        let inputs = serde_json::json!({"message": "hello"});
        assert!(validate_inputs_against_schema(&schema, &inputs).is_ok());
    }

    #[test]
    fn rejects_inputs_missing_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        });
        let inputs = serde_json::json!({});
        let err = validate_inputs_against_schema(&schema, &inputs).unwrap_err();
        assert!(matches!(err, Error::InputSchemaViolation(_)));
    }
}
