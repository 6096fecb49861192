//! Identity Broker (§4.2) — per-request impersonating cluster clients and
//! RunnerCredential minting/revocation.

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, PostParams};
use kube::config::{AuthInfo, Kubeconfig};
use kube::{Api, Client, Config};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};

/// A per-run bearer secret, opaque to everything except the Event Gateway
/// and Approval Controller (§3.1 RunnerCredential). Its `Debug`/`Display`
/// impls intentionally do not exist — printing one is a compile error, not
/// just a style violation, so it can never end up in a log line by accident.
pub struct RunnerCredential {
    token: String,
    pub secret_name: String,
}

impl RunnerCredential {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct IdentityBroker {
    /// Service-account-identity client. Used ONLY for object-scoped writes
    /// a user could not necessarily perform directly (Secret creation,
    /// credential revocation) — never for reads gated by the caller's own
    /// authz.
    service_client: Client,
    runner_token_bytes: usize,
}

impl IdentityBroker {
    pub fn new(service_client: Client) -> Self {
        Self {
            service_client,
            runner_token_bytes: 32,
        }
    }

    /// Builds a cluster-API client that impersonates `caller` for the
    /// duration of one request (§4.2). Every authz-sensitive read/write the
    /// HTTP layer performs on the caller's behalf must go through this
    /// client, never `service_client`.
    #[instrument(skip(self))]
    pub fn impersonating_client(&self, caller: &str) -> Result<Client> {
        let mut config = Config::from_kubeconfig(&Kubeconfig::read().unwrap_or_default())
            .unwrap_or_else(|_| Config::new("https://kubernetes.default.svc".parse().unwrap()));
        config.auth_info = AuthInfo {
            impersonate: Some(caller.to_string()),
            ..config.auth_info
        };
        Client::try_from(config).map_err(Error::Kube)
    }

    /// Gate for run creation: the caller must pass a `create` SSAR on
    /// `runs` in `project` (§4.2).
    #[instrument(skip(self, client))]
    pub async fn authorize_create_run(&self, client: &Client, project: &str) -> Result<()> {
        let ssar_api: Api<SelfSubjectAccessReview> = Api::all(client.clone());
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(project.to_string()),
                    verb: Some("create".to_string()),
                    group: Some("orchestrator.io".to_string()),
                    resource: Some("runs".to_string()),
                    ..Default::default()
                }),
                non_resource_attributes: None,
            },
            ..Default::default()
        };

        let result = ssar_api
            .create(&PostParams::default(), &review)
            .await
            .map_err(Error::Kube)?;

        let allowed = result.status.map(|s| s.allowed).unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "caller is not authorized to create runs in project '{project}'"
            )))
        }
    }

    /// Mints a RunnerCredential and materializes it into a Secret owned by
    /// the run's Job (§4.2, §4.4 step 2). `prefix` is the configured
    /// `runsecret-prefix`; `run_id_fragment` is the first 8 hex characters
    /// of the run's UUID.
    #[instrument(skip(self))]
    pub async fn mint_runner_credential(
        &self,
        namespace: &str,
        prefix: &str,
        run_id_fragment: &str,
    ) -> Result<RunnerCredential> {
        let mut raw = vec![0u8; self.runner_token_bytes];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = BASE64.encode(raw);
        let secret_name = format!("{prefix}-{run_id_fragment}");

        let mut data = BTreeMap::new();
        data.insert(
            "token".to_string(),
            k8s_openapi::ByteString(token.clone().into_bytes()),
        );

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        let secrets: Api<Secret> = Api::namespaced(self.service_client.clone(), namespace);
        secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(Error::Kube)?;

        info!(secret_name, "minted runner credential");
        Ok(RunnerCredential { token, secret_name })
    }

    /// Sets the Secret's owner reference to the run's Job so it is garbage
    /// collected on Job deletion (§3.2, §4.4 step 5).
    #[instrument(skip(self))]
    pub async fn own_credential_by_job(
        &self,
        namespace: &str,
        secret_name: &str,
        job_owner: OwnerReference,
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.service_client.clone(), namespace);
        let mut secret = secrets.get(secret_name).await.map_err(Error::Kube)?;
        secret
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(job_owner);
        secrets
            .replace(secret_name, &PostParams::default(), &secret)
            .await
            .map_err(Error::Kube)?;
        Ok(())
    }

    /// Revokes a terminated run's credential immediately rather than waiting
    /// on the Job's owner-ref cascade, so the Event Gateway stops honoring it
    /// on the same transition that marks the run terminal (§4.2).
    #[instrument(skip(self))]
    pub async fn revoke_credential(&self, namespace: &str, secret_name: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.service_client.clone(), namespace);
        match secrets.delete(secret_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => {
                warn!(secret_name, error = %e, "failed to revoke runner credential");
                Err(Error::Kube(e))
            }
        }
    }

    /// Verifies a presented bearer token against a run's live RunnerCredential
    /// (§4.2, §4.6/§4.8 "authenticated by the RunnerCredential"). The Secret's
    /// `token` key is read fresh on every call rather than cached anywhere, so
    /// a revoked credential (Secret deleted) is rejected immediately.
    #[instrument(skip(self, presented))]
    pub async fn verify_runner_credential(
        &self,
        namespace: &str,
        secret_name: &str,
        presented: &str,
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.service_client.clone(), namespace);
        let secret = secrets
            .get(secret_name)
            .await
            .map_err(|_| Error::Unauthenticated)?;
        let stored = secret
            .data
            .as_ref()
            .and_then(|d| d.get("token"))
            .map(|b| b.0.as_slice())
            .ok_or(Error::Unauthenticated)?;
        if constant_time_eq(presented.as_bytes(), stored) {
            Ok(())
        } else {
            Err(Error::Unauthenticated)
        }
    }
}

/// Constant-time byte comparison so a mismatched runner token takes the same
/// time to reject regardless of where the first differing byte falls.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Pulls the bearer token out of `Authorization: Bearer <token>`. Used by
/// every runner-only endpoint (§4.6 ingress, §4.8 status writes) ahead of
/// `verify_runner_credential`.
pub fn extract_bearer(headers: &HeaderMap) -> Result<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or(Error::Unauthenticated)
}

/// Masks a bearer token before it reaches a log line (§4.2: "MUST NOT be
/// logged"). Used by the Event Gateway's outbound proxy logging.
pub fn redact_bearer(header_value: &str) -> String {
    if header_value.len() <= 12 {
        "Bearer <redacted>".to_string()
    } else {
        format!("Bearer {}...<redacted>", &header_value[..6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_bearer_never_includes_full_token() {
        let masked = redact_bearer("abcdefghijklmnopqrstuvwxyz");
        assert!(!masked.contains("ghijklmnopqrstuvwxyz"));
        assert!(masked.ends_with("<redacted>"));
    }

    #[test]
    fn redact_bearer_handles_short_tokens() {
        assert_eq!(redact_bearer("short"), "Bearer <redacted>");
    }

    #[test]
    fn constant_time_eq_matches_identical_bytes() {
        assert!(constant_time_eq(b"runner-token", b"runner-token"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_bytes_or_length() {
        assert!(!constant_time_eq(b"runner-token", b"wrong-token!"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn extract_bearer_reads_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers).unwrap(), "abc123");
    }

    #[test]
    fn extract_bearer_rejects_missing_or_malformed_header() {
        let headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_err());

        let mut bad = HeaderMap::new();
        bad.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(extract_bearer(&bad).is_err());
    }
}
