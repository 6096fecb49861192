//! Deterministic resource names for a run's Job/Service/Secret (§4.4).

const MAX_K8S_NAME_LENGTH: usize = 63;

pub struct ResourceNaming;

impl ResourceNaming {
    /// `run-{name}` truncated to the Kubernetes 63-char name limit, with a
    /// short hash suffix when truncation would otherwise collide.
    pub fn job_name(run_name: &str) -> String {
        Self::bounded(&format!("run-{run_name}"))
    }

    pub fn service_name(run_name: &str) -> String {
        Self::bounded(&format!("run-{run_name}-svc"))
    }

    pub fn credential_secret_name(prefix: &str, run_id: &uuid::Uuid) -> String {
        let fragment = &run_id.simple().to_string()[..8];
        Self::bounded(&format!("{prefix}-{fragment}"))
    }

    fn bounded(candidate: &str) -> String {
        if candidate.len() <= MAX_K8S_NAME_LENGTH {
            return candidate.to_string();
        }
        let hash = Self::hash_suffix(candidate);
        let budget = MAX_K8S_NAME_LENGTH - hash.len() - 1;
        format!("{}-{hash}", &candidate[..budget])
    }

    fn hash_suffix(s: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        format!("{:x}", hasher.finish())[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_is_stable_and_bounded() {
        let name = ResourceNaming::job_name("r1");
        assert_eq!(name, "run-r1");
        assert!(name.len() <= MAX_K8S_NAME_LENGTH);
    }

    #[test]
    fn long_run_name_is_truncated_with_hash() {
        let long_name = "x".repeat(80);
        let name = ResourceNaming::job_name(&long_name);
        assert!(name.len() <= MAX_K8S_NAME_LENGTH);
    }

    #[test]
    fn credential_secret_name_uses_run_id_fragment() {
        let id = uuid::Uuid::nil();
        let name = ResourceNaming::credential_secret_name("runsecret", &id);
        assert_eq!(name, "runsecret-00000000");
    }
}
