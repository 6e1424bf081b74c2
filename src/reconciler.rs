// Third Party
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use serde_json::json;
use tracing::{debug, error};

// Local
use crate::cache::PodSnapshot;
use crate::error::{Error, Result};
use crate::projector::ProjectedLabels;

/// Writes managed labels onto a pod.
#[async_trait]
pub trait LabelPatcher: Send + Sync + 'static {
    /// Merge `labels` into the labels of pod `namespace/name`. Labels not named in `labels` must
    /// be left untouched.
    async fn patch_labels(&self, namespace: &str, name: &str, labels: &ProjectedLabels)
        -> Result<()>;
}

/// Issues JSON merge patches against the pods API.
pub struct KubeLabelPatcher {
    client: Client,
}

impl KubeLabelPatcher {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }
}

#[async_trait]
impl LabelPatcher for KubeLabelPatcher {
    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &ProjectedLabels,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "metadata": { "labels": labels } })),
        )
        .await?;
        Ok(())
    }
}

/// Result of reconciling a single pod.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The pod already carried every projected label; nothing was sent.
    Unchanged,
    Patched,
    /// The patch was rejected. The divergence remains and is retried on the next pass.
    Failed(Error),
}

/// Whether any projected key is missing from the pod or holds a different value.
pub fn needs_update(pod: &PodSnapshot, projected: &ProjectedLabels) -> bool {
    projected
        .iter()
        .any(|(key, value)| pod.labels.get(key) != Some(value))
}

/// Bring the managed labels of `pod` in line with `projected`.
///
/// Only the projected keys are sent, as a merge patch, so other labels on the pod are preserved.
/// A failure is logged and returned as an outcome rather than an error so callers can keep going.
pub async fn reconcile<P>(
    patcher: &P,
    pod: &PodSnapshot,
    projected: &ProjectedLabels,
) -> ReconcileOutcome
where
    P: LabelPatcher + ?Sized,
{
    if !needs_update(pod, projected) {
        return ReconcileOutcome::Unchanged;
    }
    debug!("Adding labels to pod {}/{}", pod.namespace, pod.name);
    match patcher
        .patch_labels(&pod.namespace, &pod.name, projected)
        .await
    {
        Ok(()) => ReconcileOutcome::Patched,
        Err(error) => {
            error!(
                "Error applying labels to pod {}/{}: {}",
                pod.namespace, pod.name, error
            );
            ReconcileOutcome::Failed(error)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    // System
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;

    // Third Party
    use async_trait::async_trait;
    use kube::error::ErrorResponse;
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    // Local
    use super::{needs_update, reconcile, LabelPatcher, ReconcileOutcome};
    use crate::cache::{PodKey, PodSnapshot};
    use crate::error::{Error, Result};
    use crate::projector::ProjectedLabels;

    /// Applies patches to an in-memory label table and records every call.
    #[derive(Default)]
    pub(crate) struct FakePatcher {
        pub(crate) labels: Mutex<HashMap<PodKey, BTreeMap<String, String>>>,
        pub(crate) calls: Mutex<Vec<PodKey>>,
        pub(crate) failing: HashSet<String>,
    }

    impl FakePatcher {
        pub(crate) fn failing_for(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(|name| name.to_string()).collect(),
                ..Default::default()
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// The pod with the patches applied so far merged over `pod.labels`.
        pub(crate) fn current(&self, pod: &PodSnapshot) -> PodSnapshot {
            let mut current = pod.clone();
            if let Some(patched) = self.labels.lock().unwrap().get(&pod.key()) {
                current.labels.extend(patched.clone());
            }
            current
        }
    }

    #[async_trait]
    impl LabelPatcher for FakePatcher {
        async fn patch_labels(
            &self,
            namespace: &str,
            name: &str,
            labels: &ProjectedLabels,
        ) -> Result<()> {
            let key = PodKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
            self.calls.lock().unwrap().push(key.clone());
            if self.failing.contains(name) {
                return Err(Error::Kube(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("pods \"{}\" is forbidden", name),
                    reason: "Forbidden".to_string(),
                    code: 403,
                })));
            }
            self.labels
                .lock()
                .unwrap()
                .entry(key)
                .or_default()
                .extend(labels.clone());
            Ok(())
        }
    }

    fn snapshot(name: &str, pairs: &[(&str, &str)]) -> PodSnapshot {
        PodSnapshot {
            namespace: "default".to_string(),
            name: name.to_string(),
            node_name: "n1".to_string(),
            labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn projected(pairs: &[(&str, &str)]) -> ProjectedLabels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_needs_update_on_missing_or_different_value() {
        let wanted = projected(&[("zone", "us-east")]);

        assert!(needs_update(&snapshot("p", &[]), &wanted));
        assert!(needs_update(&snapshot("p", &[("zone", "us-west")]), &wanted));
        assert!(!needs_update(&snapshot("p", &[("zone", "us-east")]), &wanted));
    }

    #[test]
    fn test_empty_projected_value_differs_from_missing_key() {
        assert!(needs_update(&snapshot("p", &[]), &projected(&[("zone", "")])));
        assert!(!needs_update(
            &snapshot("p", &[("zone", "")]),
            &projected(&[("zone", "")])
        ));
    }

    #[tokio::test]
    async fn test_consistent_pod_issues_no_write() {
        let patcher = FakePatcher::default();
        let pod = snapshot("p", &[("zone", "a"), ("rack", "r1"), ("app", "web")]);

        let outcome = reconcile(&patcher, &pod, &projected(&[("zone", "a"), ("rack", "r1")])).await;

        assert!(matches!(outcome, ReconcileOutcome::Unchanged));
        assert_eq!(patcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_twice_writes_once() {
        let patcher = FakePatcher::default();
        let pod = snapshot("p1", &[("app", "web")]);
        let wanted = projected(&[("zone", "us-east")]);

        let first = reconcile(&patcher, &pod, &wanted).await;
        let second = reconcile(&patcher, &patcher.current(&pod), &wanted).await;

        assert!(matches!(first, ReconcileOutcome::Patched));
        assert!(matches!(second, ReconcileOutcome::Unchanged));
        assert_eq!(patcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_patch_only_carries_managed_keys() {
        let patcher = FakePatcher::default();
        let unmanaged: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let pod = snapshot("p1", &[("app", unmanaged.as_str()), ("zone", "stale")]);

        reconcile(&patcher, &pod, &projected(&[("zone", "")])).await;

        let sent = patcher.labels.lock().unwrap().get(&pod.key()).cloned().unwrap();
        assert_eq!(sent, projected(&[("zone", "")]));
        let current = patcher.current(&pod);
        assert_eq!(current.labels.get("app"), Some(&unmanaged));
        assert_eq!(current.labels.get("zone").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_failed_patch_is_reported_as_outcome() {
        let patcher = FakePatcher::failing_for(&["broken"]);
        let pod = snapshot("broken", &[]);

        let outcome = reconcile(&patcher, &pod, &projected(&[("zone", "a")])).await;

        assert!(matches!(outcome, ReconcileOutcome::Failed(_)));
        assert_eq!(patcher.call_count(), 1);
    }
}
