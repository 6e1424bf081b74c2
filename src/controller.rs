// System
use std::collections::HashMap;
use std::sync::Arc;

// Third Party
use futures::{stream, StreamExt};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::cache::ClusterState;
use crate::error::Result;
use crate::projector::{project, ProjectedLabels, TransferSpec};
use crate::reconciler::{reconcile, LabelPatcher, ReconcileOutcome};

/// Lifecycle of the control loop. States only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Starting,
    WaitingForCacheSync,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Flat delay after each pass, independent of how long the pass took.
    pub interval: Duration,
    /// Maximum number of pods patched at the same time within a pass.
    pub concurrency: usize,
    /// How long to wait for the initial cache sync before stalling. `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// How often to warn while the initial cache sync is outstanding.
    pub sync_warn_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            concurrency: 1,
            sync_timeout: None,
            sync_warn_interval: Duration::from_secs(30),
        }
    }
}

/// Counters for one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub nodes: usize,
    pub pods: usize,
    pub unchanged: usize,
    pub patched: usize,
    pub failed: usize,
    /// Pods that are unscheduled or whose node is not in the cache.
    pub skipped: usize,
}

/// Periodically projects node labels onto every pod in the cluster.
pub struct Controller<S, P> {
    cluster: Arc<S>,
    patcher: Arc<P>,
    transfer: TransferSpec,
    settings: ControllerSettings,
    state: watch::Sender<DriverState>,
}

impl<S, P> Controller<S, P>
where
    S: ClusterState,
    P: LabelPatcher,
{
    pub fn new(
        cluster: Arc<S>,
        patcher: Arc<P>,
        transfer: TransferSpec,
        settings: ControllerSettings,
    ) -> Self {
        let (state, _) = watch::channel(DriverState::Starting);
        Self {
            cluster,
            patcher,
            transfer,
            settings,
            state,
        }
    }

    /// Observe state transitions of [`Controller::run`].
    pub fn state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    fn transition(&self, next: DriverState) {
        debug!("State: {:?}", next);
        self.state.send_replace(next);
    }

    /// Project every node and reconcile every pod once.
    ///
    /// Listing failures abort the whole pass. A pod that fails to patch is counted and does not
    /// affect the others.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let nodes = self.cluster.list_nodes()?;
        let projections: HashMap<String, ProjectedLabels> = nodes
            .iter()
            .map(|node| (node.name.clone(), project(node, &self.transfer)))
            .collect();
        let pods = self.cluster.list_pods()?;

        let mut report = PassReport {
            nodes: nodes.len(),
            pods: pods.len(),
            ..Default::default()
        };

        let projections = &projections;
        let patcher = self.patcher.as_ref();
        let outcomes: Vec<Option<ReconcileOutcome>> = stream::iter(pods)
            .map(|pod| async move {
                let projected = projections.get(&pod.node_name)?;
                Some(reconcile(patcher, &pod, projected).await)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                None => report.skipped += 1,
                Some(ReconcileOutcome::Unchanged) => report.unchanged += 1,
                Some(ReconcileOutcome::Patched) => report.patched += 1,
                Some(ReconcileOutcome::Failed(_)) => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Wait for the cache, logging while it is outstanding. Returns `false` if the sync timeout
    /// expired first.
    async fn wait_for_cache_sync(&self) -> bool {
        let started = Instant::now();
        let ready = self.cluster.wait_until_ready();
        tokio::pin!(ready);
        loop {
            let mut wait = self.settings.sync_warn_interval;
            if let Some(timeout) = self.settings.sync_timeout {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return false;
                }
                wait = wait.min(remaining);
            }
            tokio::select! {
                _ = &mut ready => return true,
                _ = tokio::time::sleep(wait) => {
                    if !self.cluster.is_ready() {
                        warn!(
                            "Cluster cache still not synced after {}s",
                            started.elapsed().as_secs()
                        );
                    }
                }
            }
        }
    }

    /// Drive the control loop until `shutdown` is cancelled.
    ///
    /// A pass that is already running when shutdown is requested runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut state = DriverState::Starting;
        let mut subscription = None;
        loop {
            self.transition(state);
            match state {
                DriverState::Starting => {
                    subscription = Some(self.cluster.subscribe(shutdown.child_token()));
                    state = DriverState::WaitingForCacheSync;
                }
                DriverState::WaitingForCacheSync => {
                    info!("Waiting for cache sync...");
                    tokio::select! {
                        synced = self.wait_for_cache_sync() => {
                            if synced {
                                info!("Cache synced");
                                state = DriverState::Running;
                            } else {
                                error!("Failed to sync cluster cache, no reconciliation will run");
                                shutdown.cancelled().await;
                                state = DriverState::ShuttingDown;
                            }
                        }
                        _ = shutdown.cancelled() => state = DriverState::ShuttingDown,
                    }
                }
                DriverState::Running => {
                    if shutdown.is_cancelled() {
                        state = DriverState::ShuttingDown;
                        continue;
                    }
                    let start = Instant::now();
                    match self.run_pass().await {
                        Ok(report) => debug!(
                            "Finished controller loop on {} nodes, {} pods in {:?}: {:?}",
                            report.nodes,
                            report.pods,
                            start.elapsed(),
                            report
                        ),
                        Err(error) => error!("Reconciliation pass aborted: {}", error),
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => state = DriverState::ShuttingDown,
                        _ = tokio::time::sleep(self.settings.interval) => {}
                    }
                }
                DriverState::ShuttingDown => {
                    info!("Shutting down");
                    if let Some(subscription) = subscription.take() {
                        subscription.release().await;
                    }
                    state = DriverState::Stopped;
                }
                DriverState::Stopped => break,
            }
        }
    }
}
