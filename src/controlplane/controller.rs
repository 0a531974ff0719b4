//! Trigger Source
//!
//! Watches `ClusterVersion` objects and runs one convergence pass per change.
//! Failures are mapped to requeue actions through [`Error::action`].

use crate::controlplane::reconciler::Reconciler;
use crate::crd::ClusterVersion;
use crate::domain::ports::ObjectKey;
use crate::error::{Error, ErrorAction, Result};
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

async fn reconcile(cv: Arc<ClusterVersion>, reconciler: Arc<Reconciler>) -> Result<Action> {
    let request = ObjectKey::cluster(cv.name_any());
    reconciler.reconcile(&request).await?;
    Ok(Action::await_change())
}

fn error_policy(cv: Arc<ClusterVersion>, err: &Error, reconciler: Arc<Reconciler>) -> Action {
    let action = requeue_action(err, reconciler.config().error_requeue);
    warn!(name = %cv.name_any(), error = %err, action = ?action, "Reconcile failed");
    action
}

/// Controller action for a failed pass; `backoff` is used for transient errors.
pub fn requeue_action(err: &Error, backoff: Duration) -> Action {
    match err.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(backoff),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Run the controller until a termination signal arrives
pub async fn run(client: Client, reconciler: Arc<Reconciler>) -> Result<()> {
    let api: Api<ClusterVersion> = Api::all(client);

    info!("Starting ClusterVersion controller");
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!(name = %object.name, "Reconciled"),
                Err(e) => warn!(error = %e, "Controller error"),
            }
        })
        .await;
    info!("Controller stopped");

    Ok(())
}
