//! Dataset-update handler.
//!
//! Called after a dataset is saved. When the privacy flag changed since the
//! last call, the dataset's objects are brought in line, through the job queue
//! when background updates are enabled, inline otherwise.

use crate::{
    config::HostCapabilities,
    errors::FilestoreResult,
    models::{AclPolicy, AclState, PackageInfo},
    services::{
        jobs::{JobDispatcher, VisibilityJob},
        propagator::{PropagationReport, VisibilityPropagator},
    },
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The ACL policy is fixed; dataset privacy does not drive object ACLs.
    Skipped,
    /// Privacy flag matches the last one seen.
    Unchanged,
    Enqueued(Uuid),
    Applied(PropagationReport),
}

#[derive(Clone)]
pub struct PackageVisibilitySync {
    propagator: VisibilityPropagator,
    policy: AclPolicy,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
    capabilities: HostCapabilities,
}

impl PackageVisibilitySync {
    pub fn new(propagator: VisibilityPropagator, policy: AclPolicy, capabilities: HostCapabilities) -> Self {
        Self {
            propagator,
            policy,
            dispatcher: None,
            capabilities,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn on_package_updated(&self, package: &PackageInfo) -> FilestoreResult<SyncOutcome> {
        if !self.policy.is_auto() {
            return Ok(SyncOutcome::Skipped);
        }

        // The flag is recorded only once a clean run has applied it.
        let cache = self.propagator.resolver().cache();
        if cache.dataset_private(&package.id).await == Some(package.private) {
            debug!("package {} is already in the correct state", package.id);
            return Ok(SyncOutcome::Unchanged);
        }
        cache.invalidate_dataset_private(&package.id).await;

        let target = AclState::for_dataset(package.private);
        if self.capabilities.async_visibility_update {
            if let Some(dispatcher) = &self.dispatcher {
                let job = VisibilityJob::new(&package.id, target);
                let id = job.id;
                match dispatcher.enqueue(job).await {
                    Ok(()) => return Ok(SyncOutcome::Enqueued(id)),
                    Err(err) => warn!("could not enqueue update of {}, running inline: {}", package.id, err),
                }
            }
        }

        let package = match (package.resources.is_empty(), self.propagator.catalog()) {
            (true, Some(catalog)) => Cow::Owned(catalog.show_package(&package.id).await?),
            _ => Cow::Borrowed(package),
        };
        let report = self.propagator.propagate_package(&package, target).await;
        if report.is_clean() {
            cache.put_dataset_private(&package.id, package.private).await;
        } else {
            warn!(
                "{} objects of package {} were not updated; a repeated update will retry them",
                report.failed, package.id
            );
        }
        Ok(SyncOutcome::Applied(report))
    }
}
