use std::sync::Arc;

use kecs_storage::Database;

use crate::adapters::elbv2::Elbv2Adapter;
use crate::adapters::iam::{CredentialAdapter, StsProvider};
use crate::adapters::logs::LogAdapter;
use crate::hub::Hub;
use crate::kube_runtime::WorkloadApplier;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub hub: Hub,
    pub region: String,
    pub account_id: String,
    /// Present when a Kubernetes cluster is attached; workload objects are
    /// applied best-effort through it.
    pub workloads: Option<Arc<WorkloadApplier>>,
    /// Present when a credential emulator is configured; role credentials
    /// are injected into task pods through it.
    pub credentials: Option<Arc<CredentialAdapter<StsProvider>>>,
    /// Present when a log emulator is configured.
    pub logs: Option<Arc<LogAdapter>>,
    /// L7 load-balancer bookkeeping; always available, storage-backed.
    pub elbv2: Arc<Elbv2Adapter>,
}

impl AppState {
    pub fn new(db: Database, hub: Hub, region: String, account_id: String) -> Self {
        let elbv2 = Arc::new(Elbv2Adapter::new(
            db.elbv2(),
            region.clone(),
            account_id.clone(),
        ));
        Self {
            db,
            hub,
            region,
            account_id,
            workloads: None,
            credentials: None,
            logs: None,
            elbv2,
        }
    }

    pub fn with_localstack(mut self, endpoint: &str) -> Self {
        self.credentials = Some(Arc::new(CredentialAdapter::new(StsProvider::new(endpoint))));
        self.logs = Some(Arc::new(LogAdapter::new(endpoint)));
        self
    }
}
