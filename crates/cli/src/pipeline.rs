//! Wiring of the provider -> translator -> infrastructure pipeline, and of
//! the rate-limit source -> rate-limit infrastructure pair beside it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tollgate_apply::{InfraClient, RetryPolicy};
use tollgate_core::{ProxyInfra, RateLimitInfra, ServerConfig};
use tollgate_infra::Infra;
use tollgate_kubehub::ClusterApi;
use tollgate_runner::{InfraRunner, Parent, RunnerManager, TranslateRunner};
use tollgate_store::SnapshotStore;
use tracing::warn;

use crate::provider::{ProviderRunner, RateLimitSource, PROVIDER, RATE_LIMIT_SOURCE};

pub const TRANSLATOR: &str = "translator";
pub const RATE_LIMIT_INFRA: &str = "ratelimit-infrastructure";

/// Fill in defaults and drop entries that remain invalid.
pub fn default_infra(entries: &BTreeMap<String, ProxyInfra>, config: &ServerConfig) -> BTreeMap<String, ProxyInfra> {
    let mut out = BTreeMap::new();
    for (key, ir) in entries {
        let mut ir = ir.clone();
        if ir.name.trim().is_empty() {
            ir.name = key.clone();
        }
        if ir.namespace.trim().is_empty() {
            ir.namespace = config.controller_namespace.clone();
        }
        if ir.log_level.is_empty() {
            ir.log_level = "warn".to_string();
        }
        ir.listeners.sort_by(|a, b| a.name.cmp(&b.name));
        ir.addresses.sort();
        ir.addresses.dedup();
        match ir.validate() {
            Ok(()) => {
                out.insert(key.clone(), ir);
            }
            Err(e) => warn!(key = %key, error = %e, "dropping invalid infra entry"),
        }
    }
    out
}

/// Stores connecting the pipeline stages.
#[derive(Clone)]
pub struct Stores {
    pub provider: SnapshotStore<String, ProxyInfra>,
    pub infra_ir: SnapshotStore<String, ProxyInfra>,
    pub rate_limit: SnapshotStore<String, RateLimitInfra>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            provider: SnapshotStore::new(PROVIDER),
            infra_ir: SnapshotStore::new("infra-ir"),
            rate_limit: SnapshotStore::new("ratelimit-ir"),
        }
    }

    pub fn close(&self) {
        self.provider.close();
        self.infra_ir.close();
        self.rate_limit.close();
    }
}

pub async fn build(
    cluster: Arc<dyn ClusterApi>,
    config: &ServerConfig,
    infra_path: PathBuf,
    stores: &Stores,
) -> Result<RunnerManager> {
    let manager = RunnerManager::new();
    manager.register(Arc::new(ProviderRunner::new(infra_path, stores.provider.clone())), Parent::Root).await?;

    let defaults = config.clone();
    let translator = TranslateRunner::new(TRANSLATOR, stores.provider.clone(), stores.infra_ir.clone(), move |snap| {
        Ok(default_infra(&snap.state, &defaults))
    });
    manager.register(Arc::new(translator), Parent::named(PROVIDER)).await?;

    let client = InfraClient::new(cluster, RetryPolicy::from(&config.retry));
    let infra = Arc::new(Infra::new(client, config.clone()));
    manager.register(Arc::new(InfraRunner::new(stores.infra_ir.clone(), Arc::clone(&infra))), Parent::named(TRANSLATOR)).await?;

    manager.register(Arc::new(RateLimitSource::new(config.clone(), stores.rate_limit.clone())), Parent::Root).await?;
    let rate_limit = InfraRunner::new(stores.rate_limit.clone(), infra).with_name(RATE_LIMIT_INFRA);
    manager.register(Arc::new(rate_limit), Parent::named(RATE_LIMIT_SOURCE)).await?;
    Ok(manager)
}
