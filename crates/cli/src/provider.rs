//! Desired-state sources: multi-document YAML of [`ProxyInfra`] entries, and
//! the rate-limit service from the server config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tollgate_core::{IrError, ProxyInfra, RateLimitInfra, ServerConfig};
use tollgate_runner::{Runner, RunnerError};
use tollgate_store::SnapshotStore;
use tracing::{info, warn};

pub const PROVIDER: &str = "provider";
pub const RATE_LIMIT_SOURCE: &str = "ratelimit";

/// Parse every non-empty document. Entries are keyed by name; a later
/// document with the same name replaces the earlier one.
pub fn parse_documents(text: &str) -> Result<BTreeMap<String, ProxyInfra>> {
    let mut out = BTreeMap::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {i}"))?;
        if value.is_null() {
            continue;
        }
        let ir: ProxyInfra = serde_yaml::from_value(value).with_context(|| format!("document {i}"))?;
        if let Some(prev) = out.insert(ir.name.clone(), ir) {
            warn!(name = %prev.name, document = i, "duplicate infra entry, keeping the later one");
        }
    }
    Ok(out)
}

pub fn read_documents(path: &Path) -> Result<BTreeMap<String, ProxyInfra>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_documents(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Root of the pipeline: publishes the file contents into the provider store
/// on start and on every reload.
pub struct ProviderRunner {
    path: PathBuf,
    store: SnapshotStore<String, ProxyInfra>,
}

impl ProviderRunner {
    pub fn new(path: PathBuf, store: SnapshotStore<String, ProxyInfra>) -> Self { Self { path, store } }

    fn load(&self) -> Result<u64> {
        let entries = read_documents(&self.path)?;
        let count = entries.len();
        let version = self.store.replace_all(entries)?;
        info!(path = %self.path.display(), entries = count, version, "desired state loaded");
        Ok(version)
    }
}

#[async_trait]
impl Runner for ProviderRunner {
    fn name(&self) -> &str { PROVIDER }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), RunnerError> {
        self.load().map(|_| ()).map_err(|e| RunnerError::Start { name: PROVIDER.into(), message: format!("{e:#}") })
    }

    async fn shut_down(&self) {}

    async fn reload(&self, _config: &ServerConfig) -> Result<(), RunnerError> {
        self.load().map(|_| ()).map_err(|e| RunnerError::Reload { name: PROVIDER.into(), message: format!("{e:#}") })
    }
}

/// The rate-limit service configured in `config`, keyed by name. Empty when
/// rate limiting is off.
pub fn rate_limit_infra(config: &ServerConfig) -> Result<BTreeMap<String, RateLimitInfra>, IrError> {
    let Some(rl) = &config.rate_limit else { return Ok(BTreeMap::new()) };
    let mut rl = rl.clone();
    if rl.namespace.trim().is_empty() {
        rl.namespace = config.controller_namespace.clone();
    }
    rl.validate()?;
    Ok(BTreeMap::from([(rl.name().to_string(), rl)]))
}

/// Publishes the configured rate-limit service on start and on every reload.
pub struct RateLimitSource {
    config: ServerConfig,
    store: SnapshotStore<String, RateLimitInfra>,
}

impl RateLimitSource {
    pub fn new(config: ServerConfig, store: SnapshotStore<String, RateLimitInfra>) -> Self { Self { config, store } }

    fn publish(&self, config: &ServerConfig) -> Result<u64> {
        let entries = rate_limit_infra(config)?;
        let enabled = !entries.is_empty();
        let version = self.store.replace_all(entries)?;
        info!(enabled, version, "rate-limit service loaded");
        Ok(version)
    }
}

#[async_trait]
impl Runner for RateLimitSource {
    fn name(&self) -> &str { RATE_LIMIT_SOURCE }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), RunnerError> {
        self.publish(&self.config)
            .map(|_| ())
            .map_err(|e| RunnerError::Start { name: RATE_LIMIT_SOURCE.into(), message: format!("{e:#}") })
    }

    async fn shut_down(&self) {}

    async fn reload(&self, config: &ServerConfig) -> Result<(), RunnerError> {
        self.publish(config)
            .map(|_| ())
            .map_err(|e| RunnerError::Reload { name: RATE_LIMIT_SOURCE.into(), message: format!("{e:#}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::Protocol;

    const DOCS: &str = r#"
name: default/public
namespace: tollgate-system
replicas: 2
listeners:
  - name: http
    ports:
      - name: http-80
        protocol: HTTP
        servicePort: 80
        containerPort: 10080
---
---
name: default/internal
namespace: tollgate-system
features:
  podIntrospection: true
"#;

    #[test]
    fn parses_documents_and_skips_empty_ones() {
        let docs = parse_documents(DOCS).expect("parse");
        assert_eq!(docs.len(), 2);
        let public = &docs["default/public"];
        assert_eq!(public.replicas, Some(2));
        assert_eq!(public.listeners[0].ports[0].protocol, Protocol::Http);
        assert!(docs["default/internal"].features.pod_introspection);
    }

    #[test]
    fn later_duplicates_win() {
        let docs = parse_documents("name: a\nnamespace: x\n---\nname: a\nnamespace: y\n").expect("parse");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["a"].namespace, "y");
    }

    #[test]
    fn malformed_documents_are_errors() {
        let err = parse_documents("name: a\nnamespace: x\n---\nreplicas: [1\n").expect_err("bad yaml");
        assert!(format!("{err:#}").contains("document 1"));
    }

    #[tokio::test]
    async fn unreadable_file_fails_start() {
        let store = SnapshotStore::new("provider");
        let runner = ProviderRunner::new(PathBuf::from("/nonexistent/tollgate/infra.yaml"), store.clone());
        let err = runner.start(&CancellationToken::new()).await.expect_err("missing file");
        assert!(matches!(err, RunnerError::Start { .. }));
        assert_eq!(store.version(), 0);
    }

    fn with_rate_limit(backend: &str) -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.rate_limit = Some(RateLimitInfra::new("", backend));
        cfg
    }

    #[test]
    fn rate_limit_defaults_to_the_controller_namespace() {
        assert!(rate_limit_infra(&ServerConfig::default()).expect("off").is_empty());
        let cfg = with_rate_limit("redis.tollgate-system.svc:6379");
        let out = rate_limit_infra(&cfg).expect("rate limit");
        assert_eq!(out.len(), 1);
        assert_eq!(out[tollgate_core::RATE_LIMIT_NAME].namespace, cfg.controller_namespace);
    }

    #[tokio::test]
    async fn rate_limit_source_follows_reloads() {
        let store = SnapshotStore::new("ratelimit-ir");
        let source = RateLimitSource::new(with_rate_limit("redis:6379"), store.clone());
        source.start(&CancellationToken::new()).await.expect("start");
        assert_eq!(store.len(), 1);

        let err = source.reload(&with_rate_limit(" ")).await.expect_err("no backend");
        assert!(matches!(err, RunnerError::Reload { .. }));
        assert_eq!(store.len(), 1);

        source.reload(&ServerConfig::default()).await.expect("disable");
        assert_eq!(store.len(), 0);
    }
}
