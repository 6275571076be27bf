use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::{ApiType, GatewayConfig, Provider, mask_key};
use crate::error::{GatewayError, Result};
use crate::events::{EventSink, GatewayEvent};

/// Ordered provider list plus listener configuration.
///
/// Readers get an `Arc` snapshot and never wait on file I/O; writers are
/// serialized, validate a full candidate config, persist it, then swap it in.
pub struct ProviderRegistry {
    current: RwLock<Arc<GatewayConfig>>,
    write_lock: Mutex<()>,
    revision: AtomicU64,
    path: Option<PathBuf>,
    events: Arc<dyn EventSink>,
}

impl ProviderRegistry {
    pub fn new(config: GatewayConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            write_lock: Mutex::new(()),
            revision: AtomicU64::new(0),
            path: None,
            events,
        })
    }

    /// Registry backed by a JSON file, rewritten on every mutation.
    pub fn open(path: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Result<Self> {
        let path = path.into();
        let config = GatewayConfig::load(&path)?;
        tracing::info!(
            path = %path.display(),
            providers = config.providers.len(),
            "gateway config loaded"
        );
        let mut registry = Self::new(config, events)?;
        registry.path = Some(path);
        Ok(registry)
    }

    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.read().clone()
    }

    pub fn list(&self) -> Vec<Provider> {
        self.snapshot().providers.clone()
    }

    pub fn get(&self, id: &str) -> Option<Provider> {
        self.snapshot().provider(id).cloned()
    }

    /// Enabled providers supporting `api_type`, in registry order.
    pub fn routable(&self, api_type: ApiType) -> (Vec<Provider>, bool) {
        let config = self.snapshot();
        let providers = config
            .providers
            .iter()
            .filter(|p| p.enabled && p.supports(api_type))
            .cloned()
            .collect();
        (providers, config.fallback_enabled)
    }

    pub fn add(&self, mut provider: Provider) -> Result<String> {
        if provider.id.trim().is_empty() {
            provider.id = uuid::Uuid::new_v4().to_string();
        }
        let id = provider.id.clone();
        self.mutate("add", |config| {
            if config.provider(&provider.id).is_some() {
                return Err(GatewayError::Validation(format!(
                    "provider id '{}' already exists",
                    provider.id
                )));
            }
            config.providers.push(provider);
            Ok(())
        })?;
        Ok(id)
    }

    pub fn update(&self, id: &str, mut provider: Provider) -> Result<()> {
        self.mutate("update", |config| {
            let slot = config
                .providers
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| GatewayError::NotFound(format!("provider '{}'", id)))?;
            provider.id = id.to_string();
            keep_masked_key(&mut provider, slot);
            *slot = provider;
            Ok(())
        })
    }

    pub fn remove(&self, id: &str) -> Result<Provider> {
        self.mutate("remove", |config| {
            let idx = config
                .providers
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| GatewayError::NotFound(format!("provider '{}'", id)))?;
            Ok(config.providers.remove(idx))
        })
    }

    /// New total order; must name every existing id exactly once.
    pub fn reorder(&self, ids: &[String]) -> Result<()> {
        self.mutate("reorder", |config| {
            if ids.len() != config.providers.len() {
                return Err(GatewayError::Validation(format!(
                    "reorder expects {} ids, got {}",
                    config.providers.len(),
                    ids.len()
                )));
            }
            let mut seen = HashSet::new();
            let mut ordered = Vec::with_capacity(ids.len());
            for id in ids {
                if !seen.insert(id.as_str()) {
                    return Err(GatewayError::Validation(format!(
                        "provider id '{}' listed twice",
                        id
                    )));
                }
                let provider = config.provider(id).cloned().ok_or_else(|| {
                    GatewayError::Validation(format!("unknown provider id '{}'", id))
                })?;
                ordered.push(provider);
            }
            config.providers = ordered;
            Ok(())
        })
    }

    /// Replace the whole document. Providers carrying a masked key keep the
    /// stored key of the provider with the same id.
    pub fn replace(&self, mut next: GatewayConfig) -> Result<()> {
        self.mutate("replace", |config| {
            for provider in &mut next.providers {
                if provider.id.trim().is_empty() {
                    provider.id = uuid::Uuid::new_v4().to_string();
                } else if let Some(existing) = config.provider(&provider.id) {
                    keep_masked_key(provider, existing);
                }
            }
            *config = next;
            Ok(())
        })
    }

    fn mutate<T>(
        &self,
        op: &'static str,
        apply: impl FnOnce(&mut GatewayConfig) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.write_lock.lock();
        let mut next = GatewayConfig::clone(&self.snapshot());
        let out = apply(&mut next)?;
        next.validate()?;
        if let Some(path) = &self.path {
            next.save(path)?;
        }
        *self.current.write() = Arc::new(next);
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(op, revision, "gateway config changed");
        self.events.publish(GatewayEvent::ConfigChanged { revision });
        Ok(out)
    }
}

fn keep_masked_key(incoming: &mut Provider, existing: &Provider) {
    if !existing.api_key.is_empty() && incoming.api_key == mask_key(&existing.api_key) {
        incoming.api_key = existing.api_key.clone();
    }
}
