use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::engine::{Engine, Policy};
use crate::gateway::CardGateway;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// The wire-level database name selects a tenant: an isolated engine with its
/// own WAL file, hold reaper, and compactor. Engines are built lazily on the
/// first connection that names them.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: Policy,
    gateway: Arc<dyn CardGateway>,
}

/// Collapse a database name to the characters allowed in a WAL filename.
/// The sanitized form is also the cache key, so two spellings that reduce to
/// the same filename resolve to the same engine.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(name)
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        policy: Policy,
        gateway: Arc<dyn CardGateway>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
            gateway,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let name = sanitize(tenant)?;

        // Read the count before taking the shard lock; len() touches every
        // shard and must not run while we hold a vacant entry.
        let at_capacity = self.engines.len() >= MAX_TENANTS;

        match self.engines.entry(name.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                if at_capacity {
                    return Err(io::Error::other("too many tenants"));
                }
                let engine = self.boot_engine(&name)?;
                slot.insert(engine.clone());
                metrics::gauge!(crate::observability::TENANTS_ACTIVE)
                    .set(self.engines.len() as f64);
                Ok(engine)
            }
        }
    }

    /// Replay the tenant's WAL and start its background tasks.
    fn boot_engine(&self, name: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.policy,
            self.gateway.clone(),
        )?);

        let sweeper = engine.clone();
        tokio::spawn(async move { reaper::run_reaper(sweeper).await });

        let compactor = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move { reaper::run_compactor(compactor, threshold).await });

        Ok(engine)
    }
}
