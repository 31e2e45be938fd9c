//! Pool import and root dataset mount.

use std::path::{Path, PathBuf};

use crate::error::{BootError, BootResult};
use crate::manifest::RetryPolicy;

use super::system::BootSystem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSelector {
    Named(String),
    All,
}

impl PoolSelector {
    pub fn label(&self) -> &str {
        match self {
            PoolSelector::Named(name) => name,
            PoolSelector::All => "all",
        }
    }
}

/// What to import, built once per boot from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolImportRequest {
    pub pool: PoolSelector,
    pub cachefile: Option<PathBuf>,
    /// `/dev/disk/by-*` directory to scan instead of `/dev`.
    pub scan_dir: Option<PathBuf>,
}

impl PoolImportRequest {
    pub fn named(pool: impl Into<String>) -> Self {
        Self {
            pool: PoolSelector::Named(pool.into()),
            cachefile: None,
            scan_dir: None,
        }
    }

    pub fn all() -> Self {
        Self {
            pool: PoolSelector::All,
            cachefile: None,
            scan_dir: None,
        }
    }
}

/// The root dataset once it is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mounted {
    pub pools: Vec<String>,
    pub dataset: String,
    pub target: PathBuf,
}

pub struct PoolMounter<'a, S: BootSystem> {
    system: &'a mut S,
    retry: &'a RetryPolicy,
}

impl<'a, S: BootSystem> PoolMounter<'a, S> {
    pub fn new(system: &'a mut S, retry: &'a RetryPolicy) -> Self {
        Self { system, retry }
    }

    /// Import, pick the root dataset and mount it at `target`.
    pub fn import_and_mount(
        &mut self,
        request: PoolImportRequest,
        root_hint: Option<&str>,
        target: &Path,
        options: Option<&str>,
    ) -> BootResult<Mounted> {
        let pools = self.import(&request)?;
        let dataset = self.root_dataset(&pools, root_hint)?;
        self.mount(&dataset, target, options)?;
        Ok(Mounted {
            pools,
            dataset,
            target: target.to_path_buf(),
        })
    }

    /// Import the requested pool(s), retrying while devices are still
    /// appearing. A pool that is already imported counts as imported.
    pub fn import(&mut self, request: &PoolImportRequest) -> BootResult<Vec<String>> {
        let attempts = self.retry.import_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(pools) = self.imported(&request.pool)? {
                return Ok(pools);
            }

            tracing::info!(pool = request.pool.label(), attempt, attempts, "importing");
            if self.system.import_pool(request)? {
                if let Some(pools) = self.imported(&request.pool)? {
                    return Ok(pools);
                }
            }

            if attempt < attempts {
                tracing::warn!(
                    pool = request.pool.label(),
                    attempt,
                    "pool not available yet, retrying"
                );
                self.system.sleep(self.retry.import_delay());
            }
        }

        Err(BootError::PoolNotFound(request.pool.label().to_string()))
    }

    fn imported(&mut self, selector: &PoolSelector) -> BootResult<Option<Vec<String>>> {
        let pools = self.system.imported_pools()?;
        Ok(match selector {
            PoolSelector::Named(name) => pools.contains(name).then(|| vec![name.clone()]),
            PoolSelector::All => (!pools.is_empty()).then_some(pools),
        })
    }

    /// The hinted dataset if it exists, else the first pool's `bootfs`.
    pub fn root_dataset(&mut self, pools: &[String], hint: Option<&str>) -> BootResult<String> {
        if let Some(dataset) = hint {
            return if self.system.dataset_exists(dataset)? {
                Ok(dataset.to_string())
            } else {
                Err(BootError::DatasetNotFound(dataset.to_string()))
            };
        }

        for pool in pools {
            if let Some(dataset) = self.system.bootfs(pool)? {
                tracing::info!(pool = %pool, dataset = %dataset, "using bootfs");
                return Ok(dataset);
            }
        }
        Err(BootError::DatasetNotFound(format!(
            "no bootfs set on {}",
            pools.join(", ")
        )))
    }

    pub fn mount(&mut self, dataset: &str, target: &Path, options: Option<&str>) -> BootResult<()> {
        tracing::info!(dataset, target = %target.display(), "mounting root");
        self.system.mount_dataset(dataset, target, options)
    }
}
