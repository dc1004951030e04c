//! Engine (A4, ambient): a thin facade composing C1–C8 into the three
//! top-level workflows an external front-end (out of scope per spec §1)
//! actually calls — `backup`, `restore`, `prune_info`/`prune_apply` — so
//! that caller never has to construct a `Pipeline`, `Restorer` and
//! `Retention` by hand or thread the object store between them.

use std::path::Path;
use std::sync::Arc;

use crate::codec::Codec;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::pipeline::{BackupReport, CancellationToken, Pipeline};
use crate::restore::{RestoreReport, Restorer};
use crate::retention::{Retention, RetentionPlan};
use crate::store::{self, ObjectStore};

pub struct Engine {
    config: Config,
    store: Arc<dyn ObjectStore>,
}

impl Engine {
    /// Builds the object-store backend from `config.storage` (spec §9
    /// "storage polymorphism"; factory selects by `storage.type`).
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = Arc::from(store::build(&config.storage, &config.backup)?);
        Ok(Self::with_store(config, store))
    }

    /// Constructs against an already-built store, bypassing the factory.
    /// This is how tests inject an in-memory double without a real S3 or
    /// WebDAV endpoint.
    pub fn with_store(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    pub fn test_connectivity(&self) -> Result<()> {
        self.store.test_connectivity()
    }

    pub fn backup(&self, source_path: &Path) -> Result<BackupReport> {
        let pipeline = Pipeline::new(self.config.clone(), Arc::clone(&self.store))?;
        pipeline.run(source_path)
    }

    /// Same as `backup`, but cooperative with an externally held
    /// `CancellationToken` (spec §5: workers finish their current file,
    /// start nothing new, and no index is emitted).
    pub fn backup_cancellable(&self, source_path: &Path, cancel: &CancellationToken) -> Result<BackupReport> {
        let pipeline = Pipeline::new(self.config.clone(), Arc::clone(&self.store))?;
        pipeline.run_cancellable(source_path, cancel)
    }

    pub fn restore(&self, backup_id: &str, destination: &Path) -> Result<RestoreReport> {
        let codec = self.codec()?;
        let restorer = Restorer::new(self.store.as_ref(), &codec);
        restorer.restore(backup_id, destination)
    }

    /// `info` mode (spec §4.8): what retention would do, without deleting.
    pub fn prune_info(&self) -> Result<RetentionPlan> {
        let retention = Retention::new(self.store.as_ref(), self.config.retention.clone());
        retention.plan()
    }

    /// Apply mode: runs the safe-deletion protocol for the given plan.
    /// `force` overrides the refusal to delete every remaining snapshot
    /// (spec §7 PolicyViolation).
    pub fn prune_apply(&self, plan: &RetentionPlan, force: bool) -> Result<()> {
        let retention = Retention::new(self.store.as_ref(), self.config.retention.clone());
        retention.apply(plan, force)
    }

    /// Computes and immediately applies the current retention policy in
    /// one call, for callers that don't need the intermediate plan.
    pub fn prune(&self, force: bool) -> Result<RetentionPlan> {
        let plan = self.prune_info()?;
        self.prune_apply(&plan, force)?;
        Ok(plan)
    }

    fn codec(&self) -> Result<Codec> {
        Codec::new(&self.config.backup.encryption_key, self.config.backup.encryption_algo, self.config.backup.compression_level)
            .map_err(BackupError::Other)
    }
}
