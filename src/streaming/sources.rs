use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::factory::db::DbHandle;
use crate::streaming::manager::StatusSource;

/// Polls a build's status from the store.
pub struct BuildStatusSource {
    db: DbHandle,
    build_id: i64,
}

impl BuildStatusSource {
    pub fn new(db: DbHandle, build_id: i64) -> Self {
        Self { db, build_id }
    }
}

#[async_trait]
impl StatusSource for BuildStatusSource {
    async fn current_status(&self) -> Result<String> {
        let build_id = self.build_id;
        let status = self
            .db
            .call(move |db| db.get_build_status(build_id))
            .await?
            .ok_or_else(|| anyhow!("Build {} not found", build_id))?;
        Ok(status.as_str().to_string())
    }
}

/// Polls a run's status from the store.
pub struct RunStatusSource {
    db: DbHandle,
    run_id: String,
}

impl RunStatusSource {
    pub fn new(db: DbHandle, run_id: &str) -> Self {
        Self {
            db,
            run_id: run_id.to_string(),
        }
    }
}

#[async_trait]
impl StatusSource for RunStatusSource {
    async fn current_status(&self) -> Result<String> {
        let run_id = self.run_id.clone();
        let run = self
            .db
            .call(move |db| db.get_run(&run_id))
            .await?
            .ok_or_else(|| anyhow!("Run {} not found", self.run_id))?;
        Ok(run.status.as_str().to_string())
    }
}
