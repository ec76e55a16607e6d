//! Registry of running processes, one per database name.

use crate::config::AuthConfig;
use crate::error::SatelliteResult;
use crate::process::SatelliteProcess;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Running processes keyed by database name.
///
/// The host owns the registry. Concurrent calls are serialised, so two
/// callers asking for the same database share one process.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<String, SatelliteProcess>>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process for `db_name`, building and starting one with
    /// `build` if none is running.
    pub async fn ensure_started<F>(
        &self,
        db_name: &str,
        auth: AuthConfig,
        build: F,
    ) -> SatelliteResult<SatelliteProcess>
    where
        F: FnOnce() -> SatelliteProcess,
    {
        let mut processes = self.processes.lock().await;
        if let Some(process) = processes.get(db_name) {
            return Ok(process.clone());
        }

        let process = build();
        process.start(auth).await?;
        processes.insert(db_name.to_string(), process.clone());
        info!("registered process for {db_name}");
        Ok(process)
    }

    /// The running process for `db_name`.
    pub async fn get(&self, db_name: &str) -> Option<SatelliteProcess> {
        self.processes.lock().await.get(db_name).cloned()
    }

    /// Names of databases with a running process.
    pub async fn db_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops and forgets the process for `db_name`. Returns false when none
    /// was running.
    pub async fn stop(&self, db_name: &str) -> SatelliteResult<bool> {
        let mut processes = self.processes.lock().await;
        let Some(process) = processes.remove(db_name) else {
            return Ok(false);
        };
        process.stop().await?;
        Ok(true)
    }

    /// Stops every process. All are stopped even if some fail; the first
    /// failure is returned.
    pub async fn stop_all(&self) -> SatelliteResult<()> {
        let mut processes = self.processes.lock().await;
        let mut result = Ok(());
        for (db_name, process) in processes.drain() {
            if let Err(err) = process.stop().await {
                warn!("stopping {db_name} failed: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}
