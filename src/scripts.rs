//! Server-side procedure registry.
//!
//! Every procedure is assembled from a version header, the shared prelude in
//! `src/lua/prelude.lua` and an entry script. The registry registers them
//! with the store once at startup, caches the returned handles and
//! re-registers everything when the store reports a handle as unknown.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::algorithms::Algorithm;
use crate::error::{RateLimitError, Result};
use crate::store::Store;

/// Bumped whenever the procedure sources change incompatibly.
pub const PROCEDURE_VERSION: &str = "3";

const PRELUDE: &str = include_str!("lua/prelude.lua");
const SINGLE: &str = include_str!("lua/single.lua");
const SLIDING_WINDOW_BATCH: &str = include_str!("lua/sliding_window_batch.lua");
const COORDINATED: &str = include_str!("lua/coordinated.lua");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    /// One admission step for one key.
    Single(Algorithm),
    /// Sliding window admission for many keys in one call.
    SlidingWindowBatch,
    /// Global plus instance-local admission, committed together.
    Coordinated,
}

impl ProcedureKind {
    pub fn all() -> Vec<ProcedureKind> {
        let mut kinds: Vec<ProcedureKind> =
            Algorithm::ALL.iter().copied().map(ProcedureKind::Single).collect();
        kinds.push(ProcedureKind::SlidingWindowBatch);
        kinds.push(ProcedureKind::Coordinated);
        kinds
    }

    pub fn name(&self) -> String {
        match self {
            ProcedureKind::Single(algorithm) => algorithm.as_str().to_string(),
            ProcedureKind::SlidingWindowBatch => "sliding_window_batch".to_string(),
            ProcedureKind::Coordinated => "coordinated".to_string(),
        }
    }
}

/// A procedure ready to be registered with a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub kind: ProcedureKind,
    pub source: String,
}

impl Procedure {
    pub fn build(kind: ProcedureKind) -> Self {
        let header = format!(
            "-- ratewarden procedure {} v{}\n",
            kind.name(),
            PROCEDURE_VERSION
        );
        let entry = match kind {
            ProcedureKind::Single(algorithm) => {
                format!("local ALGORITHM = '{}'\n{}", algorithm.as_str(), SINGLE)
            }
            ProcedureKind::SlidingWindowBatch => SLIDING_WINDOW_BATCH.to_string(),
            ProcedureKind::Coordinated => COORDINATED.to_string(),
        };

        Self {
            kind,
            source: format!("{}{}\n{}", header, PRELUDE, entry),
        }
    }
}

#[derive(Debug)]
pub struct ScriptRegistry {
    procedures: Vec<Procedure>,
    handles: RwLock<HashMap<ProcedureKind, String>>,
    reload_lock: Mutex<()>,
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self {
            procedures: ProcedureKind::all().into_iter().map(Procedure::build).collect(),
            handles: RwLock::new(HashMap::new()),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    pub fn handle(&self, kind: ProcedureKind) -> Option<String> {
        self.handles
            .read()
            .ok()
            .and_then(|handles| handles.get(&kind).cloned())
    }

    /// Register every procedure with the store and cache the handles.
    pub async fn register_all(&self, store: &dyn Store) -> Result<()> {
        let mut loaded = HashMap::with_capacity(self.procedures.len());
        for procedure in &self.procedures {
            let handle = store.load_procedure(procedure).await?;
            debug!(procedure = %procedure.kind.name(), %handle, "Registered procedure");
            loaded.insert(procedure.kind, handle);
        }

        let mut handles = self
            .handles
            .write()
            .map_err(|_| RateLimitError::Configuration("procedure registry poisoned".into()))?;
        *handles = loaded;

        info!(
            count = self.procedures.len(),
            version = PROCEDURE_VERSION,
            "Procedures registered"
        );
        Ok(())
    }

    /// Re-register after the store lost its procedures. Concurrent callers
    /// that observed the same stale handle wait for a single reload.
    pub async fn reload(&self, store: &dyn Store, stale: &str) -> Result<()> {
        let _guard = self.reload_lock.lock().await;

        let still_stale = self
            .handles
            .read()
            .map(|handles| handles.values().any(|h| h == stale))
            .unwrap_or(true);
        if !still_stale {
            return Ok(());
        }

        info!("Store reported an unknown procedure, re-registering");
        self.register_all(store).await
    }
}
