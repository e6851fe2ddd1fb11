//! In-memory run ledger.
//!
//! The engine is the single writer of run state. Every run it has accepted
//! lives here with its original request and its per-item asset rows; the
//! Redis snapshot cache is a projection of this ledger, never the other way
//! around.
//!
//! A per-run execution lock keeps two executors (or a redelivered job racing
//! its original) from driving the same run at once: the second caller gets
//! [`EngineError::RunLocked`] and backs off to queue redelivery.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use fable_models::{
    AssetKey, Generation, GenerationId, GenerationRequest, GenerationStep, SceneAsset,
    ScriptBreakdown,
};

use crate::error::{EngineError, EngineResult};

struct LedgerEntry {
    generation: Generation,
    request: GenerationRequest,
    assets: BTreeMap<AssetKey, SceneAsset>,
}

/// Authoritative in-process store of runs and their assets.
#[derive(Default)]
pub struct GenerationLedger {
    entries: Mutex<HashMap<GenerationId, LedgerEntry>>,
    locks: Mutex<HashSet<GenerationId>>,
}

impl GenerationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new run, keeping any existing entry.
    ///
    /// Returns `true` when the run was inserted, `false` when the ledger
    /// already held it (a redelivered start job resumes instead).
    pub fn register(&self, generation: Generation, request: GenerationRequest) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(generation.id.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(LedgerEntry {
                    generation,
                    request,
                    assets: BTreeMap::new(),
                });
                true
            }
        }
    }

    pub fn contains(&self, id: &GenerationId) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    /// Current run record, if the ledger holds it.
    pub fn generation(&self, id: &GenerationId) -> Option<Generation> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.generation.clone())
    }

    /// Original request the run was started with.
    pub fn request(&self, id: &GenerationId) -> Option<GenerationRequest> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.request.clone())
    }

    /// Apply a mutation to the run record and return the updated copy.
    pub fn update<F>(&self, id: &GenerationId, mutate: F) -> EngineResult<Generation>
    where
        F: FnOnce(&mut Generation),
    {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::ledger(format!("Unknown run {id}")))?;
        mutate(&mut entry.generation);
        Ok(entry.generation.clone())
    }

    /// All asset rows of a run, ordered by (step, index).
    pub fn assets(&self, id: &GenerationId) -> Vec<SceneAsset> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.assets.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Asset rows of one step, ordered by index.
    pub fn assets_for_step(&self, id: &GenerationId, step: GenerationStep) -> Vec<SceneAsset> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| {
                e.assets
                    .values()
                    .filter(|a| a.key.step == step)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn asset(&self, id: &GenerationId, key: AssetKey) -> Option<SceneAsset> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .and_then(|e| e.assets.get(&key).cloned())
    }

    /// Fetch an asset row, creating a pending one if the step has not yet
    /// planned it.
    pub fn ensure_asset(&self, id: &GenerationId, key: AssetKey) -> EngineResult<SceneAsset> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::ledger(format!("Unknown run {id}")))?;
        let asset = entry
            .assets
            .entry(key)
            .or_insert_with(|| SceneAsset::new(id.clone(), key));
        Ok(asset.clone())
    }

    /// Apply a mutation to an asset row and return the updated copy.
    pub fn update_asset<F>(
        &self,
        id: &GenerationId,
        key: AssetKey,
        mutate: F,
    ) -> EngineResult<SceneAsset>
    where
        F: FnOnce(&mut SceneAsset),
    {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::ledger(format!("Unknown run {id}")))?;
        let asset = entry
            .assets
            .get_mut(&key)
            .ok_or_else(|| EngineError::ledger(format!("Unknown asset {key} on run {id}")))?;
        mutate(asset);
        Ok(asset.clone())
    }

    /// Script breakdown produced by the run's script stage, if completed.
    pub fn breakdown(&self, id: &GenerationId) -> Option<ScriptBreakdown> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(id)
            .and_then(|e| e.assets.get(&AssetKey::new(GenerationStep::Script, 0)))
            .and_then(|a| a.output.as_ref())
            .and_then(|o| o.breakdown())
            .cloned()
    }

    /// Acquire the run's execution lock, released when the guard drops.
    pub fn lock_run(self: &Arc<Self>, id: &GenerationId) -> EngineResult<RunGuard> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.insert(id.clone()) {
            return Err(EngineError::RunLocked(id.clone()));
        }
        Ok(RunGuard {
            ledger: Arc::clone(self),
            id: id.clone(),
        })
    }

    pub fn is_locked(&self, id: &GenerationId) -> bool {
        self.locks.lock().unwrap().contains(id)
    }

    fn unlock(&self, id: &GenerationId) {
        self.locks.lock().unwrap().remove(id);
    }
}

/// Holds a run's execution lock for the duration of one pipeline pass.
pub struct RunGuard {
    ledger: Arc<GenerationLedger>,
    id: GenerationId,
}

impl RunGuard {
    pub fn id(&self) -> &GenerationId {
        &self.id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.ledger.unlock(&self.id);
    }
}
