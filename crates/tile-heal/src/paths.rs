//! Recovery path manager: success cache, static model, spare heuristics.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tile_proto::{PlanSource, ReconfigureAction, RecoveryContext, RecoveryPlan};
use tracing::{debug, info, warn};

/// A tiny static model: a plain JSON lookup from fault type to the spare that
/// historically absorbs it best.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathModel {
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

/// Recommends recovery plans and learns from committed successes.
///
/// Recommendation order: fingerprint cache, model mapping, first-free-spare
/// heuristic, isolate fallback. Equal context fingerprints always resolve to
/// the same cache entry.
pub struct PathManager {
    cache: RwLock<HashMap<String, RecoveryPlan>>,
    model: Option<PathModel>,
    spare_pool: Vec<String>,
}

impl PathManager {
    pub fn new(spare_pool: Vec<String>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            model: None,
            spare_pool,
        }
    }

    pub fn with_model(spare_pool: Vec<String>, model: PathModel) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            model: Some(model),
            spare_pool,
        }
    }

    /// Load the optional model file. Any load error is non-fatal: the manager
    /// simply runs without a model.
    pub fn with_model_file(spare_pool: Vec<String>, path: &Path) -> Self {
        let model = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<PathModel>(&data) {
                Ok(model) => {
                    info!(path = %path.display(), entries = model.mapping.len(), "loaded path model");
                    Some(model)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring malformed path model");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "path model unavailable");
                None
            }
        };
        Self {
            cache: RwLock::new(HashMap::new()),
            model,
            spare_pool,
        }
    }

    /// Produce a plan for the given context.
    pub fn recommend(&self, ctx: &RecoveryContext) -> RecoveryPlan {
        let fingerprint = ctx.fingerprint();
        if let Some(cached) = self.cache.read().get(&fingerprint) {
            debug!(node = %ctx.node_id, fault = %ctx.fault_type, "plan served from cache");
            return RecoveryPlan {
                confidence: 0.99,
                source: PlanSource::Cache,
                ..cached.clone()
            };
        }

        if let Some(model) = &self.model {
            if let Some(spare) = model.mapping.get(ctx.fault_type.as_str()) {
                return RecoveryPlan {
                    action: ReconfigureAction::FastSwap,
                    spare_id: Some(spare.clone()),
                    playbook: Some(format!("playbook_for_{spare}")),
                    confidence: 0.85,
                    source: PlanSource::Model,
                };
            }
        }

        if let Some(spare) = self.spare_pool.iter().find(|s| **s != ctx.node_id) {
            return RecoveryPlan {
                action: ReconfigureAction::FastSwap,
                spare_id: Some(spare.clone()),
                playbook: Some(format!("playbook_for_{spare}")),
                confidence: 0.5,
                source: PlanSource::Heuristic,
            };
        }

        RecoveryPlan {
            action: ReconfigureAction::Isolate,
            spare_id: None,
            playbook: None,
            confidence: 0.1,
            source: PlanSource::Fallback,
        }
    }

    /// Store a committed plan under the context's fingerprint so the next
    /// identical fingerprint short-circuits to the cache.
    pub fn register_success(&self, ctx: &RecoveryContext, plan: &RecoveryPlan) {
        let fingerprint = ctx.fingerprint();
        info!(node = %ctx.node_id, fault = %ctx.fault_type, "recovery path cached");
        self.cache.write().insert(fingerprint, plan.clone());
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}
