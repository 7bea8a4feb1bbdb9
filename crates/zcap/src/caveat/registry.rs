//! Caveat evaluator registry and the merge / compatibility / evaluation rules.

use super::{ActionEvaluator, Caveat, ExpirationEvaluator};
use crate::Capability;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Everything an evaluator may inspect when deciding one invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub now: DateTime<Utc>,
    pub clock_skew: TimeDelta,
    pub action: &'a str,
    pub invocation_target: &'a str,
    pub parameters: &'a Map<String, Value>,
}

/// Caveat engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaveatError {
    /// No evaluator knows this type. Unknown caveats always fail closed.
    #[error("no evaluator registered for caveat type '{0}'")]
    Unregistered(String),

    /// The caveat evaluated to false.
    #[error("caveat '{caveat_type}' is not satisfied: {reason}")]
    Violated { caveat_type: String, reason: String },

    /// A child entry is less restrictive than the inherited one.
    #[error("caveat '{caveat_type}' is less restrictive than its inherited bound")]
    Relaxed { caveat_type: String },
}

impl CaveatError {
    pub fn caveat_type(&self) -> &str {
        match self {
            CaveatError::Unregistered(caveat_type)
            | CaveatError::Violated { caveat_type, .. }
            | CaveatError::Relaxed { caveat_type } => caveat_type,
        }
    }
}

/// Behaviour for one caveat type.
pub trait CaveatEvaluator: Send + Sync {
    /// The `type` tag this evaluator handles.
    fn caveat_type(&self) -> &str;

    /// Check the caveat against an invocation. `Err` carries the reason.
    fn evaluate(&self, caveat: &Caveat, context: &InvocationContext<'_>) -> Result<(), String>;

    /// Whether `child` is at least as restrictive as `parent`.
    fn is_compatible(&self, parent: &Caveat, child: &Caveat) -> bool;

    /// Collapse two caveats of this type into the tighter one.
    ///
    /// Returning `None` keeps both entries; both are then enforced.
    fn merge(&self, _existing: &Caveat, _incoming: &Caveat) -> Option<Caveat> {
        None
    }
}

/// Maps caveat type tags to evaluators.
///
/// Built once at startup and shared behind an `Arc`; verification only reads it.
#[derive(Clone)]
pub struct CaveatRegistry {
    evaluators: HashMap<String, Arc<dyn CaveatEvaluator>>,
}

impl Default for CaveatRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CaveatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.evaluators.keys().collect();
        types.sort();
        f.debug_struct("CaveatRegistry").field("types", &types).finish()
    }
}

impl CaveatRegistry {
    /// A registry that knows no caveat types.
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// A registry with the Expiration and Action evaluators.
    pub fn with_builtins() -> Self {
        Self::empty()
            .with(ExpirationEvaluator)
            .with(ActionEvaluator)
    }

    /// Register an evaluator, returning the one it replaces.
    pub fn register(
        &mut self,
        evaluator: impl CaveatEvaluator + 'static,
    ) -> Option<Arc<dyn CaveatEvaluator>> {
        let evaluator: Arc<dyn CaveatEvaluator> = Arc::new(evaluator);
        self.evaluators
            .insert(evaluator.caveat_type().to_string(), evaluator)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, evaluator: impl CaveatEvaluator + 'static) -> Self {
        self.register(evaluator);
        self
    }

    pub fn contains(&self, caveat_type: &str) -> bool {
        self.evaluators.contains_key(caveat_type)
    }

    fn evaluator(&self, caveat_type: &str) -> Result<&dyn CaveatEvaluator, CaveatError> {
        self.evaluators
            .get(caveat_type)
            .map(|e| e.as_ref())
            .ok_or_else(|| CaveatError::Unregistered(caveat_type.to_string()))
    }

    /// Every caveat must hold. Stops at the first failure.
    pub fn evaluate_all(
        &self,
        caveats: &[Caveat],
        context: &InvocationContext<'_>,
    ) -> Result<(), CaveatError> {
        for caveat in caveats {
            self.evaluator(caveat.caveat_type())?
                .evaluate(caveat, context)
                .map_err(|reason| CaveatError::Violated {
                    caveat_type: caveat.caveat_type().to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// A child may add caveat types freely; an entry whose type the parent
    /// already restricts must tighten at least one inherited entry.
    pub fn check_compatibility(
        &self,
        parent: &[Caveat],
        child: &[Caveat],
    ) -> Result<(), CaveatError> {
        for caveat in parent {
            self.evaluator(caveat.caveat_type())?;
        }

        for caveat in child {
            let evaluator = self.evaluator(caveat.caveat_type())?;
            let mut inherited = parent
                .iter()
                .filter(|p| p.caveat_type() == caveat.caveat_type())
                .peekable();

            if inherited.peek().is_none() {
                continue;
            }
            if !inherited.any(|p| evaluator.is_compatible(p, caveat)) {
                return Err(CaveatError::Relaxed {
                    caveat_type: caveat.caveat_type().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fold caveat layers, first to last, tightening duplicates.
    pub fn merge_caveats(&self, layers: &[&[Caveat]]) -> Result<Vec<Caveat>, CaveatError> {
        let mut merged = Vec::new();
        for caveat in layers.iter().flat_map(|layer| layer.iter()) {
            self.merge_into(&mut merged, caveat)?;
        }
        Ok(merged)
    }

    /// Effective caveats of a root-first chain.
    pub fn merge_chain(&self, chain: &[Capability]) -> Result<Vec<Caveat>, CaveatError> {
        let layers: Vec<&[Caveat]> = chain.iter().map(|c| c.caveat.as_slice()).collect();
        self.merge_caveats(&layers)
    }

    fn merge_into(&self, merged: &mut Vec<Caveat>, caveat: &Caveat) -> Result<(), CaveatError> {
        let evaluator = self.evaluator(caveat.caveat_type())?;
        if merged.contains(caveat) {
            return Ok(());
        }

        for existing in merged
            .iter_mut()
            .filter(|e| e.caveat_type() == caveat.caveat_type())
        {
            if let Some(tightened) = evaluator.merge(existing, caveat) {
                *existing = tightened;
                return Ok(());
            }
        }

        merged.push(caveat.clone());
        Ok(())
    }
}
