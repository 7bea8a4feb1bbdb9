//! Built-in caveat evaluators.

use super::{ACTION, Caveat, CaveatEvaluator, EXPIRATION, InvocationContext};
use crate::clock::saturating_sub;

/// Time bound. Tighter means earlier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpirationEvaluator;

impl CaveatEvaluator for ExpirationEvaluator {
    fn caveat_type(&self) -> &str {
        EXPIRATION
    }

    fn evaluate(&self, caveat: &Caveat, context: &InvocationContext<'_>) -> Result<(), String> {
        let Caveat::Expiration { expires } = caveat else {
            return Err("not an Expiration caveat".into());
        };
        if saturating_sub(context.now, context.clock_skew) > *expires {
            return Err(format!("expired at {expires}"));
        }
        Ok(())
    }

    fn is_compatible(&self, parent: &Caveat, child: &Caveat) -> bool {
        match (parent, child) {
            (Caveat::Expiration { expires: parent }, Caveat::Expiration { expires: child }) => {
                child <= parent
            }
            _ => false,
        }
    }

    fn merge(&self, existing: &Caveat, incoming: &Caveat) -> Option<Caveat> {
        match (existing, incoming) {
            (Caveat::Expiration { expires: a }, Caveat::Expiration { expires: b }) => {
                Some(Caveat::expiration(*a.min(b)))
            }
            _ => None,
        }
    }
}

/// Action-set restriction. Tighter means fewer actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionEvaluator;

impl CaveatEvaluator for ActionEvaluator {
    fn caveat_type(&self) -> &str {
        ACTION
    }

    fn evaluate(&self, caveat: &Caveat, context: &InvocationContext<'_>) -> Result<(), String> {
        let Caveat::Action { allowed_action } = caveat else {
            return Err("not an Action caveat".into());
        };
        if !allowed_action.contains(context.action) {
            return Err(format!(
                "action '{}' is not in {allowed_action:?}",
                context.action
            ));
        }
        Ok(())
    }

    fn is_compatible(&self, parent: &Caveat, child: &Caveat) -> bool {
        match (parent, child) {
            (
                Caveat::Action {
                    allowed_action: parent,
                },
                Caveat::Action {
                    allowed_action: child,
                },
            ) => child.is_subset(parent),
            _ => false,
        }
    }

    fn merge(&self, existing: &Caveat, incoming: &Caveat) -> Option<Caveat> {
        match (existing, incoming) {
            (Caveat::Action { allowed_action: a }, Caveat::Action { allowed_action: b }) => {
                Some(Caveat::Action {
                    allowed_action: a.intersection(b).cloned().collect(),
                })
            }
            _ => None,
        }
    }
}
