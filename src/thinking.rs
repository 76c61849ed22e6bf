//! Resolution of a coarse [`ThinkingLevel`] into a concrete reasoning budget.
//!
//! Budget rules, applied per backend policy:
//!
//! 1. If the effective max-output-tokens is too small to hold the minimum
//!    budget plus one answer token, raise it (capped by the model's output
//!    ceiling).
//! 2. The budget is the level's desired value, capped at max-output-tokens
//!    minus one so at least one non-reasoning token remains.
//! 3. If the capped budget falls under the minimum, thinking is disabled and
//!    the caller's max-output-tokens is left as requested.

use serde::{Deserialize, Serialize};

use crate::types::ThinkingLevel;

/// Per-backend budget policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingPolicy {
    /// Smallest budget the backend accepts.
    pub min_budget: u32,
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    /// Largest budget the backend accepts, if bounded.
    pub max_budget: Option<u32>,
    /// max-output-tokens used when the request leaves it unset.
    pub default_max_tokens: u32,
}

impl ThinkingPolicy {
    /// Anthropic extended thinking (`budget_tokens` >= 1024, < `max_tokens`).
    pub const ANTHROPIC: ThinkingPolicy = ThinkingPolicy {
        min_budget: 1024,
        low: 2048,
        medium: 8192,
        high: 16384,
        max_budget: None,
        default_max_tokens: 4096,
    };

    /// Gemini 2.5 `thinkingBudget`.
    pub const GEMINI: ThinkingPolicy = ThinkingPolicy {
        min_budget: 128,
        low: 1024,
        medium: 8192,
        high: 24576,
        max_budget: Some(24576),
        default_max_tokens: 8192,
    };

    /// OpenAI reasoning models: effort is passed through, only the output
    /// limit is adjusted so reasoning cannot starve the answer.
    pub const OPENAI: ThinkingPolicy = ThinkingPolicy {
        min_budget: 1024,
        low: 1024,
        medium: 4096,
        high: 16384,
        max_budget: None,
        default_max_tokens: 4096,
    };

    /// Desired budget for a level, before capping.
    pub fn desired(&self, level: ThinkingLevel) -> u32 {
        let raw = match level {
            ThinkingLevel::Low => self.low,
            ThinkingLevel::Medium => self.medium,
            ThinkingLevel::High => self.high,
        };
        match self.max_budget {
            Some(max) => raw.min(max),
            None => raw,
        }
    }
}

/// Resolved token limits for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingPlan {
    /// Effective max-output-tokens to send.
    pub max_tokens: u32,
    /// Reasoning budget, or `None` when thinking is off.
    pub budget: Option<u32>,
}

impl ThinkingPlan {
    pub fn enabled(&self) -> bool {
        self.budget.is_some()
    }
}

/// Resolve the token limits for a request.
///
/// `output_ceiling` is the model's hard max-output-tokens, when known.
///
/// ```
/// use switchyard_llm::thinking::{resolve, ThinkingPolicy};
/// use switchyard_llm::ThinkingLevel;
///
/// let plan = resolve(Some(ThinkingLevel::High), Some(5000), None, &ThinkingPolicy::ANTHROPIC);
/// assert_eq!(plan.budget, Some(4999));
/// assert_eq!(plan.max_tokens, 5000);
/// ```
pub fn resolve(
    level: Option<ThinkingLevel>,
    requested_max: Option<u32>,
    output_ceiling: Option<u32>,
    policy: &ThinkingPolicy,
) -> ThinkingPlan {
    let requested = requested_max.unwrap_or(policy.default_max_tokens);
    let Some(level) = level else {
        return ThinkingPlan {
            max_tokens: requested,
            budget: None,
        };
    };

    let desired = policy.desired(level);
    let mut max_tokens = requested;
    if max_tokens <= policy.min_budget {
        let bumped = desired.saturating_add(1);
        max_tokens = match output_ceiling {
            Some(ceiling) => bumped.min(ceiling),
            None => bumped,
        }
        .max(requested);
    }

    let budget = desired.min(max_tokens.saturating_sub(1));
    if budget < policy.min_budget {
        tracing::debug!(
            level = level.as_str(),
            requested,
            "thinking budget cannot fit under the output limit; disabling"
        );
        return ThinkingPlan {
            max_tokens: requested,
            budget: None,
        };
    }

    ThinkingPlan {
        max_tokens,
        budget: Some(budget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: ThinkingPolicy = ThinkingPolicy::ANTHROPIC;

    #[test]
    fn test_high_against_5000_stays_below_limit() {
        let plan = resolve(Some(ThinkingLevel::High), Some(5000), None, &P);
        let budget = plan.budget.unwrap();
        assert!(budget < 5000);
        assert!(budget >= P.min_budget);
        assert_eq!(plan.max_tokens, 5000);
    }

    #[test]
    fn test_no_level_leaves_limit_untouched() {
        let plan = resolve(None, Some(300), None, &P);
        assert_eq!(plan, ThinkingPlan { max_tokens: 300, budget: None });
        assert_eq!(resolve(None, None, None, &P).max_tokens, P.default_max_tokens);
    }

    #[test]
    fn test_small_limit_is_bumped() {
        let plan = resolve(Some(ThinkingLevel::Low), Some(500), None, &P);
        assert_eq!(plan.budget, Some(P.low));
        assert_eq!(plan.max_tokens, P.low + 1);
        assert!(plan.max_tokens > plan.budget.unwrap());
    }

    #[test]
    fn test_bump_capped_by_ceiling() {
        let plan = resolve(Some(ThinkingLevel::High), Some(1000), Some(3000), &P);
        assert_eq!(plan.max_tokens, 3000);
        assert_eq!(plan.budget, Some(2999));
    }

    #[test]
    fn test_disabled_when_ceiling_too_small() {
        let plan = resolve(Some(ThinkingLevel::Medium), Some(800), Some(1000), &P);
        assert_eq!(plan, ThinkingPlan { max_tokens: 800, budget: None });
    }

    #[test]
    fn test_budget_respects_backend_maximum() {
        let plan = resolve(Some(ThinkingLevel::High), Some(65536), None, &ThinkingPolicy::GEMINI);
        assert_eq!(plan.budget, Some(24576));
    }
}
