//! Server-side spending-policy evaluation.
//!
//! Policies are keyed by payer address and managed outside the engine; the
//! evaluation here is a pure function of the policy, the proposed charge, and
//! the payer's aggregate daily spend. Checks run in a fixed order so denials
//! are deterministic for testing: per-call cap, daily cap, tool allowlist,
//! merchant allowlist — first failure wins.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Spending limits for a payer. An empty or absent allowlist means "no
/// restriction", not "deny all".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpendingPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spend_per_call: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spend_per_day: Option<Amount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlisted_tool_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlisted_merchants: Vec<String>,
}

/// A proposed charge, plus the payer's spend so far today (UTC).
#[derive(Debug, Clone)]
pub struct Charge<'a> {
    pub amount: Amount,
    pub tool_id: &'a str,
    pub merchant_wallet: &'a str,
    pub daily_spend: Decimal,
}

/// Outcome of a policy evaluation. The denial reason names the cap or
/// allowlist that tripped, so callers can tell "pay less" from "use another
/// tool".
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allowed,
    Denied { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allowed)
    }
}

/// Evaluates `policy` against `charge`. Pure and side-effect free.
pub fn evaluate(policy: &SpendingPolicy, charge: &Charge<'_>) -> PolicyDecision {
    let amount = charge.amount.as_decimal();

    if let Some(cap) = &policy.max_spend_per_call {
        if amount > cap.as_decimal() {
            return PolicyDecision::Denied {
                reason: format!("max_spend_per_call exceeded: {} > {}", charge.amount, cap),
            };
        }
    }
    if let Some(cap) = &policy.max_spend_per_day {
        if charge.daily_spend + amount > cap.as_decimal() {
            return PolicyDecision::Denied {
                reason: format!(
                    "max_spend_per_day exceeded: {} + {} > {}",
                    charge.daily_spend, charge.amount, cap
                ),
            };
        }
    }
    if !policy.allowlisted_tool_ids.is_empty()
        && !policy.allowlisted_tool_ids.iter().any(|t| t == charge.tool_id)
    {
        return PolicyDecision::Denied {
            reason: format!("tool not allowlisted: {}", charge.tool_id),
        };
    }
    if !policy.allowlisted_merchants.is_empty()
        && !policy
            .allowlisted_merchants
            .iter()
            .any(|m| m == charge.merchant_wallet)
    {
        return PolicyDecision::Denied {
            reason: format!("merchant not allowlisted: {}", charge.merchant_wallet),
        };
    }
    PolicyDecision::Allowed
}
