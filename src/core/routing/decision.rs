use super::types::{RoutingDecision, RoutingRequest, TaskCategory, Urgency};
use crate::core::config::RoutingRoles;

/// Output tokens assumed when estimating the cost of a request up front.
pub const ESTIMATED_OUTPUT_TOKENS: u64 = 1_000;

/// Whether rules 1-5 leave the request to the rotating-pool rule, which is
/// the only one that needs to know pool availability.
pub fn needs_pool_check(roles: &RoutingRoles, request: &RoutingRequest) -> bool {
    request.force_executor.is_none()
        && !is_long_context(roles, request)
        && !matches!(
            request.category,
            TaskCategory::CodeChange | TaskCategory::Verification | TaskCategory::Batch
        )
        && request.urgency != Urgency::Batch
}

fn is_long_context(roles: &RoutingRoles, request: &RoutingRequest) -> bool {
    request.category == TaskCategory::LongContext
        || request.estimated_tokens > roles.long_context_threshold_tokens
}

/// First matching rule wins. `pool_available` is only consulted for
/// discovery/general work; `estimate` prices the chosen primary.
pub fn decide(
    roles: &RoutingRoles,
    request: &RoutingRequest,
    pool_available: bool,
    estimate: impl Fn(&str) -> f64,
) -> RoutingDecision {
    let deferable = request.urgency != Urgency::Immediate;

    let (executor, fallbacks, reason, can_defer) = if let Some(forced) = &request.force_executor {
        (forced.clone(), vec![], "forced executor".to_string(), false)
    } else if is_long_context(roles, request) {
        (
            roles.long_context.clone(),
            vec![roles.metered.clone()],
            format!(
                "long context (~{} tokens) goes to the free long-context executor",
                request.estimated_tokens
            ),
            deferable,
        )
    } else if request.category == TaskCategory::CodeChange {
        (
            roles.tool_capable.clone(),
            vec![],
            "code changes need the tool-capable executor".to_string(),
            false,
        )
    } else if request.category == TaskCategory::Verification {
        (
            roles.deep_reasoning.clone(),
            vec![roles.general_purpose.clone()],
            "verification uses the deep-reasoning executor".to_string(),
            deferable,
        )
    } else if request.category == TaskCategory::Batch || request.urgency == Urgency::Batch {
        (
            roles.batch.clone(),
            vec![roles.metered.clone()],
            "batch work goes to the free batch executor".to_string(),
            true,
        )
    } else if pool_available {
        (
            roles.rotating_pool.clone(),
            vec![roles.metered.clone()],
            format!("{} work uses the free rotating pool", request.category),
            deferable,
        )
    } else {
        (
            roles.metered.clone(),
            vec![],
            format!(
                "{} pool exhausted, paying for the metered executor",
                roles.rotating_pool
            ),
            false,
        )
    };

    let fallbacks = dedup_chain(&executor, fallbacks);
    let estimated_cost_usd = estimate(&executor);
    RoutingDecision {
        executor,
        fallbacks,
        reason,
        estimated_cost_usd,
        can_defer,
        deferred: false,
    }
}

/// Drop fallbacks that repeat the primary or each other.
fn dedup_chain(primary: &str, fallbacks: Vec<String>) -> Vec<String> {
    let mut seen = vec![primary.to_string()];
    let mut out = Vec::new();
    for f in fallbacks {
        if !seen.contains(&f) {
            seen.push(f.clone());
            out.push(f);
        }
    }
    out
}
