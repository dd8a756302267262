use serde::{Deserialize, Serialize};

use crate::core::routing::{RoutingDecision, RoutingRequest};
use crate::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disabled,
    RateLimited,
    QuotaExceeded,
}

text_enum! {
    AccountStatus {
        Active => "active",
        Disabled => "disabled",
        RateLimited => "rate_limited",
        QuotaExceeded => "quota_exceeded",
    }
}

/// One credential/identity slot for one executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorAccount {
    pub id: i64,
    pub executor: String,
    pub identity: String,
    pub status: AccountStatus,
    pub cooldown_until: Option<i64>,
    pub consecutive_failures: i64,
    pub daily_token_limit: Option<i64>,
    pub tokens_used_today: i64,
    pub last_used_at: Option<i64>,
}

impl ExecutorAccount {
    /// Active (or rate-limited with an expired cooldown), under the failure
    /// threshold and under the daily token limit.
    pub fn is_selectable(&self, now_ms: i64, max_failures: i64) -> bool {
        let status_ok = match self.status {
            AccountStatus::Active => true,
            AccountStatus::RateLimited => self.cooldown_until.is_some(),
            AccountStatus::Disabled | AccountStatus::QuotaExceeded => false,
        };
        let cooled = self.cooldown_until.is_none_or(|until| until <= now_ms);
        let under_limit = self
            .daily_token_limit
            .is_none_or(|limit| self.tokens_used_today < limit);
        status_ok && cooled && self.consecutive_failures < max_failures && under_limit
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub id: i64,
    pub executor: String,
    pub account: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub created_at: i64,
    pub date_bucket: String,
    pub job_id: Option<String>,
    pub intent_id: Option<String>,
    pub run_id: Option<String>,
    pub query_hash: Option<String>,
}

/// Per-executor aggregate for one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorCostSummary {
    pub executor: String,
    pub calls: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCost {
    pub date: String,
    pub calls: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum! {
    DeferredStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeferredTask {
    pub id: String,
    pub request: RoutingRequest,
    pub decision: RoutingDecision,
    pub created_at: i64,
    pub scheduled_for: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub status: DeferredStatus,
}

/// Shared by signals and intents. Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Batch,
}

text_enum! {
    Priority {
        Critical => "critical",
        High => "high",
        Normal => "normal",
        Low => "low",
        Batch => "batch",
    }
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Batch,
    ];

    /// 0 is most urgent. Stored as an integer so the store can sort on it.
    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn from_rank(rank: i64) -> Self {
        Priority::ALL
            .get(rank.max(0) as usize)
            .copied()
            .unwrap_or(Priority::Batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum! {
    IntentStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Intent {
    pub id: String,
    pub title: String,
    pub description: String,
    pub intent_type: String,
    pub risk_level: String,
    pub priority: Priority,
    pub scheduled_for: Option<i64>,
    pub deadline: Option<i64>,
    pub lane: Option<String>,
    pub executor_preference: Option<String>,
    pub query: String,
    pub working_dir: Option<String>,
    pub source_proposal_id: Option<String>,
    pub status: IntentStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields a caller supplies when creating an intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewIntent {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub intent_type: String,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub scheduled_for: Option<i64>,
    #[serde(default)]
    pub deadline: Option<i64>,
    #[serde(default)]
    pub lane: Option<String>,
    #[serde(default)]
    pub executor_preference: Option<String>,
    pub query: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub source_proposal_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStage {
    Idea,
    Research,
    Plan,
    Archived,
    Rejected,
}

text_enum! {
    ProposalStage {
        Idea => "idea",
        Research => "research",
        Plan => "plan",
        Archived => "archived",
        Rejected => "rejected",
    }
}

impl ProposalStage {
    /// Stage reached by one approval. `None` for rejected proposals.
    pub fn next_on_approval(self) -> Option<ProposalStage> {
        match self {
            ProposalStage::Idea => Some(ProposalStage::Research),
            ProposalStage::Research => Some(ProposalStage::Plan),
            ProposalStage::Plan | ProposalStage::Archived => Some(ProposalStage::Archived),
            ProposalStage::Rejected => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum! {
    ApprovalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub stage: ProposalStage,
    pub proposal_type: String,
    pub risk_level: String,
    pub approval_status: ApprovalStatus,
    pub snooze_until: Option<i64>,
    pub rejection_reason: Option<String>,
    pub source: Option<String>,
    pub source_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProposal {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub proposal_type: String,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum! {
    RunStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    pub intent_id: String,
    pub executor: Option<String>,
    pub status: RunStatus,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub exhausted: bool,
    pub attempt: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> ExecutorAccount {
        ExecutorAccount {
            id: 1,
            executor: "gemini".into(),
            identity: "a".into(),
            status: AccountStatus::Active,
            cooldown_until: None,
            consecutive_failures: 0,
            daily_token_limit: None,
            tokens_used_today: 0,
            last_used_at: None,
        }
    }

    #[test]
    fn selectable_requires_expired_cooldown() {
        let mut acc = account();
        acc.status = AccountStatus::RateLimited;
        acc.cooldown_until = Some(1_000);
        assert!(!acc.is_selectable(999, 5));
        assert!(acc.is_selectable(1_000, 5));
    }

    #[test]
    fn selectable_respects_failures_and_limit() {
        let mut acc = account();
        acc.consecutive_failures = 5;
        assert!(!acc.is_selectable(0, 5));
        acc.consecutive_failures = 0;
        acc.daily_token_limit = Some(100);
        acc.tokens_used_today = 100;
        assert!(!acc.is_selectable(0, 5));
    }

    #[test]
    fn disabled_is_never_selectable() {
        let mut acc = account();
        acc.status = AccountStatus::Disabled;
        assert!(!acc.is_selectable(0, 5));
    }

    #[test]
    fn priority_rank_orders_critical_first() {
        assert!(Priority::Critical < Priority::Low);
        assert_eq!(Priority::from_rank(2), Priority::Normal);
        assert_eq!(Priority::from_rank(99), Priority::Batch);
    }

    #[test]
    fn approval_advances_one_stage() {
        assert_eq!(
            ProposalStage::Idea.next_on_approval(),
            Some(ProposalStage::Research)
        );
        assert_eq!(
            ProposalStage::Plan.next_on_approval(),
            Some(ProposalStage::Archived)
        );
        assert_eq!(
            ProposalStage::Archived.next_on_approval(),
            Some(ProposalStage::Archived)
        );
        assert_eq!(ProposalStage::Rejected.next_on_approval(), None);
    }
}
