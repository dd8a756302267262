use serde::{Deserialize, Serialize};

use crate::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    Discovery,
    LongContext,
    CodeChange,
    Verification,
    Batch,
    General,
}

text_enum! {
    TaskCategory {
        Discovery => "discovery",
        LongContext => "long-context",
        CodeChange => "code-change",
        Verification => "verification",
        Batch => "batch",
        General => "general",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Immediate,
    Soon,
    Batch,
}

text_enum! {
    Urgency {
        Immediate => "immediate",
        Soon => "soon",
        Batch => "batch",
    }
}

/// One unit of work to route. Built fresh for every dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub query: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub category: TaskCategory,
    pub urgency: Urgency,
    #[serde(default)]
    pub force_executor: Option<String>,
    pub estimated_tokens: u64,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub intent_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl RoutingRequest {
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        let estimated_tokens = estimate_tokens(&query);
        Self {
            query,
            context: None,
            category: TaskCategory::General,
            urgency: Urgency::Soon,
            force_executor: None,
            estimated_tokens,
            working_dir: None,
            model: None,
            intent_id: None,
            job_id: None,
        }
    }

    pub fn category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn force_executor(mut self, executor: impl Into<String>) -> Self {
        self.force_executor = Some(executor.into());
        self
    }

    /// Attaches context and adds its size to the token estimate.
    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.estimated_tokens += estimate_tokens(&context.to_string());
        self.context = Some(context);
        self
    }

    pub fn estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn intent_id(mut self, id: impl Into<String>) -> Self {
        self.intent_id = Some(id.into());
        self
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }
}

/// Rough token estimate used when the caller does not supply one.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Routing outcome for one request. Never cached: account availability changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub executor: String,
    pub fallbacks: Vec<String>,
    pub reason: String,
    pub estimated_cost_usd: f64,
    pub can_defer: bool,
    pub deferred: bool,
}

impl RoutingDecision {
    /// Primary executor followed by the fallbacks, in order.
    pub fn chain(&self) -> Vec<&str> {
        std::iter::once(self.executor.as_str())
            .chain(self.fallbacks.iter().map(String::as_str))
            .collect()
    }
}
