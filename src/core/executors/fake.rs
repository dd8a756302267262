//! Scripted adapter for tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{AdapterOutput, ExecutorAdapter, InvokeRequest, QUOTA_EXIT_CODE};

#[derive(Debug, Clone)]
pub enum FakeResponse {
    Ok(String),
    Exit(i32, String),
    Quota,
    TransportError(String),
}

/// Pops scripted responses in order, then repeats the fallback forever.
#[derive(Clone)]
pub struct FakeAdapter {
    name: String,
    script: Arc<Mutex<VecDeque<FakeResponse>>>,
    fallback: FakeResponse,
    tokens: (u64, u64),
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    accounts: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeAdapter {
    pub fn new(name: &str, fallback: FakeResponse) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            tokens: (1_000, 500),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            accounts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ok(name: &str) -> Self {
        Self::new(name, FakeResponse::Ok(format!("{} done", name)))
    }

    pub fn quota(name: &str) -> Self {
        Self::new(name, FakeResponse::Quota)
    }

    pub fn failing(name: &str) -> Self {
        Self::new(name, FakeResponse::Exit(1, format!("{} broke", name)))
    }

    pub fn then(self, response: FakeResponse) -> Self {
        self.script.lock().push_back(response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens = (input, output);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Account identity seen by each call, in order.
    pub fn accounts_seen(&self) -> Vec<Option<String>> {
        self.accounts.lock().clone()
    }
}

#[async_trait]
impl ExecutorAdapter for FakeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvokeRequest<'_>) -> Result<AdapterOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.accounts
            .lock()
            .push(request.account.map(str::to_string));
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = request.cancel.cancelled() => bail!("cancelled"),
            }
        }
        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let (input_tokens, output_tokens) = self.tokens;
        let (output, exit_code) = match response {
            FakeResponse::Ok(text) => (text, 0),
            FakeResponse::Exit(code, text) => (text, code),
            FakeResponse::Quota => ("quota exceeded".to_string(), QUOTA_EXIT_CODE),
            FakeResponse::TransportError(msg) => bail!(msg),
        };
        Ok(AdapterOutput {
            output,
            exit_code,
            duration_ms: 5,
            input_tokens,
            output_tokens,
        })
    }
}
