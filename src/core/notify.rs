use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Where exhaustion and intent-failure alerts go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<()>;
}

/// Fallback sink when no chat is configured: alerts land in the log.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send_message(&self, text: &str) -> Result<()> {
        warn!(target: "switchyard::alert", "{}", text);
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingNotifier;

#[cfg(test)]
mod recording {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Keeps every message for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn send_message(&self, text: &str) -> Result<()> {
            self.messages.lock().push(text.to_string());
            Ok(())
        }
    }
}
