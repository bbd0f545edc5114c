use async_trait::async_trait;
use std::sync::Mutex;

use crate::models::Strategy;

/// Delivers one-time codes over email or SMS.
#[async_trait]
pub trait CodeDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        strategy: Strategy,
        identification: &str,
        code: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Records the dispatch without delivering anything. Codes are never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

#[async_trait]
impl CodeDispatcher for TracingDispatcher {
    async fn dispatch(
        &self,
        strategy: Strategy,
        _identification: &str,
        _code: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(strategy = strategy.as_str(), "Verification code dispatched");
        Ok(())
    }
}

/// Captures dispatched codes so tests can answer them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_code_for(&self, identification: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|(ident, _)| ident == identification)
            .map(|(_, code)| code.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl CodeDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        _strategy: Strategy,
        identification: &str,
        code: &str,
    ) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Recording dispatcher mutex poisoned: {}", e))?
            .push((identification.to_string(), code.to_string()));
        Ok(())
    }
}
