use super::Adapter;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Adapter that records every command and answers queries from a script.
///
/// Clones share the same log, so a test can keep a handle after moving the
/// adapter into a driver.
#[derive(Clone, Default)]
pub struct MockAdapter {
    sent: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<VecDeque<String>>>,
}

impl MockAdapter {
    /// An adapter with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses returned by successive queries.
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let adapter = Self::new();
        if let Ok(mut queue) = adapter.responses.lock() {
            queue.extend(responses.into_iter().map(Into::into));
        }
        adapter
    }

    /// Every command sent so far, writes and queries alike.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, command: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.record(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.record(command);
        self.responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .ok_or_else(|| DaqError::io("mock", format!("no scripted response for '{}'", command)))
    }
}
