use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::doi::Doi;
use crate::workflow::ResolutionResult;

use super::{ResultSink, SinkError};

/// Keeps every recorded result in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<ResolutionResult>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn results(&self) -> Vec<ResolutionResult> {
        self.lock().clone()
    }

    /// Returns the result recorded for `doi`, if any.
    #[must_use]
    pub fn get(&self, doi: &Doi) -> Option<ResolutionResult> {
        self.lock().iter().find(|result| &result.doi == doi).cloned()
    }

    /// Returns the number of recorded results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ResolutionResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn record(&self, result: &ResolutionResult) -> Result<(), SinkError> {
        self.lock().push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::workflow::FinalStatus;

    #[tokio::test]
    async fn test_records_in_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        for raw in ["10.1234/a", "10.1234/b"] {
            let result = ResolutionResult {
                doi: Doi::parse(raw).unwrap(),
                final_status: FinalStatus::Exhausted,
                attempts: Vec::new(),
            };
            sink.record(&result).await.unwrap();
        }

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.results()[1].doi.as_str(), "10.1234/b");
        assert!(sink.get(&Doi::parse("10.1234/a").unwrap()).is_some());
        assert!(sink.get(&Doi::parse("10.1234/c").unwrap()).is_none());
    }
}
