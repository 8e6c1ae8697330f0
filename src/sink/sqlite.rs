//! SQLite-backed [`ResultSink`].
//!
//! Each result is one `doi_fulltext` row plus its ordered `doi_attempts`,
//! written in a single transaction. Reruns replace both, except that a stored
//! document is never replaced by a failure.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::doi::Doi;
use crate::workflow::{FinalStatus, ResolutionResult};

use super::{ResultSink, SinkError};

/// Stores results and learned crawl delays in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    db: Database,
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl SqliteSink {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Returns every DOI with a stored document.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Database`] if the query fails.
    pub async fn resolved_dois(&self) -> Result<Vec<Doi>, SinkError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT doi FROM doi_fulltext WHERE status = 'resolved'")
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(raw,)| Doi::parse(&raw).ok())
            .collect())
    }

    /// Returns the stored status label for `doi`, if it has a row.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Database`] if the query fails.
    pub async fn status_of(&self, doi: &Doi) -> Result<Option<String>, SinkError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM doi_fulltext WHERE doi = ?")
            .bind(doi.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|(status,)| status))
    }

    /// Loads crawl delays saved by earlier runs.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Database`] if the query fails.
    pub async fn load_crawl_delays(&self) -> Result<Vec<(String, Duration)>, SinkError> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT host, interval_ms FROM crawl_delays")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|(host, ms)| (host, Duration::from_millis(u64::try_from(ms).unwrap_or(0))))
            .collect())
    }

    /// Saves learned crawl delays, keeping the larger of stored and new values.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Database`] if a write fails.
    #[instrument(skip_all, fields(hosts = intervals.len()))]
    pub async fn save_crawl_delays(
        &self,
        intervals: &HashMap<String, Duration>,
    ) -> Result<(), SinkError> {
        let mut tx = self.db.pool().begin().await?;
        for (host, interval) in intervals {
            let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
            sqlx::query(
                r"INSERT INTO crawl_delays (host, interval_ms) VALUES (?, ?)
                  ON CONFLICT(host) DO UPDATE SET
                      interval_ms = MAX(interval_ms, excluded.interval_ms),
                      updated_at = datetime('now')",
            )
            .bind(host)
            .bind(interval_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("saved crawl delays");
        Ok(())
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    #[instrument(skip_all, fields(doi = %result.doi, status = %result.final_status))]
    async fn record(&self, result: &ResolutionResult) -> Result<(), SinkError> {
        let mut tx = self.db.pool().begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM doi_fulltext WHERE doi = ?")
                .bind(result.doi.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some_and(|(status,)| status == "resolved") && !result.is_resolved() {
            debug!("keeping previously stored document");
            tx.rollback().await?;
            return Ok(());
        }

        let last = result.attempts.last();
        let http_status = last.and_then(|a| a.http_status).map(i64::from);
        let content_type = last.and_then(|a| a.content_type.clone());

        let (url, source_kind, format, content) = match &result.final_status {
            FinalStatus::Resolved {
                candidate,
                url,
                format,
                payload,
            } => (
                Some(url.as_str()),
                Some(candidate.kind.as_str()),
                Some(format.as_str()),
                Some(payload.as_slice()),
            ),
            FinalStatus::Exhausted | FinalStatus::Error(_) => (None, None, None, None),
        };
        let content_length = to_i64(content.map_or(0, <[u8]>::len));

        sqlx::query(
            r"INSERT INTO doi_fulltext (
                doi, status, url, source_kind, http_status, content_type,
                format, content, content_length, attempt_count, error
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(doi) DO UPDATE SET
                status = excluded.status,
                url = excluded.url,
                source_kind = excluded.source_kind,
                http_status = excluded.http_status,
                content_type = excluded.content_type,
                format = excluded.format,
                content = excluded.content,
                content_length = excluded.content_length,
                attempt_count = excluded.attempt_count,
                error = excluded.error,
                updated_at = datetime('now')",
        )
        .bind(result.doi.as_str())
        .bind(result.final_status.as_str())
        .bind(url)
        .bind(source_kind)
        .bind(http_status)
        .bind(content_type)
        .bind(format)
        .bind(content)
        .bind(content_length)
        .bind(to_i64(result.attempts.len()))
        .bind(result.error_detail())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM doi_attempts WHERE doi = ?")
            .bind(result.doi.as_str())
            .execute(&mut *tx)
            .await?;

        for (seq, attempt) in result.attempts.iter().enumerate() {
            sqlx::query(
                r"INSERT INTO doi_attempts (
                    doi, seq, candidate, source_kind, url, attempt,
                    status, http_status, content_type, detail
                  ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(result.doi.as_str())
            .bind(to_i64(seq))
            .bind(to_i64(attempt.candidate.priority))
            .bind(attempt.candidate.kind.as_str())
            .bind(attempt.url.as_str())
            .bind(i64::from(attempt.attempt))
            .bind(attempt.status.as_str())
            .bind(attempt.http_status.map(i64::from))
            .bind(attempt.content_type.as_deref())
            .bind(attempt.detail.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(attempts = result.attempts.len(), "result stored");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fetch::{DocumentFormat, FetchOutcome, FetchStatus};
    use crate::resolver::{CandidateSource, SourceKind};
    use crate::workflow::WorkflowError;

    async fn sink() -> SqliteSink {
        SqliteSink::new(Database::new_in_memory().await.unwrap())
    }

    fn doi() -> Doi {
        Doi::parse("10.1234/example").unwrap()
    }

    fn resolved() -> ResolutionResult {
        let publisher = CandidateSource::new("https://a.example/x", SourceKind::Publisher, 0);
        let oa = CandidateSource::new("https://b.example/x.pdf", SourceKind::OpenAccess, 1);
        ResolutionResult {
            doi: doi(),
            final_status: FinalStatus::Resolved {
                candidate: oa.clone(),
                url: oa.url.clone(),
                format: DocumentFormat::Pdf,
                payload: b"%PDF-1.7".to_vec(),
            },
            attempts: vec![
                FetchOutcome::failure(&publisher, &publisher.url, FetchStatus::AccessDenied, "HTTP 403")
                    .with_http_status(403),
                FetchOutcome {
                    payload: None,
                    ..FetchOutcome::success(&oa, &oa.url, DocumentFormat::Pdf, Vec::new())
                }
                .with_http_status(200)
                .with_content_type(Some("application/pdf".to_string())),
            ],
        }
    }

    #[tokio::test]
    async fn test_record_resolved_with_attempts() {
        let sink = sink().await;
        sink.record(&resolved()).await.unwrap();

        let (status, kind, content, attempts): (String, String, Vec<u8>, i64) = sqlx::query_as(
            "SELECT status, source_kind, content, attempt_count FROM doi_fulltext WHERE doi = ?",
        )
        .bind("10.1234/example")
        .fetch_one(sink.database().pool())
        .await
        .unwrap();
        assert_eq!(status, "resolved");
        assert_eq!(kind, "open_access");
        assert_eq!(content, b"%PDF-1.7");
        assert_eq!(attempts, 2);

        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT seq, status FROM doi_attempts WHERE doi = ? ORDER BY seq")
                .bind("10.1234/example")
                .fetch_all(sink.database().pool())
                .await
                .unwrap();
        assert_eq!(
            rows,
            vec![
                (0, "access_denied".to_string()),
                (1, "success".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_rerun_upserts() {
        let sink = sink().await;
        let exhausted = ResolutionResult {
            doi: doi(),
            final_status: FinalStatus::Exhausted,
            attempts: Vec::new(),
        };
        sink.record(&exhausted).await.unwrap();
        assert_eq!(sink.status_of(&doi()).await.unwrap().as_deref(), Some("exhausted"));

        sink.record(&resolved()).await.unwrap();
        assert_eq!(sink.status_of(&doi()).await.unwrap().as_deref(), Some("resolved"));
        assert_eq!(sink.resolved_dois().await.unwrap(), vec![doi()]);
    }

    #[tokio::test]
    async fn test_failure_does_not_replace_document() {
        let sink = sink().await;
        sink.record(&resolved()).await.unwrap();
        sink.record(&ResolutionResult::error(doi(), WorkflowError::Cancelled, Vec::new()))
            .await
            .unwrap();
        assert_eq!(sink.status_of(&doi()).await.unwrap().as_deref(), Some("resolved"));
    }

    #[tokio::test]
    async fn test_error_detail_stored() {
        let sink = sink().await;
        sink.record(&ResolutionResult::error(doi(), WorkflowError::Cancelled, Vec::new()))
            .await
            .unwrap();
        let (error,): (Option<String>,) =
            sqlx::query_as("SELECT error FROM doi_fulltext WHERE doi = ?")
                .bind("10.1234/example")
                .fetch_one(sink.database().pool())
                .await
                .unwrap();
        assert_eq!(error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_crawl_delays_keep_larger() {
        let sink = sink().await;
        let mut delays = HashMap::new();
        delays.insert("slow.example".to_string(), Duration::from_secs(5));
        sink.save_crawl_delays(&delays).await.unwrap();

        delays.insert("slow.example".to_string(), Duration::from_secs(2));
        delays.insert("other.example".to_string(), Duration::from_millis(1500));
        sink.save_crawl_delays(&delays).await.unwrap();

        let mut loaded = sink.load_crawl_delays().await.unwrap();
        loaded.sort();
        assert_eq!(
            loaded,
            vec![
                ("other.example".to_string(), Duration::from_millis(1500)),
                ("slow.example".to_string(), Duration::from_secs(5)),
            ]
        );
    }
}
