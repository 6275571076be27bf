use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::database::DatabaseLogger;
use super::types::RequestLog;
use crate::error::GatewayError;
use crate::stats::StatsAggregator;

/// Single funnel for finished requests: feeds the aggregator synchronously
/// and hands the entry to the archive writer without waiting on SQLite.
#[derive(Clone)]
pub struct RequestRecorder {
    stats: Arc<StatsAggregator>,
    archive: Option<mpsc::Sender<RequestLog>>,
}

impl RequestRecorder {
    pub fn new(stats: Arc<StatsAggregator>) -> Self {
        Self {
            stats,
            archive: None,
        }
    }

    pub fn with_archive(stats: Arc<StatsAggregator>, archive: mpsc::Sender<RequestLog>) -> Self {
        Self {
            stats,
            archive: Some(archive),
        }
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn record(&self, log: RequestLog) {
        if log.is_success() {
            tracing::info!(
                api_type = %log.api_type,
                provider = log.provider_id.as_deref().unwrap_or("-"),
                status = log.status,
                duration_ms = log.duration_ms,
                input_tokens = log.input_tokens,
                output_tokens = log.output_tokens,
                cached = log.cached,
                "{} {}",
                log.method,
                log.path
            );
        } else {
            tracing::warn!(
                api_type = %log.api_type,
                provider = log.provider_id.as_deref().unwrap_or("-"),
                status = log.status,
                duration_ms = log.duration_ms,
                error = log.error_message.as_deref().unwrap_or(""),
                "{} {}",
                log.method,
                log.path
            );
        }

        self.stats.record(&log);
        let Some(tx) = &self.archive else {
            return;
        };
        match tx.try_send(log) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(log)) => {
                tracing::warn!(request_id = %log.id, "request archive queue is full; log entry dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("request archive writer has stopped; log entry not persisted");
            }
        }
    }

    /// A request that never reached a provider.
    pub fn record_rejected(&self, mut log: RequestLog, err: &GatewayError) {
        log.status = err.status_code().as_u16();
        log.error_message = Some(err.to_string());
        self.record(log);
    }
}

/// Background task draining the archive queue into SQLite.
pub fn spawn_archive_writer(
    db: DatabaseLogger,
    capacity: usize,
) -> (mpsc::Sender<RequestLog>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<RequestLog>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(log) = rx.recv().await {
            if let Err(e) = db.log_request(&log).await {
                tracing::error!("Failed to archive request log {}: {}", log.id, e);
            }
        }
        tracing::debug!("request archive writer finished");
    });
    (tx, handle)
}

/// Rebuild the aggregator from everything archived so far.
pub async fn replay_archive(db: &DatabaseLogger, stats: &StatsAggregator) -> crate::error::Result<usize> {
    let (replayed, skipped) = db.replay_into(|log| stats.record(&log)).await?;
    if skipped > 0 {
        tracing::warn!(skipped, "unreadable rows left out of restored statistics");
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;
    use crate::config::settings::StatsConfig;

    fn log(status: u16) -> RequestLog {
        let mut log = RequestLog::new(ApiType::OpenaiChat, "POST", "/v1/chat/completions", "t");
        log.status = status;
        log.provider_id = Some("a".into());
        log
    }

    #[tokio::test]
    async fn archived_logs_replay_into_fresh_aggregator() {
        let db = DatabaseLogger::in_memory().unwrap();
        let stats = Arc::new(StatsAggregator::new(StatsConfig::default()));
        let (tx, writer) = spawn_archive_writer(db.clone(), 16);
        let recorder = RequestRecorder::with_archive(stats.clone(), tx);

        recorder.record(log(500));
        recorder.record(log(200));
        recorder.record_rejected(
            RequestLog::new(ApiType::Anthropic, "POST", "/v1/messages", "t"),
            &GatewayError::NoProviderAvailable(ApiType::Anthropic),
        );
        drop(recorder);
        writer.await.unwrap();

        let rebuilt = StatsAggregator::new(StatsConfig::default());
        assert_eq!(replay_archive(&db, &rebuilt).await.unwrap(), 3);
        assert_eq!(rebuilt.totals(), stats.totals());
        assert_eq!(rebuilt.totals().failed_requests, 2);
        assert_eq!(rebuilt.recent(1)[0].status, 503);
    }

    #[tokio::test]
    async fn full_archive_queue_drops_without_blocking() {
        let stats = Arc::new(StatsAggregator::new(StatsConfig::default()));
        let (tx, mut rx) = mpsc::channel(1);
        let recorder = RequestRecorder::with_archive(stats.clone(), tx);

        for _ in 0..3 {
            recorder.record(log(200));
        }
        assert_eq!(stats.totals().total_requests, 3);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // 写入任务退出后记录仍然只进统计
        drop(rx);
        recorder.record(log(200));
        assert_eq!(stats.totals().total_requests, 4);
    }
}
