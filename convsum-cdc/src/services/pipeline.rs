//! Pipeline orchestrator
//!
//! Drives the outbound half of the pipeline: poll the source table,
//! assemble conversations, dispatch them, advance the durable cursor.
//! Normal mode follows a sliding window behind a watermark; backfill mode
//! walks a fixed historical date range in resumable batches. A cycle that
//! fails on one conversation keeps going; only cancellation stops a loop.

use crate::db;
use crate::error::PipelineResult;
use crate::services::assembler::ConversationAssembler;
use crate::services::dispatcher::Dispatcher;
use crate::services::stats::PipelineStats;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use convsum_common::config::PipelineConfig;
use convsum_common::models::ErrorKind;
use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What happened to one conversation within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessOutcome {
    Dispatched,
    Skipped,
    Failed,
}

/// Per-cycle totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub collected: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Outbound pipeline driver
pub struct PipelineService {
    pool: SqlitePool,
    config: PipelineConfig,
    assembler: ConversationAssembler,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PipelineStats>,
}

impl PipelineService {
    pub fn new(
        pool: SqlitePool,
        config: PipelineConfig,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let assembler =
            ConversationAssembler::new(config.grace_window_secs, config.min_fragments);
        Self {
            pool,
            config,
            assembler,
            dispatcher,
            stats,
        }
    }

    /// Normal-mode poll loop; runs until cancelled
    pub async fn run_normal(&self, cancel: CancellationToken, once: bool) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            window_minutes = self.config.window_minutes,
            "Pipeline started in normal mode"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(outcome) => {
                    if outcome.collected > 0 {
                        tracing::info!(
                            collected = outcome.collected,
                            dispatched = outcome.dispatched,
                            skipped = outcome.skipped,
                            failed = outcome.failed,
                            "Cycle complete"
                        );
                    }
                }
                Err(e) => {
                    db::error_log::log_error(&self.pool, None, e.kind(), &e.to_string()).await;
                    tracing::warn!("Cycle failed, retrying next interval: {}", e);
                }
            }

            let cycles = self.stats.record_cycle();
            if self.config.stats_every_cycles > 0 && cycles % self.config.stats_every_cycles == 0 {
                self.stats.flush();
            }

            if once {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(
                    self.config.poll_interval_secs,
                )) => {}
            }
        }

        tracing::info!("Pipeline stopped");
    }

    /// One poll cycle: collect, assemble, dispatch, advance the watermark
    pub async fn run_cycle(&self) -> PipelineResult<CycleOutcome> {
        let now = Utc::now();
        // Scan the whole sliding window every cycle; the dispatch log
        // filters finished work, so re-scanning only re-collects
        // conversations that are still open or were skipped. A watermark
        // older than the window start extends the scan back to cover
        // downtime without a gap.
        let window_start = now - Duration::minutes(self.config.window_minutes);
        let since = match db::status::get_watermark(&self.pool).await? {
            Some(watermark) => std::cmp::min(watermark, window_start),
            None => window_start,
        };

        let ids =
            db::fragments::fetch_new_conversation_ids(&self.pool, since, self.config.max_batch_size)
                .await?;

        let outcome = self.process_batch(&ids, now).await;

        // The watermark trails `now` by the grace window; it marks scan
        // progress for the downtime catch-up above
        let new_watermark = now - Duration::seconds(self.config.grace_window_secs);
        db::status::set_watermark(&self.pool, new_watermark).await?;
        if outcome.dispatched > 0 {
            db::status::bump_processed(
                &self.pool,
                db::status::MODE_NORMAL,
                outcome.dispatched as i64,
            )
            .await?;
        }

        Ok(outcome)
    }

    /// Backfill mode: walk the configured date range in daily batches
    ///
    /// The cursor advances only after a batch is fully processed, so a
    /// restart resumes at the last completed batch boundary; the dispatch
    /// log makes re-processing the interrupted batch harmless.
    pub async fn run_backfill(&self, cancel: CancellationToken) -> PipelineResult<()> {
        let end_date = self
            .config
            .historical_end_date
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut batch_start = match db::status::get_backfill_cursor(&self.pool).await? {
            Some(cursor) => {
                tracing::info!(cursor = %cursor, "Resuming backfill from saved cursor");
                cursor
            }
            None => self.config.historical_start_date,
        };

        tracing::info!(
            start = %batch_start,
            end = %end_date,
            batch_days = self.config.historical_batch_days,
            "Backfill started"
        );

        while batch_start < end_date {
            if cancel.is_cancelled() {
                tracing::info!(cursor = %batch_start, "Backfill interrupted, cursor saved");
                return Ok(());
            }

            let batch_end = std::cmp::min(
                batch_start + Duration::days(self.config.historical_batch_days),
                end_date,
            );
            let dispatched = self.backfill_batch(batch_start, batch_end, &cancel).await?;

            db::status::set_backfill_cursor(&self.pool, batch_end).await?;
            if dispatched > 0 {
                db::status::bump_processed(
                    &self.pool,
                    db::status::MODE_HISTORICAL,
                    dispatched as i64,
                )
                .await?;
            }
            tracing::info!(
                batch_start = %batch_start,
                batch_end = %batch_end,
                dispatched,
                "Backfill batch complete"
            );

            batch_start = batch_end;
        }

        tracing::info!("Backfill complete");
        self.stats.flush();
        Ok(())
    }

    /// Process one backfill batch, chunked by the batch size limit
    async fn backfill_batch(
        &self,
        batch_start: NaiveDate,
        batch_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> PipelineResult<usize> {
        let range_start = day_start(batch_start);
        let range_end = day_start(batch_end);
        let now = Utc::now();

        let mut dispatched = 0;
        // Page on (first fragment time, id) rather than re-querying from
        // the range start: undispatchable conversations would otherwise
        // occupy every page and starve the rest of the batch
        let mut cursor = db::fragments::RangeCursor::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let page = db::fragments::fetch_conversation_ids_in_range(
                &self.pool,
                range_start,
                range_end,
                &cursor,
                self.config.historical_batch_size,
            )
            .await?;
            let Some((_, last)) = page.last() else {
                break;
            };
            cursor = last.clone();

            let ids: Vec<String> = page.into_iter().map(|(id, _)| id).collect();
            let outcome = self.process_batch(&ids, now).await;
            dispatched += outcome.dispatched;
        }

        Ok(dispatched)
    }

    /// Assemble and dispatch a set of conversations concurrently
    async fn process_batch(&self, ids: &[String], now: DateTime<Utc>) -> CycleOutcome {
        let outcomes: Vec<ProcessOutcome> = stream::iter(ids)
            .map(|id| self.process_conversation(id, now))
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        let outcome = CycleOutcome {
            collected: ids.len(),
            dispatched: outcomes
                .iter()
                .filter(|o| **o == ProcessOutcome::Dispatched)
                .count(),
            skipped: outcomes
                .iter()
                .filter(|o| **o == ProcessOutcome::Skipped)
                .count(),
            failed: outcomes
                .iter()
                .filter(|o| **o == ProcessOutcome::Failed)
                .count(),
        };

        self.stats.record_processed(outcome.dispatched as u64);
        self.stats.record_skipped(outcome.skipped as u64);
        self.stats.record_failed(outcome.failed as u64);
        outcome
    }

    /// Fetch, assemble and dispatch one conversation
    async fn process_conversation(&self, conversation_id: &str, now: DateTime<Utc>) -> ProcessOutcome {
        // Collection already filters dispatched ids; recheck in case a
        // concurrent cycle got there first
        match db::dispatch_log::already_dispatched(&self.pool, conversation_id).await {
            Ok(true) => return ProcessOutcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "Dispatch log lookup failed: {}",
                    e
                );
                return ProcessOutcome::Failed;
            }
        }

        let fragments = match db::fragments::fetch_fragments(&self.pool, conversation_id).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "Fragment fetch failed: {}",
                    e
                );
                return ProcessOutcome::Failed;
            }
        };

        let result = self.assembler.assemble_group(conversation_id, fragments, now);

        for anomaly in &result.anomalies {
            db::error_log::log_error(
                &self.pool,
                Some(conversation_id),
                ErrorKind::AssemblyAnomaly,
                anomaly,
            )
            .await;
        }

        let conversation = match result.conversation {
            Some(c) => c,
            None => {
                if let Some(reason) = &result.skip_reason {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        "Conversation not dispatchable: {}",
                        reason
                    );
                }
                return ProcessOutcome::Skipped;
            }
        };

        match self.dispatcher.dispatch(&conversation).await {
            Ok(_) => {
                self.stats.record_dispatched();
                ProcessOutcome::Dispatched
            }
            Err(e) => {
                self.stats.record_dispatch_failed();
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "Dispatch failed: {}",
                    e
                );
                ProcessOutcome::Failed
            }
        }
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}
