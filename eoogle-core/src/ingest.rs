// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Bulk population of the username cache from a contiguous id range.

use std::{collections::HashSet, fmt, ops::RangeInclusive, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::oneshot, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_INGEST_BATCH_DELAY_SECONDS, DEFAULT_INGEST_BATCH_SIZE, MAX_INGEST_SPAN,
    MAX_REPORTED_FAILED_IDS, ServiceTag,
    cache::UsernameCache,
    profile::{FetchError, ProfileSource},
    retry::{Attempt, RetryPolicy, Sleeper, TokioSleeper, retry_until},
    store::StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("range start {start} must be below end {end}")]
    EmptyRange { start: u64, end: u64 },
    #[error("range spans {span} ids; at most {max} allowed", max = MAX_INGEST_SPAN)]
    RangeTooWide { span: u64 },
}

/// Inclusive id range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestRange {
    pub start: u64,
    pub end: u64,
}

impl IngestRange {
    pub fn new(start: u64, end: u64) -> Result<Self, IngestError> {
        if start >= end {
            return Err(IngestError::EmptyRange { start, end });
        }
        let span = end - start;
        if span > MAX_INGEST_SPAN {
            return Err(IngestError::RangeTooWide { span });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> RangeInclusive<u64> {
        self.start..=self.end
    }

    /// Consecutive sub-ranges of at most `size` ids.
    pub fn batches(&self, size: usize) -> impl Iterator<Item = Self> {
        let size = size.max(1) as u64;
        let end = self.end;
        (self.start..=end).step_by(size as usize).map(move |start| Self {
            start,
            end: start.saturating_add(size - 1).min(end),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    Cached { id: u64, name: String },
    /// The account does not exist.
    Missing { id: u64 },
    /// The name was fetched but could not be written to the cache.
    StoreFailed { id: u64 },
}

impl FetchOutcome {
    pub fn id(&self) -> u64 {
        match self {
            Self::Cached { id, .. } | Self::Missing { id } | Self::StoreFailed { id } => *id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestProgress {
    pub processed: u64,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl IngestProgress {
    /// Whole-number percentage of the range processed.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.processed.saturating_mul(100) / self.total).min(100) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub service: ServiceTag,
    pub range: IngestRange,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// The first failed ids, ascending.
    pub failed_ids: Vec<u64>,
    pub cancelled: bool,
}

impl IngestSummary {
    fn new(service: ServiceTag, range: IngestRange) -> Self {
        Self {
            service,
            range,
            total: range.len(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            failed_ids: Vec::new(),
            cancelled: false,
        }
    }

    fn progress(&self) -> IngestProgress {
        IngestProgress {
            processed: self.processed,
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    fn record_failure(&mut self, id: u64) {
        self.failed += 1;
        if self.failed_ids.len() < MAX_REPORTED_FAILED_IDS {
            self.failed_ids.push(id);
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    Fetch(FetchError),
    MissingName,
    Store(StoreError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(error) => error.fmt(f),
            Self::MissingName => f.write_str("profile has no id or display name"),
            Self::Store(error) => error.fmt(f),
        }
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    source: Arc<dyn ProfileSource>,
    cache: UsernameCache,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    batch_size: usize,
    batch_delay: Duration,
}

impl IngestPipeline {
    pub fn new(source: Arc<dyn ProfileSource>, cache: UsernameCache) -> Self {
        Self {
            source,
            cache,
            policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            batch_size: DEFAULT_INGEST_BATCH_SIZE,
            batch_delay: Duration::from_secs(DEFAULT_INGEST_BATCH_DELAY_SECONDS),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_delay(mut self, batch_delay: Duration) -> Self {
        self.batch_delay = batch_delay;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_delay(&self) -> Duration {
        self.batch_delay
    }

    /// Fetch one id until it resolves. Only a definitive not-found ends early;
    /// every other failure backs off and tries again, forever.
    pub async fn fetch_with_retry(&self, service: ServiceTag, id: u64) -> FetchOutcome {
        let external_id = id.to_string();
        let label = format!("{service}:{id}");

        let result = retry_until(&self.policy, self.sleeper.as_ref(), &label, |_| {
            let external_id = external_id.as_str();
            async move {
                let profile = match self.source.fetch_profile(service, external_id).await {
                    Ok(profile) => profile,
                    Err(error) if error.is_definitive_missing() => {
                        return Attempt::Terminal(AttemptError::Fetch(error));
                    }
                    Err(error) => return Attempt::Retry(AttemptError::Fetch(error)),
                };
                let Some((_, name)) = profile.cache_entry() else {
                    return Attempt::Retry(AttemptError::MissingName);
                };
                let name = name.to_string();
                match self.cache.put(external_id, &name) {
                    Ok(()) => Attempt::Done(name),
                    Err(error) => Attempt::Terminal(AttemptError::Store(error)),
                }
            }
        })
        .await;

        match result {
            Ok(name) => {
                debug!(%service, id, name = %name, "cached username");
                FetchOutcome::Cached { id, name }
            }
            Err(AttemptError::Fetch(error)) => {
                debug!(%service, id, %error, "account does not exist");
                FetchOutcome::Missing { id }
            }
            Err(error) => {
                warn!(%service, id, %error, "failed to cache username");
                FetchOutcome::StoreFailed { id }
            }
        }
    }

    /// Ingest `range` batch by batch. Ids inside a batch are fetched
    /// concurrently; batches run one after another with `batch_delay` between
    /// them. Firing or dropping `stop` cancels at the next await point and
    /// the summary reports what finished before that.
    pub async fn run<P>(
        &self,
        service: ServiceTag,
        range: IngestRange,
        mut on_progress: P,
        mut stop: oneshot::Receiver<()>,
    ) -> IngestSummary
    where
        P: FnMut(&IngestProgress) + Send,
    {
        let mut summary = IngestSummary::new(service, range);
        let batches: Vec<IngestRange> = range.batches(self.batch_size).collect();
        let batch_count = batches.len();
        info!(%service, start = range.start, end = range.end, batches = batch_count, "ingest started");

        'batches: for (index, batch) in batches.into_iter().enumerate() {
            let mut tasks = JoinSet::new();
            for id in batch.ids() {
                let pipeline = self.clone();
                tasks.spawn(async move { pipeline.fetch_with_retry(service, id).await });
            }

            let mut finished = HashSet::new();
            let mut batch_failed = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => {
                        tasks.abort_all();
                        batch_failed.sort_unstable();
                        for id in batch_failed.drain(..) {
                            summary.record_failure(id);
                        }
                        summary.processed += finished.len() as u64;
                        summary.cancelled = true;
                        break 'batches;
                    }
                    joined = tasks.join_next() => {
                        let Some(joined) = joined else { break };
                        match joined {
                            Ok(outcome) => {
                                finished.insert(outcome.id());
                                if outcome.is_success() {
                                    summary.succeeded += 1;
                                } else {
                                    batch_failed.push(outcome.id());
                                }
                            }
                            Err(error) => warn!(%service, %error, "ingest task failed"),
                        }
                    }
                }
            }

            // Ids whose task died count as failed.
            batch_failed.extend(batch.ids().filter(|id| !finished.contains(id)));
            batch_failed.sort_unstable();
            for id in batch_failed {
                summary.record_failure(id);
            }
            summary.processed += batch.len();
            on_progress(&summary.progress());
            debug!(%service, batch = index + 1, batches = batch_count, processed = summary.processed, "batch finished");

            if index + 1 < batch_count && !self.batch_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut stop => {
                        summary.cancelled = true;
                        break 'batches;
                    }
                    _ = self.sleeper.sleep(self.batch_delay) => {}
                }
            }
        }

        info!(
            %service,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "ingest finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        profile::{
            FollowCounts, UserProfile,
            testing::{ScriptedSource, profile},
        },
        retry::testing::RecordingSleeper,
        store::Store,
    };

    struct Fixture {
        pipeline: IngestPipeline,
        cache: UsernameCache,
        sleeper: Arc<RecordingSleeper>,
        source: Arc<ScriptedSource>,
    }

    fn fixture(source: ScriptedSource) -> Fixture {
        let cache = UsernameCache::new(Store::in_memory());
        let sleeper = Arc::new(RecordingSleeper::default());
        let source = Arc::new(source);
        let pipeline = IngestPipeline::new(source.clone(), cache.clone())
            .with_sleeper(sleeper.clone());
        Fixture {
            pipeline,
            cache,
            sleeper,
            source,
        }
    }

    fn source_for(ids: impl IntoIterator<Item = u64>) -> ScriptedSource {
        ids.into_iter().fold(ScriptedSource::default(), |source, id| {
            source.with_profile(profile(&id.to_string(), &format!("user{id}")))
        })
    }

    #[test]
    fn range_rejects_empty_and_too_wide() {
        assert_eq!(
            IngestRange::new(10, 10),
            Err(IngestError::EmptyRange { start: 10, end: 10 })
        );
        assert_eq!(
            IngestRange::new(20, 10),
            Err(IngestError::EmptyRange { start: 20, end: 10 })
        );
        assert_eq!(
            IngestRange::new(0, 10_001),
            Err(IngestError::RangeTooWide { span: 10_001 })
        );
        assert_eq!(IngestRange::new(0, 10_000).unwrap().len(), 10_001);
        assert_eq!(IngestRange::new(1, 2).unwrap().len(), 2);
    }

    #[test]
    fn batches_cover_range_without_overlap() {
        let range = IngestRange::new(5, 254).unwrap();
        let batches: Vec<(u64, u64)> = range
            .batches(100)
            .map(|batch| (batch.start, batch.end))
            .collect();
        assert_eq!(batches, vec![(5, 104), (105, 204), (205, 254)]);
    }

    #[test]
    fn progress_percent_is_whole_number() {
        let progress = IngestProgress {
            processed: 1,
            total: 3,
            succeeded: 1,
            failed: 0,
        };
        assert_eq!(progress.percent(), 33);
    }

    #[tokio::test]
    async fn not_found_ends_without_backoff() {
        let f = fixture(ScriptedSource::default());

        let outcome = f.pipeline.fetch_with_retry(ServiceTag::ServiceA, 42).await;
        assert_eq!(outcome, FetchOutcome::Missing { id: 42 });
        assert_eq!(f.source.calls(), 1);
        assert!(f.sleeper.recorded().is_empty());
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_retry_until_cached() {
        let source = ScriptedSource::default().script(
            "7",
            vec![
                Err(FetchError::Html(503)),
                Err(FetchError::Network("timeout".to_string())),
                Ok(profile("7", "")),
                Ok(profile("7", "Seven")),
            ],
        );
        let f = fixture(source);

        let outcome = f.pipeline.fetch_with_retry(ServiceTag::ServiceB, 7).await;
        assert_eq!(
            outcome,
            FetchOutcome::Cached {
                id: 7,
                name: "Seven".to_string()
            }
        );
        assert_eq!(f.source.calls(), 4);
        assert_eq!(
            f.sleeper.recorded(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(f.cache.get("7").as_deref(), Some("Seven"));
    }

    #[tokio::test]
    async fn run_reports_progress_and_sleeps_between_batches() {
        let f = fixture(source_for((1..=250).filter(|id| id % 50 != 0)));
        let (_stop_tx, stop_rx) = oneshot::channel();
        let progress = Mutex::new(Vec::new());

        let summary = f
            .pipeline
            .run(
                ServiceTag::ServiceA,
                IngestRange::new(1, 250).unwrap(),
                |p: &IngestProgress| progress.lock().unwrap().push(*p),
                stop_rx,
            )
            .await;

        assert!(!summary.cancelled);
        assert_eq!(summary.total, 250);
        assert_eq!(summary.processed, 250);
        assert_eq!(summary.succeeded, 245);
        assert_eq!(summary.failed, 5);
        assert_eq!(summary.failed_ids, vec![50, 100, 150, 200, 250]);

        let progress = progress.into_inner().unwrap();
        let processed: Vec<u64> = progress.iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![100, 200, 250]);
        assert_eq!(progress.last().unwrap().percent(), 100);

        // Missing ids never back off, so only the two inter-batch delays remain.
        assert_eq!(
            f.sleeper.recorded(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
        assert_eq!(f.cache.len(), 245);
        assert_eq!(f.cache.get("1").as_deref(), Some("user1"));
    }

    #[tokio::test]
    async fn failed_ids_are_capped_and_sorted() {
        let f = fixture(ScriptedSource::default());
        let (_stop_tx, stop_rx) = oneshot::channel();

        let summary = f
            .pipeline
            .run(
                ServiceTag::ServiceA,
                IngestRange::new(1000, 1149).unwrap(),
                |_: &IngestProgress| {},
                stop_rx,
            )
            .await;

        assert_eq!(summary.failed, 150);
        assert_eq!(summary.failed_ids.len(), MAX_REPORTED_FAILED_IDS);
        assert!(summary.failed_ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(summary.failed_ids[0], 1000);
    }

    #[tokio::test]
    async fn stop_signal_cancels_before_next_batch() {
        let f = fixture(source_for(1..=300));
        let pipeline = f.pipeline.with_batch_size(100);
        let (stop_tx, stop_rx) = oneshot::channel();
        let stop_tx = Mutex::new(Some(stop_tx));

        let summary = pipeline
            .run(
                ServiceTag::ServiceA,
                IngestRange::new(1, 300).unwrap(),
                |_: &IngestProgress| {
                    if let Some(stop_tx) = stop_tx.lock().unwrap().take() {
                        let _ = stop_tx.send(());
                    }
                },
                stop_rx,
            )
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 100);
        assert_eq!(summary.succeeded, 100);
        assert!(f.sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn range_end_is_fetched() {
        let f = fixture(source_for(1..=100));
        let (_stop_tx, stop_rx) = oneshot::channel();

        let summary = f
            .pipeline
            .run(
                ServiceTag::ServiceA,
                IngestRange::new(1, 100).unwrap(),
                |_: &IngestProgress| {},
                stop_rx,
            )
            .await;

        assert_eq!(summary.total, 100);
        assert_eq!(summary.processed, 100);
        assert_eq!(summary.succeeded, 100);
        assert_eq!(f.cache.get("100").as_deref(), Some("user100"));
        assert!(f.sleeper.recorded().is_empty());
    }

    /// Answers from `inner`, except `stall_id`, which fires `stop` and never returns.
    struct StallingSource {
        inner: ScriptedSource,
        stall_id: String,
        stop: Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait::async_trait]
    impl ProfileSource for StallingSource {
        async fn fetch_profile(
            &self,
            service: ServiceTag,
            id: &str,
        ) -> Result<UserProfile, FetchError> {
            if id != self.stall_id {
                return self.inner.fetch_profile(service, id).await;
            }
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            if let Some(stop) = self.stop.lock().unwrap().take() {
                let _ = stop.send(());
            }
            std::future::pending().await
        }

        async fn fetch_membership(&self, service: ServiceTag, id: &str) -> Result<u8, FetchError> {
            self.inner.fetch_membership(service, id).await
        }

        async fn fetch_headshot(
            &self,
            service: ServiceTag,
            id: &str,
        ) -> Result<Option<String>, FetchError> {
            self.inner.fetch_headshot(service, id).await
        }

        async fn fetch_follow_counts(
            &self,
            service: ServiceTag,
            id: &str,
        ) -> Result<FollowCounts, FetchError> {
            self.inner.fetch_follow_counts(service, id).await
        }

        async fn fetch_username_history(
            &self,
            service: ServiceTag,
            id: &str,
        ) -> Result<Vec<String>, FetchError> {
            self.inner.fetch_username_history(service, id).await
        }
    }

    #[tokio::test]
    async fn cancel_mid_batch_counts_finished_ids_as_processed() {
        let (stop_tx, stop_rx) = oneshot::channel();
        let source = StallingSource {
            inner: source_for(1..=2),
            stall_id: "3".to_string(),
            stop: Mutex::new(Some(stop_tx)),
        };
        let cache = UsernameCache::new(Store::in_memory());
        let pipeline = IngestPipeline::new(Arc::new(source), cache)
            .with_sleeper(Arc::new(RecordingSleeper::default()))
            .with_batch_size(3);

        let summary = pipeline
            .run(
                ServiceTag::ServiceA,
                IngestRange::new(1, 6).unwrap(),
                |_: &IngestProgress| {},
                stop_rx,
            )
            .await;

        assert!(summary.cancelled);
        assert!(summary.processed < 3);
        assert!(summary.succeeded <= summary.processed);
        assert_eq!(summary.succeeded + summary.failed, summary.processed);
    }
}
