//! Aggregation Engine
//!
//! Receives exchanges, groups them by correlation key, merges each one into
//! its group and releases the group downstream when a completion trigger
//! fires.
//!
//! All merge, completion-check and repository mutation work runs inside one
//! shared critical section spanning every key, so operations that walk all
//! groups (interval sweep, force completion, batch flush) observe a
//! consistent view. With optimistic locking the shared lock is replaced by
//! versioned repository writes plus a retry loop.
//!
//! Completed groups are handed to a single dispatcher task through an
//! unbounded channel, so the order in which completions are detected is
//! the order in which they reach the sink. A completed exchange is marked
//! in progress and queued inside the critical section that completed it.

use crate::closed_keys::ClosedKeyCache;
use crate::recovery::RedeliveryState;
use crate::repository::{
    AggregationRepository, MemoryRepository, OptimisticLockingRepository, StoredExchange,
};
use crate::sink::AggregateSink;
use crate::statistics::AggregationStatistics;
use crate::strategy::{self, AggregationStrategy};
use crate::timeout::TimeoutTracker;
use accrete_core::error::{AggregationError, ConfigError, CorrelationError, LockingError};
use accrete_core::{headers, AggregatorConfig, CompletionReason, Exchange, ExchangeId, Result};
use dashmap::DashSet;
use flume::{Receiver, Sender};
use futures::future::join_all;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Delay before the first recovery scan.
const RECOVERY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Started,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Started => "started",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The critical section shared by every key.
///
/// Reentrant because completing all groups can be triggered from inside a
/// merge that already holds it.
pub(crate) enum SharedLock {
    Exclusive(ReentrantMutex<()>),
    NoLock,
}

impl SharedLock {
    fn new(optimistic_locking: bool) -> Self {
        if optimistic_locking {
            SharedLock::NoLock
        } else {
            SharedLock::Exclusive(ReentrantMutex::new(()))
        }
    }

    pub(crate) fn acquire(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        match self {
            SharedLock::Exclusive(mutex) => Some(mutex.lock()),
            SharedLock::NoLock => None,
        }
    }
}

/// Keys seen since the last batch boundary, in first-seen order.
#[derive(Debug, Default)]
struct BatchState {
    keys: Vec<String>,
    seen: HashSet<String>,
    counter: usize,
}

impl BatchState {
    fn record(&mut self, key: &str) {
        if self.seen.insert(key.to_string()) {
            self.keys.push(key.to_string());
        }
        self.counter += 1;
    }

    /// Hands over the keys of the current batch.
    fn take_keys(&mut self) -> Vec<String> {
        self.seen.clear();
        std::mem::take(&mut self.keys)
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.seen.clear();
        self.counter = 0;
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: AggregatorConfig,
    pub(crate) strategy: Arc<dyn AggregationStrategy>,
    pub(crate) repository: Arc<dyn AggregationRepository>,
    pub(crate) sink: Arc<dyn AggregateSink>,
    pub(crate) endpoints: HashMap<String, Arc<dyn AggregateSink>>,
    pub(crate) lock: SharedLock,
    pub(crate) state: RwLock<EngineState>,
    pub(crate) timeouts: TimeoutTracker,
    pub(crate) closed_keys: Option<ClosedKeyCache>,
    pub(crate) statistics: AggregationStatistics,
    /// Completed exchanges currently being delivered
    pub(crate) in_progress: DashSet<ExchangeId>,
    /// Delivered exchanges the repository did not acknowledge
    pub(crate) unconfirmed: DashSet<ExchangeId>,
    pub(crate) redelivery: RedeliveryState,
    batch: Mutex<BatchState>,
    /// Open while started; dropped on stop so the dispatcher drains and exits
    dispatch_tx: RwLock<Option<Sender<Exchange>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Correlation-based message aggregator.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct AggregationEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`AggregationEngine`].
pub struct AggregationEngineBuilder {
    config: AggregatorConfig,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    repository: Option<Arc<dyn AggregationRepository>>,
    sink: Option<Arc<dyn AggregateSink>>,
    endpoints: HashMap<String, Arc<dyn AggregateSink>>,
}

impl AggregationEngineBuilder {
    /// Overrides the strategy named in the configuration.
    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: AggregationStrategy + 'static,
    {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn shared_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Uses `repository` instead of the in-memory default.
    pub fn repository(mut self, repository: Arc<dyn AggregationRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Downstream sink for completed groups. Required.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: AggregateSink + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Registers a named endpoint, used as a dead letter destination.
    pub fn endpoint<S>(mut self, name: impl Into<String>, sink: S) -> Self
    where
        S: AggregateSink + 'static,
    {
        self.endpoints.insert(name.into(), Arc::new(sink));
        self
    }

    pub fn build(self) -> Result<AggregationEngine> {
        let sink = self.sink.ok_or_else(|| ConfigError::missing_field("sink"))?;
        let config = self.config;

        let strategy = self
            .strategy
            .unwrap_or_else(|| strategy::from_kind(&config.strategy));
        let repository: Arc<dyn AggregationRepository> = match self.repository {
            Some(repository) => repository,
            None if config.optimistic_locking => {
                Arc::new(MemoryRepository::with_optimistic_locking())
            }
            None => Arc::new(MemoryRepository::new()),
        };
        let closed_keys = config
            .close_correlation_key_on_completion
            .map(ClosedKeyCache::new);
        let inner = EngineInner {
            lock: SharedLock::new(config.optimistic_locking),
            statistics: AggregationStatistics::new(config.statistics_enabled),
            config,
            strategy,
            repository,
            sink,
            endpoints: self.endpoints,
            state: RwLock::new(EngineState::Created),
            timeouts: TimeoutTracker::new(),
            closed_keys,
            in_progress: DashSet::new(),
            unconfirmed: DashSet::new(),
            redelivery: RedeliveryState::default(),
            batch: Mutex::new(BatchState::default()),
            dispatch_tx: RwLock::new(None),
            dispatcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        };

        Ok(AggregationEngine {
            inner: Arc::new(inner),
        })
    }
}

impl AggregationEngine {
    pub fn builder(config: AggregatorConfig) -> AggregationEngineBuilder {
        AggregationEngineBuilder {
            config,
            strategy: None,
            repository: None,
            sink: None,
            endpoints: HashMap::new(),
        }
    }

    /// Validates the setup and starts the background tasks.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no completion trigger is set, if
    /// optimistic locking is requested with an unsupported repository, or
    /// if the recovery or dead letter settings are invalid.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.state.read() == EngineState::Started {
            return Ok(());
        }

        inner.validate()?;
        info!(
            optimistic_locking = inner.config.optimistic_locking,
            pre_completion = inner.strategy.can_pre_complete(),
            "Starting aggregation engine"
        );

        let (dispatch_tx, dispatch_rx) = flume::unbounded();
        *inner.dispatch_tx.write() = Some(dispatch_tx);
        *inner.dispatcher.lock() = Some(inner.spawn_dispatcher(dispatch_rx));

        let mut tasks = Vec::new();

        if let Some(period) = inner.config.completion_interval() {
            info!(interval_ms = period.as_millis() as u64, "Using completion interval");
            tasks.push(inner.spawn_interval_sweep(period));
        }

        if inner.config.uses_timeout() {
            info!(
                timeout_ms = ?inner.config.completion_timeout_ms,
                "Using completion timeout"
            );
            inner.restore_timeouts();
            let weak = Arc::downgrade(inner);
            inner
                .timeouts
                .start(inner.config.timeout_checker_interval(), move || {
                    match weak.upgrade() {
                        Some(inner) => {
                            inner.purge_timeouts();
                            true
                        }
                        None => false,
                    }
                });
        }

        if let Some(recoverable) = inner.repository.as_recoverable() {
            let settings = recoverable.settings();
            if settings.use_recovery {
                info!(
                    interval_ms = settings.recovery_interval.as_millis() as u64,
                    "Scheduling recovery checker"
                );
                tasks.push(inner.spawn_recovery(settings.recovery_interval));
            }
        }

        inner.tasks.lock().extend(tasks);
        *inner.state.write() = EngineState::Started;
        info!("Aggregation engine started");
        Ok(())
    }

    /// Stops the engine.
    ///
    /// With `force_completion_on_stop` every open group is completed first.
    /// Groups that already completed are always delivered before this
    /// returns, so it waits until all in-flight deliveries have finished.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            if *state != EngineState::Started {
                return Ok(());
            }
            *state = EngineState::Stopping;
        }
        info!("Stopping aggregation engine");
        let started = Instant::now();

        if inner.config.force_completion_on_stop {
            let expected = inner.force_completion_of_all_groups();
            if expected > 0 {
                info!(groups = expected, "Forced completion of all groups on stop");
            }
        }

        inner.timeouts.stop();
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;

        {
            // no aggregation can complete a group once the queue is closed
            let _guard = inner.lock.acquire();
            *inner.state.write() = EngineState::Stopped;
            inner.dispatch_tx.write().take();
        }

        let dispatcher = inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            trace!(
                in_progress = inner.in_progress.len(),
                "Waiting for inflight exchanges to complete"
            );
            if let Err(err) = dispatcher.await {
                error!(error = %err, "Completion dispatcher failed during shutdown");
            }
        }
        inner.in_progress.clear();

        if let Some(closed) = &inner.closed_keys {
            closed.clear();
        }
        inner.batch.lock().clear();
        inner.redelivery.clear();

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation engine stopped"
        );
        Ok(())
    }

    /// Aggregates one exchange.
    ///
    /// Resolves once the exchange has been merged into its group (and any
    /// groups it completed have been queued for delivery), not when its
    /// group completes.
    ///
    /// # Errors
    ///
    /// Fails for a missing or closed correlation key, a failing merge
    /// strategy, or exhausted optimistic locking retries.
    pub async fn submit(&self, exchange: Exchange) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        inner.statistics.record_in();

        if exchange.is_complete_all_groups() {
            debug!(exchange_id = %exchange.id(), "Complete all groups requested");
            inner.force_completion_of_all_groups();
            return Ok(());
        }

        let key = match inner.correlation_key(&exchange) {
            Some(key) => key,
            None if inner.config.ignore_invalid_correlation_keys => {
                debug!(exchange_id = %exchange.id(), "Invalid correlation key, exchange ignored");
                return Ok(());
            }
            None => return Err(CorrelationError::invalid_key(exchange.id()).into()),
        };

        if inner
            .closed_keys
            .as_ref()
            .map_or(false, |closed| closed.contains(&key))
        {
            return Err(CorrelationError::closed_key(key, exchange.id()).into());
        }

        if inner.config.optimistic_locking {
            inner.aggregate_optimistic(&key, &exchange).await?;
        } else {
            inner.aggregate_locked(&key, exchange.correlated_copy())?;
        }

        if exchange.is_complete_all_groups_inclusive() {
            inner.force_completion_of_all_groups();
        }
        Ok(())
    }

    /// Completes every open group. Returns the number of groups completed.
    pub fn force_completion_of_all_groups(&self) -> usize {
        self.inner.force_completion_of_all_groups()
    }

    /// Completes the group for `key`. Returns 1 if it existed, else 0.
    pub fn force_completion_of_group(&self, key: &str) -> usize {
        self.inner.force_completion_of_group(key)
    }

    /// Drops every open group without delivering it.
    pub fn force_discarding_of_all_groups(&self) -> usize {
        self.inner.force_discarding_of_all_groups()
    }

    /// Drops the group for `key` without delivering it.
    pub fn force_discarding_of_group(&self, key: &str) -> usize {
        self.inner.force_discarding_of_group(key)
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.read()
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    pub fn statistics(&self) -> &AggregationStatistics {
        &self.inner.statistics
    }

    pub fn repository(&self) -> Arc<dyn AggregationRepository> {
        Arc::clone(&self.inner.repository)
    }

    /// Completed exchanges currently being delivered.
    pub fn in_progress_count(&self) -> usize {
        self.inner.in_progress.len()
    }

    /// Keys tracked by the completion timeout checker.
    pub fn timeout_count(&self) -> usize {
        self.inner.timeouts.len()
    }

    pub fn closed_correlation_keys_len(&self) -> usize {
        self.inner.closed_keys.as_ref().map_or(0, ClosedKeyCache::len)
    }

    /// Reopens every closed correlation key.
    pub fn clear_closed_correlation_keys(&self) {
        if let Some(closed) = &self.inner.closed_keys {
            closed.clear();
        }
    }

    /// Open groups a shutdown coordinator should wait for. Only non-zero
    /// with `complete_all_on_stop`.
    pub fn pending_exchanges(&self) -> usize {
        if self.inner.config.complete_all_on_stop {
            self.inner.repository.keys().len()
        } else {
            0
        }
    }
}

impl fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("state", &self.state())
            .field("in_progress", &self.inner.in_progress.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl EngineInner {
    fn validate(&self) -> Result<()> {
        self.config.validate(self.strategy.can_pre_complete())?;

        if self.config.optimistic_locking && self.repository.as_optimistic().is_none() {
            return Err(ConfigError::OptimisticLockingUnsupported.into());
        }

        if let Some(recoverable) = self.repository.as_recoverable() {
            let settings = recoverable.settings();
            if settings.use_recovery {
                if settings.recovery_interval.is_zero() {
                    return Err(ConfigError::InvalidRecoveryInterval {
                        millis: settings.recovery_interval.as_millis() as u64,
                    }
                    .into());
                }
                if let Some(uri) = &settings.dead_letter_uri {
                    if settings.maximum_redeliveries == 0 {
                        return Err(ConfigError::InvalidMaximumRedeliveries {
                            value: settings.maximum_redeliveries,
                        }
                        .into());
                    }
                    if !self.endpoints.contains_key(uri) {
                        return Err(ConfigError::NoSuchEndpoint {
                            endpoint: uri.clone(),
                        }
                        .into());
                    }
                    info!(
                        maximum_redeliveries = settings.maximum_redeliveries,
                        dead_letter = %uri,
                        "Exhausted recoveries will be moved to dead letter endpoint"
                    );
                }
            }
        }

        Ok(())
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.read()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            EngineState::Started | EngineState::Stopping => Ok(()),
            other => Err(accrete_core::AccreteError::NotRunning {
                state: other.to_string(),
            }),
        }
    }

    /// Force operations only run once started, or while stopping.
    fn allows_force(&self) -> bool {
        matches!(self.state(), EngineState::Started | EngineState::Stopping)
    }

    fn correlation_key(&self, exchange: &Exchange) -> Option<String> {
        self.config
            .correlation
            .as_ref()
            .and_then(|expr| expr.evaluate_string(exchange))
            .filter(|key| !key.is_empty())
    }

    fn optimistic(&self) -> Option<&dyn OptimisticLockingRepository> {
        if self.config.optimistic_locking {
            self.repository.as_optimistic()
        } else {
            None
        }
    }

    fn aggregate_locked(&self, key: &str, exchange: Exchange) -> Result<()> {
        let _guard = self.lock.acquire();
        self.do_aggregation(key, exchange)
    }

    async fn aggregate_optimistic(&self, key: &str, exchange: &Exchange) -> Result<()> {
        let policy = &self.config.optimistic_lock_retry;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.do_aggregation(key, exchange.correlated_copy()) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_locking_conflict() => {
                    trace!(key, attempt, "Optimistic locking conflict while aggregating");
                    if !policy.should_retry(attempt) {
                        return Err(LockingError::Exhausted { attempts: attempt }.into());
                    }
                    let delay = policy.delay(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Merges `incoming` into the group for `key` and evaluates completion.
    ///
    /// Must run inside the shared lock (or under optimistic locking).
    /// Completed groups are queued for delivery as soon as they are removed
    /// from the repository, even if a later step fails.
    fn do_aggregation(&self, key: &str, mut incoming: Exchange) -> Result<()> {
        // the engine may have stopped while this caller waited for the lock
        self.ensure_running()?;
        trace!(key, exchange_id = %incoming.id(), "Aggregation start");

        let stored = self.repository.get(key);
        let mut version = stored.as_ref().map(|s| s.version);
        let mut original = stored.map(|s| s.exchange);
        let mut size = original
            .as_ref()
            .map_or(1, |old| old.properties.aggregated_size.unwrap_or(0) + 1);

        let pre_completion = self.strategy.can_pre_complete();
        let eager = !pre_completion && self.config.eager_check_completion;
        let mut complete: Option<CompletionReason> = None;
        let mut tracked_timeout: Option<u64> = None;

        if pre_completion {
            incoming.properties.aggregated_size = Some(size);
            let pre = self
                .strategy
                .pre_complete(original.as_ref(), &incoming)
                .map_err(|e| AggregationError::PreCompleteFailed {
                    exchange_id: incoming.id().to_string(),
                    reason: e.message,
                })?;
            incoming.properties.aggregated_size = None;
            if pre {
                complete = Some(CompletionReason::Strategy);
            } else {
                tracked_timeout = self.track_timeout(key, &incoming);
            }
        } else if eager {
            incoming.properties.aggregated_size = Some(size);
            incoming.properties.correlation_key = Some(key.to_string());
            complete = self.is_completed(key, &incoming, incoming.is_complete_current_group());
            if complete.is_none() {
                tracked_timeout = self.track_timeout(key, &incoming);
            }
            incoming.properties.aggregated_size = None;
            incoming.properties.correlation_key = None;
        }

        if pre_completion {
            if let Some(reason) = complete.take() {
                if let Some(old) = original.take() {
                    self.do_aggregation_complete(reason, key, version.take(), old, false)?;
                }
                size = 1;
                tracked_timeout = self.track_timeout(key, &incoming);
            }
        }

        // signals carried by the incoming message, which the merge may drop
        let incoming_id = incoming.id();
        let complete_current = incoming.is_complete_current_group();
        let incoming_timeout = self.timeout_for(&incoming);
        let mut aggregate_failed = false;
        let mut answer = match self.strategy.aggregate(original.clone(), incoming) {
            Ok(merged) => merged,
            Err(err) => {
                aggregate_failed = true;
                if !self.config.discard_on_aggregation_failure {
                    return Err(AggregationError::strategy_failed(incoming_id, err.message).into());
                }
                debug!(key, exchange_id = %incoming_id, error = %err, "Aggregation failed, discarding group");
                complete = Some(CompletionReason::Strategy);
                match original.clone() {
                    Some(old) => old,
                    // the first message of the group failed, nothing to discard
                    None => return Ok(()),
                }
            }
        };

        let mut complete_all_after = false;
        if !aggregate_failed && answer.is_complete_all_groups() {
            answer.properties.complete_all_groups = false;
            answer.remove_header(headers::COMPLETE_ALL_GROUPS);
            complete_all_after = true;
        } else if self.config.completion_on_new_correlation_group && original.is_none() {
            self.force_completion_of_all_groups();
        }

        answer.properties.aggregated_size = Some(size);

        if complete.is_none() && !pre_completion && !eager {
            complete = self.is_completed(key, &answer, complete_current);
            if complete.is_none() {
                if let Some(millis) = incoming_timeout {
                    self.timeouts
                        .put(key, incoming_id, Duration::from_millis(millis));
                    tracked_timeout = Some(millis);
                }
            }
        }
        answer.clear_control_flags();

        match complete {
            None => {
                if tracked_timeout.is_some() {
                    answer.properties.timeout_millis = tracked_timeout;
                }
                self.repository_add(key, version, original.as_ref(), answer)?;
            }
            Some(reason) => {
                self.do_aggregation_complete(reason, key, version, answer, aggregate_failed)?;
            }
        }

        if complete_all_after {
            self.force_completion_of_all_groups();
        }

        trace!(key, "Aggregation end");
        Ok(())
    }

    /// Completion triggers evaluated in precedence order.
    ///
    /// `complete_current` is the incoming message's own completion signal.
    fn is_completed(
        &self,
        key: &str,
        exchange: &Exchange,
        complete_current: bool,
    ) -> Option<CompletionReason> {
        if self.config.completion_from_batch_consumer {
            let mut batch = self.batch.lock();
            batch.record(key);
            let batch_size = exchange.properties.batch_size.unwrap_or(0);
            if batch_size > 0 && batch.counter >= batch_size {
                batch.counter = 0;
                return Some(CompletionReason::Consumer);
            }
        }

        if complete_current {
            return Some(CompletionReason::Strategy);
        }

        if let Some(predicate) = &self.config.completion_predicate {
            if predicate.matches(exchange) {
                return Some(CompletionReason::Predicate);
            }
        }

        let size = exchange.properties.aggregated_size.unwrap_or(1);
        let mut size_checked = false;
        if let Some(expr) = &self.config.completion_size_expression {
            if let Some(limit) = expr.evaluate_i64(exchange).filter(|v| *v > 0) {
                size_checked = true;
                if size as i64 >= limit {
                    return Some(CompletionReason::Size);
                }
            }
        }
        if !size_checked {
            if let Some(limit) = self.config.completion_size() {
                if size >= limit {
                    return Some(CompletionReason::Size);
                }
            }
        }

        None
    }

    /// Inactivity timeout for a message. The expression takes precedence
    /// over the static timeout.
    fn timeout_for(&self, exchange: &Exchange) -> Option<u64> {
        let from_expression = self
            .config
            .completion_timeout_expression
            .as_ref()
            .and_then(|expr| expr.evaluate_i64(exchange))
            .filter(|ms| *ms > 0)
            .map(|ms| ms as u64);
        from_expression.or(self.config.completion_timeout_ms.filter(|ms| *ms > 0))
    }

    /// Starts or refreshes the inactivity timeout for `key`.
    fn track_timeout(&self, key: &str, exchange: &Exchange) -> Option<u64> {
        let millis = self.timeout_for(exchange)?;
        self.timeouts
            .put(key, exchange.id(), Duration::from_millis(millis));
        Some(millis)
    }

    fn repository_add(
        &self,
        key: &str,
        version: Option<u64>,
        original: Option<&Exchange>,
        answer: Exchange,
    ) -> Result<()> {
        trace!(key, ?version, exchange_id = %answer.id(), "Storing in-progress group");
        match self.optimistic() {
            Some(optimistic) => {
                let attempted = answer.clone();
                if let Err(err) = optimistic.add_if(key, version, answer) {
                    self.strategy
                        .on_optimistic_lock_failure(original, &attempted);
                    return Err(err.into());
                }
            }
            None => {
                self.repository.add(key, answer);
            }
        }
        Ok(())
    }

    fn remove_group(
        &self,
        key: &str,
        version: u64,
        exchange: &Exchange,
    ) -> std::result::Result<(), LockingError> {
        match self.optimistic() {
            Some(optimistic) => optimistic.remove_if(key, exchange, version),
            None => {
                self.repository.remove(key, exchange);
                Ok(())
            }
        }
    }

    fn do_aggregation_complete(
        &self,
        reason: CompletionReason,
        key: &str,
        version: Option<u64>,
        mut answer: Exchange,
        aggregate_failed: bool,
    ) -> Result<()> {
        if reason != CompletionReason::Consumer {
            answer.properties.completed_by = Some(reason);
            if let Some(done) = self.on_completion(key, version, answer, false, aggregate_failed)? {
                self.on_submit_completion(done);
            }
            return Ok(());
        }

        let batch_keys = self.batch.lock().take_keys();
        let mut current = Some(answer);
        for batch_key in batch_keys {
            let (batch_version, batch_answer) = if batch_key == key {
                (version, current.take())
            } else {
                match self.repository.get(&batch_key) {
                    Some(StoredExchange { exchange, version }) => (Some(version), Some(exchange)),
                    None => (None, None),
                }
            };

            if let Some(mut batch_answer) = batch_answer {
                batch_answer.properties.completed_by = Some(CompletionReason::Consumer);
                if let Some(done) =
                    self.on_completion(&batch_key, batch_version, batch_answer, false, false)?
                {
                    self.on_submit_completion(done);
                }
            }
        }
        Ok(())
    }

    /// Finalizes a completed group. Returns the exchange to deliver, or
    /// `None` if it was discarded.
    fn on_completion(
        &self,
        key: &str,
        version: Option<u64>,
        mut aggregated: Exchange,
        from_timeout: bool,
        aggregate_failed: bool,
    ) -> Result<Option<Exchange>> {
        aggregated.properties.correlation_key = Some(key.to_string());

        // only stored groups need removing; a group can complete on its first message
        if let Some(version) = version {
            self.remove_group(key, version, &aggregated)?;
        }

        if !from_timeout {
            self.timeouts.remove(key);
        }

        if let Some(closed) = &self.closed_keys {
            closed.close(key);
        }

        if from_timeout {
            self.strategy
                .timeout(&aggregated, self.config.completion_timeout());
        }

        let discard = (from_timeout && self.config.discard_on_completion_timeout)
            || (aggregate_failed && self.config.discard_on_aggregation_failure);
        if discard {
            debug!(key, exchange_id = %aggregated.id(), "Discarding aggregated exchange");
            self.statistics.record_discarded();
            self.repository.confirm(&aggregated.id());
            self.redelivery.remove(&aggregated.id());
            return Ok(None);
        }

        Ok(Some(aggregated))
    }

    /// Marks the exchange in progress, records statistics and queues it
    /// for delivery.
    pub(crate) fn on_submit_completion(&self, exchange: Exchange) {
        debug!(
            key = exchange.properties.correlation_key.as_deref().unwrap_or_default(),
            exchange_id = %exchange.id(),
            completed_by = ?exchange.properties.completed_by,
            size = ?exchange.properties.aggregated_size,
            "Aggregation complete"
        );

        let exchange_id = exchange.id();
        self.in_progress.insert(exchange_id);
        self.strategy.on_completion(&exchange);
        if let Some(reason) = exchange.properties.completed_by {
            self.statistics.record_completed(reason);
        }

        let sent = match self.dispatch_tx.read().as_ref() {
            Some(tx) => tx.send(exchange).is_ok(),
            None => false,
        };
        if !sent {
            error!(%exchange_id, "Completion dispatcher is gone, dropping aggregated exchange");
            self.in_progress.remove(&exchange_id);
        }
    }

    /// Hands a completed exchange to the sink and settles its bookkeeping.
    async fn deliver(&self, exchange: Exchange) {
        let exchange_id = exchange.id();
        let key = exchange
            .properties
            .correlation_key
            .clone()
            .unwrap_or_default();
        trace!(%exchange_id, key = %key, "Processing aggregated exchange");

        match self.sink.process(exchange).await {
            Ok(()) => {
                self.confirm_delivered(&exchange_id);
                self.redelivery.remove(&exchange_id);
            }
            Err(err) => {
                // left unconfirmed so recovery can redeliver it
                error!(%exchange_id, key = %key, error = %err, "Error processing aggregated exchange");
            }
        }

        self.in_progress.remove(&exchange_id);
    }

    fn confirm_delivered(&self, exchange_id: &ExchangeId) {
        match self.repository.as_recoverable() {
            Some(recoverable) => {
                if !recoverable.confirm_with_result(exchange_id)
                    && recoverable.settings().use_recovery
                {
                    trace!(%exchange_id, "Confirmation not acknowledged, will retry");
                    self.unconfirmed.insert(*exchange_id);
                }
            }
            None => self.repository.confirm(exchange_id),
        }
    }

    /// Delivers queued completions until the queue is closed and empty.
    /// Parallel deliveries still running at that point are awaited too.
    fn spawn_dispatcher(self: &Arc<Self>, rx: Receiver<Exchange>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let parallel = self.config.parallel_processing;

        tokio::spawn(async move {
            debug!(parallel, "Completion dispatcher started");
            let mut deliveries = JoinSet::new();
            while let Ok(exchange) = rx.recv_async().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if parallel {
                    deliveries.spawn(async move { inner.deliver(exchange).await });
                    while deliveries.try_join_next().is_some() {}
                } else {
                    inner.deliver(exchange).await;
                }
            }
            while let Some(joined) = deliveries.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "Parallel delivery task failed");
                }
            }
            debug!("Completion dispatcher stopped");
        })
    }

    fn spawn_interval_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.complete_by_interval();
            }
        })
    }

    fn spawn_recovery(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECOVERY_INITIAL_DELAY).await;
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.recover().await;
                drop(inner);
                // fixed delay between the end of one scan and the next
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Re-registers timeouts for groups already in the repository.
    fn restore_timeouts(&self) {
        let mut restored = 0usize;
        for key in self.repository.keys() {
            let Some(stored) = self.repository.get(&key) else {
                continue;
            };
            if let Some(millis) = stored.exchange.properties.timeout_millis.filter(|ms| *ms > 0) {
                self.timeouts
                    .put(&key, stored.exchange.id(), Duration::from_millis(millis));
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "Restored completion timeouts from repository");
        }
    }

    /// Completes every group whose inactivity timeout elapsed.
    fn purge_timeouts(&self) {
        let _guard = self.lock.acquire();
        for (key, entry) in self.timeouts.take_expired(Instant::now()) {
            debug!(key = %key, exchange_id = %entry.exchange_id, "Completion timeout triggered");
            self.on_timeout_eviction(&key);
        }
    }

    fn on_timeout_eviction(&self, key: &str) {
        let Some(stored) = self.repository.get(key) else {
            debug!(key, "Timed out group already completed elsewhere");
            return;
        };

        if self.in_progress.contains(&stored.exchange.id()) {
            trace!(key, exchange_id = %stored.exchange.id(), "Aggregated exchange already in progress");
            return;
        }

        let mut answer = stored.exchange;
        answer.properties.completed_by = Some(CompletionReason::Timeout);
        match self.on_completion(key, Some(stored.version), answer, true, false) {
            Ok(Some(done)) => self.on_submit_completion(done),
            Ok(None) => {}
            Err(err) if err.is_locking_conflict() => {
                debug!(key, "Timed out group already completed elsewhere");
            }
            Err(err) => warn!(key, error = %err, "Failed to complete timed out group"),
        }
    }

    /// Completes every open group with reason interval.
    fn complete_by_interval(&self) {
        if self.state() != EngineState::Started {
            trace!(state = %self.state(), "Completion interval skipped, engine not started");
            return;
        }

        let keys = self.repository.keys();
        if keys.is_empty() {
            return;
        }
        trace!(groups = keys.len(), "Starting completion interval task");

        let _guard = self.lock.acquire();
        for key in keys {
            let Some(stored) = self.repository.get(&key) else {
                continue;
            };
            if self.in_progress.contains(&stored.exchange.id()) {
                continue;
            }

            let mut exchange = stored.exchange;
            exchange.properties.completed_by = Some(CompletionReason::Interval);
            match self.on_completion(&key, Some(stored.version), exchange, false, false) {
                Ok(Some(done)) => self.on_submit_completion(done),
                Ok(None) => {}
                Err(err) => debug!(key = %key, error = %err, "Interval completion lost a race"),
            }
        }
    }

    pub(crate) fn force_completion_of_all_groups(&self) -> usize {
        if !self.allows_force() {
            warn!(state = %self.state(), "Cannot force completion of all groups, engine not started");
            return 0;
        }

        let keys = self.repository.keys();
        if keys.is_empty() {
            return 0;
        }

        let _guard = self.lock.acquire();
        let total = keys.iter().filter(|key| self.force_complete_key(key)).count();
        if total > 0 {
            debug!(total, "Forced completion of all groups");
        }
        total
    }

    fn force_completion_of_group(&self, key: &str) -> usize {
        if !self.allows_force() {
            warn!(key, state = %self.state(), "Cannot force completion of group, engine not started");
            return 0;
        }
        let _guard = self.lock.acquire();
        usize::from(self.force_complete_key(key))
    }

    fn force_complete_key(&self, key: &str) -> bool {
        let Some(stored) = self.repository.get(key) else {
            return false;
        };
        trace!(key, "Force completion triggered");

        let mut exchange = stored.exchange;
        exchange.properties.completed_by = Some(CompletionReason::Force);
        match self.on_completion(key, Some(stored.version), exchange, false, false) {
            Ok(Some(done)) => {
                self.on_submit_completion(done);
                true
            }
            Ok(None) => true,
            Err(err) => {
                debug!(key, error = %err, "Force completion lost a race");
                false
            }
        }
    }

    fn force_discarding_of_all_groups(&self) -> usize {
        if !self.allows_force() {
            warn!(state = %self.state(), "Cannot force discarding of all groups, engine not started");
            return 0;
        }

        let keys = self.repository.keys();
        if keys.is_empty() {
            return 0;
        }

        let _guard = self.lock.acquire();
        let total = keys.iter().filter(|key| self.force_discard_key(key)).count();
        if total > 0 {
            debug!(total, "Forced discarding of all groups");
        }
        total
    }

    fn force_discarding_of_group(&self, key: &str) -> usize {
        if !self.allows_force() {
            warn!(key, state = %self.state(), "Cannot force discarding of group, engine not started");
            return 0;
        }
        let _guard = self.lock.acquire();
        usize::from(self.force_discard_key(key))
    }

    fn force_discard_key(&self, key: &str) -> bool {
        let Some(stored) = self.repository.get(key) else {
            return false;
        };
        trace!(key, "Force discarding triggered");

        let exchange_id = stored.exchange.id();
        if let Err(err) = self.remove_group(key, stored.version, &stored.exchange) {
            debug!(key, error = %err, "Force discarding lost a race");
            return false;
        }
        self.timeouts.remove(key);
        self.repository.confirm(&exchange_id);
        self.redelivery.remove(&exchange_id);
        self.statistics.record_discarded();
        true
    }
}
