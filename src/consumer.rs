//! Consumer group reader
//!
//! A [`Consumer`] is one named member of a consumer group. Its loop is
//! single-task and cooperative:
//!
//! ```text
//! INIT ──► RUNNING ──► SHUTTING_DOWN ──► STOPPED
//!   │        │  ▲
//!   │        └──┘ read ► process-and-ack ► reclaim ► sleep
//!   └─ ensure group exists (already-exists is fine)
//! ```
//!
//! Handlers run inline, so a slow handler stretches the poll cycle.
//! Cancellation is observed after the reclaim pass and during the
//! inter-cycle sleep, never while a handler is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{GroupCreation, StreamBackend};
use crate::config::{ConsumeErrorPolicy, StreamsConfig};
use crate::error::Result;
use crate::handler::MessageHandler;
use crate::reclaim::{Outcome, ReclaimReport, Supervisor, DEFAULT_RECLAIM_PAGE};
use crate::types::{PendingEntry, ReadGroupOptions, RANGE_END, RANGE_START, STREAM_BEGINNING};

/// Backoff multiplier after a connection failure.
const CONNECTION_BACKOFF: u32 = 3;

/// Backoff multiplier after any other failure.
const ERROR_BACKOFF: u32 = 2;

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created; the group has not been checked yet
    Init,
    /// Polling
    Running,
    /// Cancellation observed; finishing the current iteration
    ShuttingDown,
    /// The loop has exited
    Stopped,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// New entries read from the group
    pub delivered: usize,
    /// Entries acknowledged after the handler accepted them
    pub acknowledged: usize,
    /// Handler failures left pending
    pub failed: usize,
    /// Undecodable entries acknowledged without the handler
    pub poison: usize,
    /// Pending entries claimed and re-processed
    pub reclaimed: usize,
    /// Pending entries discarded after exhausting the retry budget
    pub discarded: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Acknowledged => self.acknowledged += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::Poison(_) => self.poison += 1,
        }
    }

    fn merge(&mut self, reclaim: ReclaimReport) {
        self.reclaimed += reclaim.reclaimed;
        self.discarded += reclaim.discarded;
        self.acknowledged += reclaim.acknowledged;
        self.failed += reclaim.failed;
        self.poison += reclaim.poison;
    }

    /// Whether the cycle found nothing to do.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Identifiers and tuning for one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Stream to read
    pub stream: String,
    /// Consumer group
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
    /// Entries read per cycle
    pub batch_size: usize,
    /// Sleep between cycles before backoff
    pub poll_interval: Duration,
    /// Deliveries before an entry is discarded
    pub retry_limit: u64,
    /// Block the group read for up to this long
    pub block: Option<Duration>,
    /// PEL records inspected per reclaim pass
    pub reclaim_page_size: usize,
    /// What to do after a non-connection failure
    pub on_error: ConsumeErrorPolicy,
}

impl ConsumerOptions {
    /// Options for the given identifiers with default tuning.
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            retry_limit: 3,
            block: None,
            reclaim_page_size: DEFAULT_RECLAIM_PAGE,
            on_error: ConsumeErrorPolicy::Exit,
        }
    }

    /// Options taken from the `[streams]` section.
    pub fn from_config(config: &StreamsConfig) -> Self {
        Self {
            stream: config.stream.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            retry_limit: config.retry_limit,
            block: config.block(),
            reclaim_page_size: config.reclaim_page_size,
            on_error: config.on_consume_error,
        }
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry budget.
    pub fn retry_limit(mut self, retry_limit: u64) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Set the failure policy.
    pub fn on_error(mut self, policy: ConsumeErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

/// One named consumer in a consumer group.
pub struct Consumer {
    backend: Arc<dyn StreamBackend>,
    options: ConsumerOptions,
    supervisor: Supervisor,
    state: Mutex<ConsumerState>,
    group_ready: AtomicBool,
}

impl Consumer {
    /// Create a consumer. Nothing is sent until [`Consumer::init`] or the first poll.
    pub fn new(backend: Arc<dyn StreamBackend>, options: ConsumerOptions) -> Self {
        let supervisor = Supervisor::new(
            Arc::clone(&backend),
            options.stream.as_str(),
            options.group.as_str(),
            options.consumer.as_str(),
            options.retry_limit,
        )
        .with_page_size(options.reclaim_page_size);

        Self {
            backend,
            options,
            supervisor,
            state: Mutex::new(ConsumerState::Init),
            group_ready: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Identifiers and tuning in use.
    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    /// Ensure the consumer group exists, starting from the beginning of
    /// the stream so existing backlog is delivered.
    ///
    /// An existing group is not an error; any other failure is.
    pub async fn init(&self) -> Result<()> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let created = self
            .backend
            .create_group(
                &self.options.stream,
                &self.options.group,
                STREAM_BEGINNING,
                true,
            )
            .await
            .map_err(|e| self.supervisor.backend_error("XGROUP CREATE", e))?;

        match created {
            GroupCreation::Created => info!(
                stream = %self.options.stream,
                group = %self.options.group,
                "created consumer group"
            ),
            GroupCreation::AlreadyExists => debug!(
                stream = %self.options.stream,
                group = %self.options.group,
                "consumer group already exists"
            ),
        }

        self.group_ready.store(true, Ordering::Release);
        self.set_state(ConsumerState::Running);
        Ok(())
    }

    /// Run one read, dispatch and reclaim cycle.
    pub async fn poll_once<H>(&self, handler: &H) -> Result<CycleReport>
    where
        H: MessageHandler + ?Sized,
    {
        self.init().await?;

        let mut options = ReadGroupOptions::new(self.options.batch_size.max(1));
        if let Some(block) = self.options.block {
            options = options.block(block);
        }

        let mut reply = self
            .backend
            .read_group(
                &self.options.group,
                &self.options.consumer,
                &[self.options.stream.as_str()],
                options,
            )
            .await
            .map_err(|e| {
                if e.is_no_group() {
                    warn!(
                        stream = %self.options.stream,
                        group = %self.options.group,
                        "consumer group is gone; recreating it on the next cycle"
                    );
                    self.group_ready.store(false, Ordering::Release);
                }
                self.supervisor.backend_error("XREADGROUP", e)
            })?;
        let entries = reply.remove(&self.options.stream).unwrap_or_default();

        let mut report = CycleReport {
            delivered: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            let outcome = self.supervisor.process_and_ack(handler, entry, 1).await?;
            report.record(&outcome);
        }

        let reclaimed = self.supervisor.reclaim(handler).await?;
        report.merge(reclaimed);

        if !report.is_idle() {
            debug!(
                stream = %self.options.stream,
                consumer = %self.options.consumer,
                delivered = report.delivered,
                acknowledged = report.acknowledged,
                failed = report.failed,
                reclaimed = report.reclaimed,
                discarded = report.discarded,
                "poll cycle complete"
            );
        }
        Ok(report)
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Connection failures are logged and retried after a ×3 backoff.
    /// Other failures either end the loop with the error
    /// ([`ConsumeErrorPolicy::Exit`]) or are logged and retried after a
    /// ×2 backoff ([`ConsumeErrorPolicy::Continue`]).
    pub async fn consume<H>(&self, handler: &H, shutdown: CancellationToken) -> Result<()>
    where
        H: MessageHandler + ?Sized,
    {
        if let Err(e) = self.init().await {
            self.set_state(ConsumerState::Stopped);
            return Err(e);
        }

        info!(
            stream = %self.options.stream,
            group = %self.options.group,
            consumer = %self.options.consumer,
            batch_size = self.options.batch_size,
            poll_interval = ?self.options.poll_interval,
            retry_limit = self.options.retry_limit,
            "consumer started"
        );

        loop {
            let multiplier = match self.poll_once(handler).await {
                Ok(_) => 1,
                Err(e) if e.is_connection() => {
                    let backoff = self.options.poll_interval * CONNECTION_BACKOFF;
                    warn!(
                        stream = %self.options.stream,
                        group = %self.options.group,
                        consumer = %self.options.consumer,
                        error = %e,
                        ?backoff,
                        "stream backend unreachable; backing off"
                    );
                    CONNECTION_BACKOFF
                }
                Err(e) => {
                    error!(
                        stream = %self.options.stream,
                        group = %self.options.group,
                        consumer = %self.options.consumer,
                        error = %e,
                        "consume cycle failed"
                    );
                    if self.options.on_error == ConsumeErrorPolicy::Exit {
                        self.set_state(ConsumerState::Stopped);
                        return Err(e);
                    }
                    ERROR_BACKOFF
                }
            };

            if shutdown.is_cancelled() {
                break;
            }

            let delay = self.options.poll_interval * multiplier;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConsumerState::ShuttingDown);
        info!(
            stream = %self.options.stream,
            consumer = %self.options.consumer,
            "consumer shutting down"
        );
        self.set_state(ConsumerState::Stopped);
        Ok(())
    }

    /// Pending entries of this consumer's group, optionally for one consumer.
    pub async fn pending(&self, count: usize, consumer: Option<&str>) -> Result<Vec<PendingEntry>> {
        self.backend
            .pending(
                &self.options.stream,
                &self.options.group,
                RANGE_START,
                RANGE_END,
                count,
                consumer,
            )
            .await
            .map_err(|e| self.supervisor.backend_error("XPENDING", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, Op};
    use crate::backend::BackendError;
    use crate::envelope::Envelope;
    use crate::error::StreamError;
    use crate::handler::BoxError;
    use crate::types::EntryId;

    fn consumer(mem: &Arc<MemoryBackend>) -> Consumer {
        Consumer::new(mem.clone(), ConsumerOptions::new("s", "g", "c"))
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let mem = Arc::new(MemoryBackend::new());
        let first = consumer(&mem);
        assert_eq!(first.state(), ConsumerState::Init);
        first.init().await.unwrap();
        assert_eq!(first.state(), ConsumerState::Running);

        let second = consumer(&mem);
        second.init().await.unwrap();
        assert_eq!(mem.calls(Op::CreateGroup), 2);

        // Cached after the first success.
        second.init().await.unwrap();
        assert_eq!(mem.calls(Op::CreateGroup), 2);
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal() {
        let mem = Arc::new(MemoryBackend::new());
        mem.fail_next(
            Op::CreateGroup,
            BackendError::Server("WRONGTYPE Operation against a key".into()),
        );
        let c = consumer(&mem);
        let err = c
            .consume(&|_: &Envelope, _: EntryId| Ok::<(), BoxError>(()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Consume { .. }));
        assert_eq!(c.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_idle_cycle() {
        let mem = Arc::new(MemoryBackend::new());
        let c = consumer(&mem);
        let report = c
            .poll_once(&|_: &Envelope, _: EntryId| Ok::<(), BoxError>(()))
            .await
            .unwrap();
        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_one_cycle() {
        let mem = Arc::new(MemoryBackend::new());
        let c = consumer(&mem);
        let token = CancellationToken::new();
        token.cancel();

        c.consume(&|_: &Envelope, _: EntryId| Ok::<(), BoxError>(()), token)
            .await
            .unwrap();
        assert_eq!(c.state(), ConsumerState::Stopped);
        assert_eq!(mem.calls(Op::ReadGroup), 1);
    }

    #[tokio::test]
    async fn test_deleted_group_is_recreated() {
        let mem = Arc::new(MemoryBackend::new());
        let c = consumer(&mem);
        let ok = |_: &Envelope, _: EntryId| Ok::<(), BoxError>(());
        c.poll_once(&ok).await.unwrap();
        assert_eq!(mem.calls(Op::CreateGroup), 1);

        assert!(mem.delete("s").await.unwrap());
        let err = c.poll_once(&ok).await.unwrap_err();
        assert!(matches!(err, StreamError::Consume { .. }), "{:?}", err);

        let fields = Envelope::new("after", serde_json::Value::Null).encode().unwrap();
        mem.append("s", &fields, None).await.unwrap();
        let report = c.poll_once(&ok).await.unwrap();
        assert_eq!(mem.calls(Op::CreateGroup), 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.acknowledged, 1);
        assert!(c.pending(10, None).await.unwrap().is_empty());
    }
}
