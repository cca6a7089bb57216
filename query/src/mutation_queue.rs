use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    clock::SharedClock, query_persister, BoxError, QueryError, QueryPersister, QueryResult,
};

/// Storage key of the queue. Query keys never start with `__`.
pub(crate) const MUTATION_QUEUE_KEY: &str = "__zen_query/mutation_queue";
const FORMAT_VERSION: u32 = 1;

/// What happens to a job whose replay failed `max_retries` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Discard the job.
    Drop,
    /// Move the job to the dead letter list, see [`MutationQueue::dead_letters`].
    #[default]
    DeadLetter,
}

/// Replay policy of the [`MutationQueue`].
#[derive(Debug, Clone)]
pub struct MutationQueueConfig {
    /// Failed replays after which a job is considered exhausted.
    pub max_retries: u32,
    /// Applied to exhausted jobs.
    pub exhausted_policy: ExhaustedPolicy,
}

impl Default for MutationQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            exhausted_policy: ExhaustedPolicy::default(),
        }
    }
}

/// Kind of change a queued mutation makes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    /// Creates a resource.
    Create,
    /// Changes a resource.
    Update,
    /// Deletes a resource.
    Delete,
    /// Anything else, named by the application.
    Custom(String),
}

/// A mutation recorded while offline, waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationJob {
    /// Unique id.
    pub id: Uuid,
    /// Selects the replay handler.
    pub mutation_key: String,
    /// Kind of change.
    pub action: MutationAction,
    /// Serialized variables.
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Failed replays so far.
    pub retry_count: u32,
}

impl MutationJob {
    /// Creates a job with a fresh id and no failed replays.
    pub fn new(
        mutation_key: impl Into<String>,
        action: MutationAction,
        payload: serde_json::Map<String, serde_json::Value>,
        created_at: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mutation_key: mutation_key.into(),
            action,
            payload,
            created_at,
            retry_count: 0,
        }
    }

    /// Serializes `variables` into a job payload.
    ///
    /// Variables must encode to a JSON object.
    pub fn encode_payload<V: Serialize>(
        variables: &V,
    ) -> QueryResult<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(variables) {
            Ok(serde_json::Value::Object(payload)) => Ok(payload),
            Ok(other) => Err(QueryError::SerializationFailed(format!(
                "expected a JSON object, got `{other}`"
            ))),
            Err(error) => Err(QueryError::SerializationFailed(error.to_string())),
        }
    }

    /// Deserializes the payload back into variables.
    pub fn decode_payload<V: DeserializeOwned>(&self) -> QueryResult<V> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
            .map_err(|error| QueryError::SerializationFailed(error.to_string()))
    }
}

/// Outcome of one [`MutationQueue::replay`] pass.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Jobs replayed and removed.
    pub succeeded: usize,
    /// Failed replay attempts.
    pub failed: usize,
    /// Exhausted jobs discarded.
    pub dropped: usize,
    /// Exhausted jobs moved to the dead letter list.
    pub dead_lettered: usize,
    /// Jobs still queued after the pass.
    pub remaining: usize,
    /// Why the pass stopped before the queue was empty.
    pub stopped: Option<QueryError>,
    /// Another replay was running, nothing was done.
    pub skipped: bool,
}

type ReplayHandler = Arc<dyn Fn(MutationJob) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Durable FIFO of mutations made while offline.
///
/// Jobs are replayed in order through the handler registered for their
/// `mutation_key`. A failed job stops the pass so later jobs never overtake
/// it, until it fails `max_retries` times and the [`ExhaustedPolicy`] moves it
/// out of the way. Every change is written to the persister, if there is one.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: MutationQueueConfig,
    persister: Option<Arc<dyn QueryPersister>>,
    clock: SharedClock,
    jobs: Mutex<VecDeque<MutationJob>>,
    dead_letters: Mutex<Vec<MutationJob>>,
    handlers: RwLock<HashMap<String, ReplayHandler>>,
    replaying: AtomicBool,
    restored: AtomicBool,
}

#[derive(Serialize, Deserialize)]
struct StoredQueue {
    jobs: Vec<MutationJob>,
    #[serde(default)]
    dead_letters: Vec<MutationJob>,
}

/// Clears the replaying flag when the pass ends, even if it is dropped midway.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MutationQueue {
    /// Creates an empty queue.
    ///
    /// Persisted jobs are loaded by [`restore`](Self::restore), or before the
    /// first change that would write the queue back.
    pub fn new(
        config: MutationQueueConfig,
        persister: Option<Arc<dyn QueryPersister>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                persister,
                clock,
                jobs: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(Vec::new()),
                handlers: RwLock::new(HashMap::new()),
                replaying: AtomicBool::new(false),
                restored: AtomicBool::new(false),
            }),
        }
    }

    /// Replay policy.
    pub fn config(&self) -> &MutationQueueConfig {
        &self.inner.config
    }

    /// Builds a job stamped with the queue's clock.
    pub fn create_job(
        &self,
        mutation_key: impl Into<String>,
        action: MutationAction,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> MutationJob {
        MutationJob::new(mutation_key, action, payload, self.inner.clock.unix_millis())
    }

    /// Appends a job and persists the queue.
    pub async fn enqueue(&self, job: MutationJob) {
        self.ensure_restored().await;
        tracing::debug!(id = %job.id, mutation_key = %job.mutation_key, "mutation queued");
        self.inner.jobs.lock().push_back(job);
        self.persist().await;
    }

    /// Queued jobs in replay order.
    pub fn jobs(&self) -> Vec<MutationJob> {
        self.inner.jobs.lock().iter().cloned().collect()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Whether no job is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.jobs.lock().is_empty()
    }

    /// Removes a queued job.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.ensure_restored().await;
        let removed = self.take_job(id).is_some();
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Removes every queued and dead lettered job.
    pub async fn clear(&self) {
        self.ensure_restored().await;
        self.inner.jobs.lock().clear();
        self.inner.dead_letters.lock().clear();
        self.persist().await;
    }

    /// Jobs set aside by [`ExhaustedPolicy::DeadLetter`].
    pub fn dead_letters(&self) -> Vec<MutationJob> {
        self.inner.dead_letters.lock().clone()
    }

    /// Moves dead lettered jobs back to the end of the queue with their retry
    /// counts reset. Returns how many were moved.
    pub async fn requeue_dead_letters(&self) -> usize {
        self.ensure_restored().await;
        let jobs = std::mem::take(&mut *self.inner.dead_letters.lock());
        let count = jobs.len();
        if count == 0 {
            return 0;
        }
        self.inner
            .jobs
            .lock()
            .extend(jobs.into_iter().map(|job| MutationJob { retry_count: 0, ..job }));
        self.persist().await;
        count
    }

    /// Sets the function that replays jobs with `mutation_key`, replacing any
    /// previous one.
    pub fn register_handler<F, Fu>(&self, mutation_key: impl Into<String>, handler: F)
    where
        F: Fn(MutationJob) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: ReplayHandler = Arc::new(move |job| handler(job).boxed());
        self.inner.handlers.write().insert(mutation_key.into(), handler);
    }

    /// Removes the handler of `mutation_key`.
    pub fn unregister_handler(&self, mutation_key: &str) -> bool {
        self.inner.handlers.write().remove(mutation_key).is_some()
    }

    /// Whether `mutation_key` has a handler.
    pub fn has_handler(&self, mutation_key: &str) -> bool {
        self.inner.handlers.read().contains_key(mutation_key)
    }

    /// Loads persisted jobs in front of the ones queued since startup.
    ///
    /// Returns the number of jobs restored. Jobs already queued are skipped.
    pub async fn restore(&self) -> QueryResult<usize> {
        let Some(persister) = &self.inner.persister else {
            return Ok(0);
        };
        let entry = persister
            .read(MUTATION_QUEUE_KEY)
            .await
            .map_err(|error| QueryError::HydrationFailed {
                key: MUTATION_QUEUE_KEY.to_string(),
                message: error.to_string(),
            })?;
        let Some(entry) = entry else {
            self.inner.restored.store(true, Ordering::Release);
            return Ok(0);
        };
        let (stored, _) =
            query_persister::decode::<StoredQueue>(MUTATION_QUEUE_KEY, entry, FORMAT_VERSION)?;
        self.inner.restored.store(true, Ordering::Release);

        let restored = {
            let mut jobs = self.inner.jobs.lock();
            let known = |id: &Uuid| jobs.iter().any(|job| &job.id == id);
            let missing = stored
                .jobs
                .into_iter()
                .filter(|job| !known(&job.id))
                .collect::<Vec<_>>();
            let restored = missing.len();
            for job in missing.into_iter().rev() {
                jobs.push_front(job);
            }
            restored
        };
        {
            let mut dead_letters = self.inner.dead_letters.lock();
            for job in stored.dead_letters {
                if !dead_letters.iter().any(|known| known.id == job.id) {
                    dead_letters.push(job);
                }
            }
        }
        tracing::debug!(restored, "mutation queue restored");
        Ok(restored)
    }

    /// Replays queued jobs in order.
    ///
    /// A failure increments the job's `retry_count` and ends the pass. Once a
    /// job has failed `max_retries` times the exhausted policy is applied and
    /// the pass continues with the next job. A job without a handler ends the
    /// pass with [`QueryError::MissingHandler`]. A call made while another
    /// pass is running returns a report with `skipped` set.
    pub async fn replay(&self) -> ReplayReport {
        if self.inner.replaying.swap(true, Ordering::AcqRel) {
            return ReplayReport {
                skipped: true,
                remaining: self.len(),
                ..ReplayReport::default()
            };
        }
        let _guard = ReplayGuard(&self.inner.replaying);
        self.ensure_restored().await;

        let mut report = ReplayReport::default();
        while let Some(job) = self.front() {
            let handler = self.inner.handlers.read().get(&job.mutation_key).cloned();
            let Some(handler) = handler else {
                report.stopped = Some(QueryError::MissingHandler(job.mutation_key));
                break;
            };

            let id = job.id;
            let mutation_key = job.mutation_key.clone();
            match handler(job).await {
                Ok(()) => {
                    self.take_job(id);
                    report.succeeded += 1;
                    tracing::debug!(%id, %mutation_key, "queued mutation replayed");
                }
                Err(error) => {
                    report.failed += 1;
                    // Removed while the handler ran.
                    let Some(retry_count) = self.record_failure(id) else {
                        continue;
                    };
                    if retry_count < self.inner.config.max_retries {
                        tracing::debug!(%id, %mutation_key, retry_count, %error, "queued mutation failed");
                        report.stopped = Some(QueryError::mutation_failed(error));
                        break;
                    }
                    self.apply_exhausted_policy(id, &mut report);
                    tracing::warn!(
                        %id,
                        %mutation_key,
                        retry_count,
                        %error,
                        policy = ?self.inner.config.exhausted_policy,
                        "queued mutation exhausted its retries"
                    );
                }
            }
        }

        if report.succeeded > 0 || report.failed > 0 {
            self.persist().await;
        }
        report.remaining = self.len();
        report
    }

    /// Loads persisted jobs once, so a write never replaces jobs stored by an
    /// earlier run. An unreadable queue is given up on and overwritten.
    async fn ensure_restored(&self) {
        if self.inner.restored.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.restore().await {
            tracing::warn!(%error, "discarding unreadable persisted mutation queue");
            self.inner.restored.store(true, Ordering::Release);
        }
    }

    fn front(&self) -> Option<MutationJob> {
        self.inner.jobs.lock().front().cloned()
    }

    fn take_job(&self, id: Uuid) -> Option<MutationJob> {
        let mut jobs = self.inner.jobs.lock();
        let index = jobs.iter().position(|job| job.id == id)?;
        jobs.remove(index)
    }

    fn record_failure(&self, id: Uuid) -> Option<u32> {
        let mut jobs = self.inner.jobs.lock();
        let job = jobs.iter_mut().find(|job| job.id == id)?;
        job.retry_count += 1;
        Some(job.retry_count)
    }

    fn apply_exhausted_policy(&self, id: Uuid, report: &mut ReplayReport) {
        let Some(job) = self.take_job(id) else {
            return;
        };
        match self.inner.config.exhausted_policy {
            ExhaustedPolicy::Drop => report.dropped += 1,
            ExhaustedPolicy::DeadLetter => {
                self.inner.dead_letters.lock().push(job);
                report.dead_lettered += 1;
            }
        }
    }

    async fn persist(&self) {
        let Some(persister) = &self.inner.persister else {
            return;
        };
        let stored = StoredQueue {
            jobs: self.jobs(),
            dead_letters: self.dead_letters(),
        };
        let entry = match query_persister::encode(
            &stored,
            self.inner.clock.unix_millis(),
            FORMAT_VERSION,
        ) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::error!(%error, "failed to encode mutation queue");
                return;
            }
        };
        if let Err(error) = persister.write(MUTATION_QUEUE_KEY, entry).await {
            tracing::warn!(%error, "failed to persist mutation queue");
        }
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("config", &self.inner.config)
            .field("jobs", &self.len())
            .field("dead_letters", &self.inner.dead_letters.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::{ManualClock, MemoryPersister};

    fn queue(config: MutationQueueConfig, persister: Option<MemoryPersister>) -> MutationQueue {
        let persister = persister.map(|persister| Arc::new(persister) as Arc<dyn QueryPersister>);
        MutationQueue::new(config, persister, Arc::new(ManualClock::new()))
    }

    fn payload(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    async fn enqueue_titles(queue: &MutationQueue, titles: &[&str]) {
        for title in titles {
            let job = queue.create_job(
                "create_post",
                MutationAction::Create,
                payload(json!({ "title": title })),
            );
            queue.enqueue(job).await;
        }
    }

    /// Records replayed titles and fails the ones listed in `failing`.
    fn record_titles(queue: &MutationQueue, failing: &'static [&'static str]) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        queue.register_handler("create_post", move |job: MutationJob| {
            let seen = handler_seen.clone();
            async move {
                let title = job.payload["title"].as_str().unwrap_or_default().to_string();
                seen.lock().push(title.clone());
                if failing.contains(&title.as_str()) {
                    Err::<(), BoxError>(format!("server rejected {title}").into())
                } else {
                    Ok(())
                }
            }
        });
        seen
    }

    #[tokio::test]
    async fn replays_in_order() {
        let queue = queue(MutationQueueConfig::default(), None);
        enqueue_titles(&queue, &["first", "second", "third"]).await;
        let seen = record_titles(&queue, &[]);

        let report = queue.replay().await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.remaining, 0);
        assert!(report.stopped.is_none());
        assert_eq!(*seen.lock(), ["first", "second", "third"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failure_stops_the_pass_and_counts_retries() {
        let queue = queue(MutationQueueConfig::default(), None);
        enqueue_titles(&queue, &["first", "broken", "third"]).await;
        let seen = record_titles(&queue, &["broken"]);

        let report = queue.replay().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.stopped, Some(QueryError::MutationFailed(_))));
        assert_eq!(*seen.lock(), ["first", "broken"]);

        let jobs = queue.jobs();
        assert_eq!(jobs[0].retry_count, 1);
        assert_eq!(jobs[1].payload["title"], "third");
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_and_replay_continues() {
        let config = MutationQueueConfig {
            max_retries: 2,
            ..MutationQueueConfig::default()
        };
        let queue = queue(config, None);
        enqueue_titles(&queue, &["broken", "after"]).await;
        let seen = record_titles(&queue, &["broken"]);

        let first = queue.replay().await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.remaining, 2);

        let second = queue.replay().await;
        assert_eq!(second.dead_lettered, 1);
        assert_eq!(second.succeeded, 1);
        assert_eq!(second.remaining, 0);
        assert!(second.stopped.is_none());
        assert_eq!(*seen.lock(), ["broken", "broken", "after"]);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);

        assert_eq!(queue.requeue_dead_letters().await, 1);
        assert_eq!(queue.jobs()[0].retry_count, 0);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn drop_policy_discards_exhausted_jobs() {
        let config = MutationQueueConfig {
            max_retries: 1,
            exhausted_policy: ExhaustedPolicy::Drop,
        };
        let queue = queue(config, None);
        enqueue_titles(&queue, &["broken", "after"]).await;
        record_titles(&queue, &["broken"]);

        let report = queue.replay().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(report.succeeded, 1);
        assert!(queue.is_empty());
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn missing_handler_stops_the_pass() {
        let queue = queue(MutationQueueConfig::default(), None);
        enqueue_titles(&queue, &["orphan"]).await;

        let report = queue.replay().await;
        assert!(matches!(
            report.stopped,
            Some(QueryError::MissingHandler(ref key)) if key == "create_post"
        ));
        assert_eq!(report.remaining, 1);
        assert_eq!(queue.jobs()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn concurrent_replay_is_skipped() {
        let queue = queue(MutationQueueConfig::default(), None);
        enqueue_titles(&queue, &["slow"]).await;

        let (release, gate) = futures_channel::oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate)));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            queue.register_handler("create_post", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = gate.lock().take();
                async move {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    Ok::<(), BoxError>(())
                }
            });
        }

        let running = tokio::spawn({
            let queue = queue.clone();
            async move { queue.replay().await }
        });
        tokio::task::yield_now().await;

        let skipped = queue.replay().await;
        assert!(skipped.skipped);
        assert_eq!(skipped.remaining, 1);

        release.send(()).expect("release");
        let report = running.await.expect("join");
        assert_eq!(report.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!queue.replay().await.skipped);
    }

    #[tokio::test]
    async fn persisted_jobs_are_restored() {
        let storage = MemoryPersister::new();
        let original = queue(MutationQueueConfig::default(), Some(storage.clone()));
        enqueue_titles(&original, &["first", "second"]).await;
        assert!(storage.get(MUTATION_QUEUE_KEY).is_some());

        let restarted = queue(MutationQueueConfig::default(), Some(storage.clone()));
        assert_eq!(restarted.restore().await.expect("restore"), 2);
        assert_eq!(restarted.restore().await.expect("restore again"), 0);
        enqueue_titles(&restarted, &["third"]).await;
        assert_eq!(titles_of(&restarted), ["first", "second", "third"]);
    }

    fn titles_of(queue: &MutationQueue) -> Vec<String> {
        queue
            .jobs()
            .into_iter()
            .map(|job| job.payload["title"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn enqueue_before_restore_keeps_stored_jobs() {
        let storage = MemoryPersister::new();
        let original = queue(MutationQueueConfig::default(), Some(storage.clone()));
        enqueue_titles(&original, &["first", "second"]).await;

        let restarted = queue(MutationQueueConfig::default(), Some(storage.clone()));
        enqueue_titles(&restarted, &["third"]).await;
        assert_eq!(titles_of(&restarted), ["first", "second", "third"]);
        assert_eq!(restarted.restore().await.expect("restore"), 0);

        let again = queue(MutationQueueConfig::default(), Some(storage));
        assert_eq!(again.restore().await.expect("restore"), 3);
        assert_eq!(titles_of(&again), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn replay_loads_stored_jobs_first() {
        let storage = MemoryPersister::new();
        let original = queue(MutationQueueConfig::default(), Some(storage.clone()));
        enqueue_titles(&original, &["first"]).await;

        let restarted = queue(MutationQueueConfig::default(), Some(storage));
        let seen = record_titles(&restarted, &[]);
        let report = restarted.replay().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(*seen.lock(), ["first"]);
    }

    #[tokio::test]
    async fn unreadable_queue_fails_to_restore() {
        let storage = MemoryPersister::new();
        storage
            .write(
                MUTATION_QUEUE_KEY,
                query_persister::PersistedQuery {
                    data: json!("garbage"),
                    timestamp: 0,
                    version: FORMAT_VERSION,
                },
            )
            .await
            .expect("write");

        let queue = queue(MutationQueueConfig::default(), Some(storage));
        assert!(matches!(
            queue.restore().await,
            Err(QueryError::HydrationFailed { .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn payload_must_be_an_object() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Post {
            title: String,
        }

        let encoded = MutationJob::encode_payload(&Post {
            title: "hello".into(),
        })
        .expect("object");
        let job = MutationJob::new("create_post", MutationAction::Create, encoded, 0);
        assert_eq!(
            job.decode_payload::<Post>().expect("decode"),
            Post {
                title: "hello".into()
            }
        );

        assert!(matches!(
            MutationJob::encode_payload(&42),
            Err(QueryError::SerializationFailed(_))
        ));
    }
}
