//! One reconciliation cycle for one watched repository.
//!
//! ```text
//! Loading -> Resolving-Credential -> Polling -> Comparing
//!     -> Persisting-Unchanged                  -> Scheduled
//!     -> Dispatching -> Persisting-Changed     -> Scheduled
//! ```
//!
//! A changed commit is dispatched *before* the new observed state is
//! persisted. If delivery fails the stored state still describes the previous
//! commit, so the next cycle detects the change again and re-dispatches. A
//! failed status write after a successful delivery produces a duplicate
//! notification on the next cycle rather than a lost one.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::duration::format_duration;
use crate::status::{self, Transition};
use crate::{
    CredentialResolver, EventDispatcher, PollerSelector, PolledRepository, ReconcileError,
    ReconcileId, RecordKey, RecordStore, RepositoryLocation, StoreError,
};

/// How a completed cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The record no longer exists; nothing was done.
    Absent,

    /// The upstream tip has not moved.
    Unchanged { requeue_after: Duration },

    /// A new observed state was persisted.
    ///
    /// `dispatched` is `false` only when the poll produced no commit payload.
    Changed { requeue_after: Duration, dispatched: bool },
}

impl ReconcileOutcome {
    /// Delay before the next cycle, or `None` when no further cycle is due.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Absent => None,
            Self::Unchanged { requeue_after } | Self::Changed { requeue_after, .. } => Some(*requeue_after),
        }
    }
}

/// Drives the observed state of one record toward the upstream tip.
///
/// Holds no per-record state; a single instance serves every record
/// concurrently.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    credentials: Arc<dyn CredentialResolver>,
    pollers: Arc<dyn PollerSelector>,
    dispatcher: Arc<dyn EventDispatcher>,
    deadline: Option<Duration>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        credentials: Arc<dyn CredentialResolver>,
        pollers: Arc<dyn PollerSelector>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self { store, credentials, pollers, dispatcher, deadline: None }
    }

    /// Abandons any cycle still running after `deadline` and records it as a
    /// failure.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Runs one cycle for `key`.
    ///
    /// `cancel` is checked between stages; once it fires the cycle stops
    /// without writing status or dispatching.
    pub async fn reconcile(
        &self,
        key: &RecordKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reconcile_id = ReconcileId::new_random();
        let span = info_span!(
            "reconcile",
            namespace = %key.namespace,
            name = %key.name,
            %reconcile_id,
        );
        self.run_cycle(key, cancel).instrument(span).await
    }

    async fn run_cycle(
        &self,
        key: &RecordKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        info!("reconciling PolledRepository");

        let Some(record) = self.store.get(key).await? else {
            debug!("record no longer exists");
            return Ok(ReconcileOutcome::Absent);
        };

        let converged = match self.deadline {
            Some(limit) => tokio::time::timeout(limit, self.converge(&record, cancel))
                .await
                .unwrap_or(Err(ReconcileError::DeadlineExceeded(limit))),
            None => self.converge(&record, cancel).await,
        };

        match converged {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                match &err {
                    ReconcileError::Cancelled => debug!("cycle cancelled"),
                    // The store itself is failing; another write would not land.
                    ReconcileError::Store(_) => error!(error = %err, "unable to update repository status"),
                    _ => {
                        error!(error = %err, "reconcile failed");
                        self.record_failure(&record, &err).await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn converge(
        &self,
        record: &PolledRepository,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let spec = &record.spec;
        let location = RepositoryLocation::from_url(&spec.url, &spec.kind)?;
        let token = self.auth_token(record).await?;

        let poller = self
            .pollers
            .select(&spec.kind, &location.endpoint, &token)
            .ok_or_else(|| ReconcileError::UnsupportedKind(spec.kind.clone()))?;

        let base = record.status.poll_base(&spec.git_ref);
        let polled = poller.poll(&location.repository, &base).await?;
        info!(status = %polled.status, "polled");

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let requeue_after = spec.frequency;
        match status::after_poll(record, &polled.status) {
            Transition::Unchanged { write } => {
                if let Some(next) = write {
                    self.store.update_status(&record.key, next).await?;
                }
                info!(
                    frequency = %format_duration(requeue_after),
                    "poll status unchanged, requeueing next check"
                );
                Ok(ReconcileOutcome::Unchanged { requeue_after })
            }
            Transition::Changed { status: next } => {
                info!(status = %next.poll_status, "poll status changed");
                let dispatched = match &polled.commit {
                    Some(commit) => {
                        self.dispatcher.dispatch(record, commit).await?;
                        true
                    }
                    None => {
                        warn!("poll status changed without a commit payload; nothing to dispatch");
                        false
                    }
                };
                self.store.update_status(&record.key, next).await?;
                info!(frequency = %format_duration(requeue_after), "requeueing next check");
                Ok(ReconcileOutcome::Changed { requeue_after, dispatched })
            }
        }
    }

    async fn auth_token(&self, record: &PolledRepository) -> Result<String, ReconcileError> {
        let Some(auth) = &record.spec.auth else {
            return Ok(String::new());
        };
        let key = auth.effective_key();
        self.credentials
            .resolve(&record.key.namespace, &auth.secret_ref, key)
            .await
            .map_err(|err| {
                error!(
                    secret = %auth.secret_ref,
                    namespace = %record.key.namespace,
                    key,
                    error = %err,
                    "getting the auth token failed"
                );
                ReconcileError::Credential(err)
            })
    }

    /// Best-effort write of the failure text; the observed state is untouched.
    async fn record_failure(&self, record: &PolledRepository, err: &ReconcileError) {
        let Some(next) = status::after_failure(record, &err.to_string()) else {
            return;
        };
        match self.store.update_status(&record.key, next).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => debug!("record deleted before the failure could be recorded"),
            Err(store_err) => error!(error = %store_err, "unable to update repository status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        AuthSecret, Commit, CommitPoller, CredentialError, DispatchError, Generation, Namespace,
        PollError, PollStatus, Polled, RecordName, RepositoryId, RepositoryStatus, RetryPolicy,
        SecretName, UpstreamKind, WatchedRepository,
    };

    const REPO_URL: &str = "https://github.com/bigkevmcd/go-demo.git";
    const REPO_ID: &str = "bigkevmcd/go-demo";
    const REF: &str = "main";
    const SHA: &str = "24317a55785cd98d6c9bf50a5204bc6be17e7316";
    const ETAG: &str = r#"W/"878f43039ad0553d0d3122d8bc171b01""#;

    // -- fakes -------------------------------------------------------------

    #[derive(Default)]
    struct FakeStore {
        records: Mutex<HashMap<RecordKey, PolledRepository>>,
        writes: Mutex<u32>,
    }

    impl FakeStore {
        fn with(record: PolledRepository) -> Arc<Self> {
            let store = Self::default();
            store.records.lock().unwrap().insert(record.key.clone(), record);
            Arc::new(store)
        }

        fn status(&self, key: &RecordKey) -> RepositoryStatus {
            self.records.lock().unwrap()[key].status.clone()
        }

        fn writes(&self) -> u32 {
            *self.writes.lock().unwrap()
        }
    }

    #[async_trait]
    impl RecordStore for FakeStore {
        async fn get(&self, key: &RecordKey) -> Result<Option<PolledRepository>, StoreError> {
            Ok(self.records.lock().unwrap().get(key).cloned())
        }

        async fn update_status(&self, key: &RecordKey, status: RepositoryStatus) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
            record.status = status;
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Answers polls from a table keyed by repository and incoming state.
    #[derive(Default)]
    struct FakePoller {
        responses: Mutex<HashMap<(String, PollStatus), Polled>>,
        failure: Mutex<Option<u16>>,
        stall: Mutex<Option<Duration>>,
    }

    impl FakePoller {
        fn respond(&self, repo: &str, input: PollStatus, output: Polled) {
            self.responses.lock().unwrap().insert((repo.to_string(), input), output);
        }

        fn fail_with_status(&self, status: u16) {
            *self.failure.lock().unwrap() = Some(status);
        }

        fn stall_for(&self, delay: Duration) {
            *self.stall.lock().unwrap() = Some(delay);
        }
    }

    #[async_trait]
    impl CommitPoller for Arc<FakePoller> {
        async fn poll(&self, repository: &RepositoryId, previous: &PollStatus) -> Result<Polled, PollError> {
            let stall = *self.stall.lock().unwrap();
            if let Some(delay) = stall {
                tokio::time::sleep(delay).await;
            }
            if let Some(status) = *self.failure.lock().unwrap() {
                return Err(PollError::Status { status });
            }
            self.responses
                .lock()
                .unwrap()
                .get(&(repository.to_string(), previous.clone()))
                .cloned()
                .ok_or_else(|| PollError::Transport(format!("no fake response for {previous:?}")))
        }
    }

    struct FakeSelector {
        poller: Arc<FakePoller>,
        selections: Mutex<Vec<(UpstreamKind, String, String)>>,
    }

    impl PollerSelector for FakeSelector {
        fn select(&self, kind: &UpstreamKind, endpoint: &str, token: &str) -> Option<Box<dyn CommitPoller>> {
            self.selections
                .lock()
                .unwrap()
                .push((kind.clone(), endpoint.to_string(), token.to_string()));
            kind.is_supported()
                .then(|| Box::new(Arc::clone(&self.poller)) as Box<dyn CommitPoller>)
        }
    }

    #[derive(Default)]
    struct StaticCredentials(HashMap<(String, String), String>);

    #[async_trait]
    impl CredentialResolver for StaticCredentials {
        async fn resolve(&self, namespace: &Namespace, name: &SecretName, key: &str) -> Result<String, CredentialError> {
            self.0
                .get(&(name.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| CredentialError::NotFound {
                    namespace: namespace.clone(),
                    name: name.clone(),
                })
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<(String, Commit)>>,
        fail: bool,
    }

    #[async_trait]
    impl EventDispatcher for RecordingDispatcher {
        async fn dispatch(&self, record: &PolledRepository, commit: &Commit) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Delivery {
                    endpoint: record.spec.endpoint.clone(),
                    attempts: 1,
                    message: "connection refused".to_string(),
                });
            }
            self.dispatched
                .lock()
                .unwrap()
                .push((record.spec.endpoint.clone(), commit.clone()));
            Ok(())
        }
    }

    // -- harness -----------------------------------------------------------

    struct Harness {
        store: Arc<FakeStore>,
        poller: Arc<FakePoller>,
        selector: Arc<FakeSelector>,
        dispatcher: Arc<RecordingDispatcher>,
        reconciler: Reconciler,
        key: RecordKey,
    }

    impl Harness {
        fn new(record: PolledRepository) -> Self {
            Self::build(record, StaticCredentials::default(), RecordingDispatcher::default())
        }

        fn build(record: PolledRepository, credentials: StaticCredentials, dispatcher: RecordingDispatcher) -> Self {
            let key = record.key.clone();
            let store = FakeStore::with(record);
            let poller = Arc::new(FakePoller::default());
            let selector = Arc::new(FakeSelector {
                poller: Arc::clone(&poller),
                selections: Mutex::new(Vec::new()),
            });
            let dispatcher = Arc::new(dispatcher);
            let reconciler = Reconciler::new(
                store.clone(),
                Arc::new(credentials),
                selector.clone(),
                dispatcher.clone(),
            );
            Self { store, poller, selector, dispatcher, reconciler, key }
        }

        async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcileError> {
            self.reconciler.reconcile(&self.key, &CancellationToken::new()).await
        }

        fn dispatch_count(&self) -> usize {
            self.dispatcher.dispatched.lock().unwrap().len()
        }
    }

    fn new_record() -> PolledRepository {
        PolledRepository::new(
            RecordKey::new(
                Namespace::new("testing").unwrap(),
                RecordName::new("test-repository").unwrap(),
            ),
            WatchedRepository {
                url: REPO_URL.to_string(),
                git_ref: REF.to_string(),
                kind: UpstreamKind::GitHub,
                auth: None,
                frequency: Duration::from_secs(5 * 60),
                endpoint: "https://example.com/testing".to_string(),
            },
        )
    }

    fn complete_status() -> PollStatus {
        PollStatus::new(REF, SHA, ETAG)
    }

    fn commit() -> Commit {
        Commit::new(serde_json::json!({ "id": "main" }).as_object().unwrap().clone())
    }

    // -- tests -------------------------------------------------------------

    #[tokio::test]
    async fn first_poll_persists_status_and_dispatches() {
        let h = Harness::new(new_record());
        h.poller.respond(REPO_ID, PollStatus::for_ref(REF), Polled::fetched(complete_status(), commit()));

        let outcome = h.reconcile().await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Changed { requeue_after: Duration::from_secs(300), dispatched: true }
        );
        let dispatched = h.dispatcher.dispatched.lock().unwrap().clone();
        assert_eq!(dispatched, vec![("https://example.com/testing".to_string(), commit())]);
        assert_eq!(
            h.store.status(&h.key),
            RepositoryStatus {
                poll_status: complete_status(),
                last_error: String::new(),
                observed_generation: Generation::INITIAL,
            }
        );
    }

    #[tokio::test]
    async fn unchanged_upstream_neither_writes_nor_dispatches() {
        let h = Harness::new(new_record());
        h.poller.respond(REPO_ID, PollStatus::for_ref(REF), Polled::fetched(complete_status(), commit()));
        h.poller.respond(REPO_ID, complete_status(), Polled::not_modified(complete_status()));

        h.reconcile().await.unwrap();
        let writes_after_first = h.store.writes();

        for _ in 0..3 {
            let outcome = h.reconcile().await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::Unchanged { requeue_after: Duration::from_secs(300) });
        }

        assert_eq!(h.dispatch_count(), 1);
        assert_eq!(h.store.writes(), writes_after_first);
        assert_eq!(h.store.status(&h.key).poll_status, complete_status());
    }

    #[tokio::test]
    async fn resolved_token_is_handed_to_the_selector() {
        let mut record = new_record();
        record.spec.auth = Some(AuthSecret::new(SecretName::new("gh-auth").unwrap(), "token"));
        let mut creds = StaticCredentials::default();
        creds.0.insert(("gh-auth".to_string(), "token".to_string()), "abc123".to_string());
        let h = Harness::build(record, creds, RecordingDispatcher::default());
        h.poller.respond(REPO_ID, PollStatus::for_ref(REF), Polled::fetched(complete_status(), commit()));

        h.reconcile().await.unwrap();

        let selections = h.selector.selections.lock().unwrap().clone();
        assert_eq!(
            selections,
            vec![(UpstreamKind::GitHub, "https://api.github.com".to_string(), "abc123".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_credential_fails_the_cycle_and_is_recorded() {
        let mut record = new_record();
        record.spec.auth = Some(AuthSecret::new(SecretName::new("absent").unwrap(), "token"));
        let h = Harness::new(record);

        let err = h.reconcile().await.unwrap_err();

        assert!(matches!(err, ReconcileError::Credential(CredentialError::NotFound { .. })));
        assert!(h.selector.selections.lock().unwrap().is_empty());
        assert!(h.store.status(&h.key).last_error.contains("absent"));
    }

    #[tokio::test]
    async fn upstream_not_found_sets_last_error_and_keeps_state() {
        let mut record = new_record();
        record.status.poll_status = complete_status();
        let h = Harness::new(record);
        h.poller.fail_with_status(404);

        let err = h.reconcile().await.unwrap_err();

        assert!(matches!(err, ReconcileError::Poll(PollError::Status { status: 404 })));
        let status = h.store.status(&h.key);
        assert_eq!(status.last_error, "repository poll failed: server error: 404");
        assert_eq!(status.poll_status, complete_status());
        assert_eq!(h.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn not_modified_returns_previous_state_without_dispatch() {
        let mut record = new_record();
        record.status.poll_status = complete_status();
        record.status.observed_generation = Generation::INITIAL;
        let h = Harness::new(record);
        h.poller.respond(REPO_ID, complete_status(), Polled::not_modified(complete_status()));

        let outcome = h.reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged { requeue_after: Duration::from_secs(300) });
        assert_eq!(h.dispatch_count(), 0);
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn recovery_after_a_failure_clears_the_error() {
        let mut record = new_record();
        record.status.poll_status = complete_status();
        record.status.observed_generation = Generation::INITIAL;
        record.status.last_error = "repository poll failed: server error: 500".to_string();
        let h = Harness::new(record);
        h.poller.respond(REPO_ID, complete_status(), Polled::not_modified(complete_status()));

        h.reconcile().await.unwrap();

        assert!(h.store.status(&h.key).last_error.is_empty());
        assert_eq!(h.store.writes(), 1);
        assert_eq!(h.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_state_for_the_next_cycle() {
        let h = Harness::build(
            new_record(),
            StaticCredentials::default(),
            RecordingDispatcher { fail: true, ..RecordingDispatcher::default() },
        );
        h.poller.respond(REPO_ID, PollStatus::for_ref(REF), Polled::fetched(complete_status(), commit()));

        let err = h.reconcile().await.unwrap_err();

        assert!(matches!(err, ReconcileError::Dispatch(_)));
        let status = h.store.status(&h.key);
        assert_eq!(status.poll_status, PollStatus::default());
        assert!(status.last_error.starts_with("failed to dispatch commit"));
    }

    #[tokio::test]
    async fn unsupported_kind_is_a_configuration_error() {
        let mut record = new_record();
        record.spec.kind = UpstreamKind::Unsupported("bitbucket".to_string());
        let h = Harness::new(record);

        let err = h.reconcile().await.unwrap_err();

        assert!(err.is_configuration_error());
        assert_eq!(h.store.status(&h.key).last_error, "unsupported repository type \"bitbucket\"");
    }

    #[tokio::test]
    async fn moving_the_declared_ref_restarts_polling() {
        let mut record = new_record();
        record.spec.git_ref = "release".to_string();
        record.status.poll_status = complete_status();
        let h = Harness::new(record);
        let release = PollStatus::new("release", "feedface", "W/\"r1\"");
        h.poller.respond(REPO_ID, PollStatus::for_ref("release"), Polled::fetched(release.clone(), commit()));

        let outcome = h.reconcile().await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Changed { dispatched: true, .. }));
        assert_eq!(h.store.status(&h.key).poll_status, release);
    }

    #[tokio::test]
    async fn cancelled_cycles_write_nothing() {
        let h = Harness::new(new_record());
        h.poller.respond(REPO_ID, PollStatus::for_ref(REF), Polled::fetched(complete_status(), commit()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.reconciler.reconcile(&h.key, &cancel).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Cancelled));
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn deleted_records_are_a_silent_no_op() {
        let h = Harness::new(new_record());
        h.store.records.lock().unwrap().clear();

        assert_eq!(h.reconcile().await.unwrap(), ReconcileOutcome::Absent);
        assert!(h.selector.selections.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycles_record_the_deadline_as_last_error() {
        let mut record = new_record();
        record.status.poll_status = complete_status();
        let mut h = Harness::new(record);
        h.reconciler = h.reconciler.clone().with_deadline(Duration::from_secs(1));
        h.poller.stall_for(Duration::from_secs(10));
        h.poller.respond(REPO_ID, complete_status(), Polled::not_modified(complete_status()));

        let err = h.reconcile().await.unwrap_err();

        assert!(matches!(err, ReconcileError::DeadlineExceeded(limit) if limit == Duration::from_secs(1)));
        assert_eq!(err.retry_policy(), RetryPolicy::Retryable { after: None });
        let status = h.store.status(&h.key);
        assert_eq!(status.last_error, "reconcile did not finish within 1s");
        assert_eq!(status.poll_status, complete_status());
        assert_eq!(h.dispatch_count(), 0);
    }
}
