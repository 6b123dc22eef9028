use crate::multicast::{FlagGuard, Multicast, Subscription};
use crate::registry::{OwnerId, PollRegistry};
use futures_util::stream::{Stream, StreamExt};
use stagewatch_core::{FetchError, Page, PageCursor, PageFetcher, PageRequest, Stage};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Calls `tick` every `period` until `owner` no longer holds `key` in `registry`.
pub async fn poll_until_superseded<F, Fut>(
    registry: PollRegistry,
    key: String,
    owner: OwnerId,
    period: Duration,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = registry.superseded(&key, &owner) => {
                debug!(event = "detail_poll_superseded", key = %key, owner = %owner);
                return;
            }
        }
        if !registry.is_owner(&key, &owner) {
            return;
        }
        tick().await;
    }
}

/// Polls one page of a stage's structured detail records.
///
/// Each poller registers under the stage's poll key; once a newer poller claims the same key the
/// automatic poll stops, while the last page stays replayable. Fetch errors raise `has_error`
/// without interrupting the automatic poll.
pub struct PagedStageDetailPoller<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    fetcher: Arc<dyn PageFetcher<T>>,
    registry: PollRegistry,
    owner: OwnerId,
    period: Duration,
    resource: Multicast<Page<T>>,
    has_error: Multicast<bool>,
    is_loading: Multicast<bool>,
    state: Mutex<DetailState<T>>,
}

struct DetailState<T> {
    stage: Option<Stage>,
    key: Option<String>,
    cursor: PageCursor<T>,
    generation: u64,
    poll: Option<JoinHandle<()>>,
    follower: Option<JoinHandle<()>>,
}

impl<T> PagedStageDetailPoller<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(fetcher: Arc<dyn PageFetcher<T>>, registry: PollRegistry, period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                registry,
                owner: OwnerId::generate(),
                period,
                resource: Multicast::new(),
                has_error: Multicast::with_latest(false),
                is_loading: Multicast::with_latest(false),
                state: Mutex::new(DetailState {
                    stage: None,
                    key: None,
                    cursor: PageCursor::new(),
                    generation: 0,
                    poll: None,
                    follower: None,
                }),
            }),
        }
    }

    /// Fetches `request` for `stage` now and (re)starts the automatic poll from that window.
    pub async fn get_all(&self, stage: &Stage, request: PageRequest) -> Result<Page<T>, FetchError> {
        let generation = self.inner.bind(stage, request.clone());
        self.inner
            .claim_and_schedule(generation, stage.poll_key());
        self.inner
            .fetch(generation, stage.clone(), request)
            .await
    }

    /// Stops the automatic poll once the followed stage is terminal or its feed ends.
    pub fn follow_stage<S>(&self, feed: S)
    where
        S: Stream<Item = Stage> + Send + 'static,
    {
        let inner = self.inner.clone();
        let mut feed = feed.boxed();
        let follower = tokio::spawn(async move {
            let mut reason = "feed_ended";
            while let Some(stage) = feed.next().await {
                if stage.is_terminal() {
                    reason = "stage_terminal";
                    break;
                }
            }
            inner.halt(reason);
        });
        if let Some(previous) = self.inner.lock_state().follower.replace(follower) {
            previous.abort();
        }
    }

    /// Stops the automatic poll and gives up the registry claim.
    pub fn stop(&self) {
        self.inner.halt("stopped");
    }

    pub fn resource(&self) -> Subscription<Page<T>> {
        self.inner.resource.subscribe()
    }

    pub fn has_error(&self) -> Subscription<bool> {
        self.inner.has_error.subscribe()
    }

    pub fn is_loading(&self) -> Subscription<bool> {
        self.inner.is_loading.subscribe()
    }

    pub fn latest_page(&self) -> Option<Page<T>> {
        self.inner.resource.latest()
    }

    pub fn owner(&self) -> &OwnerId {
        &self.inner.owner
    }

    /// True while the automatic poll runs and this poller still owns its key.
    pub fn is_polling(&self) -> bool {
        let state = self.inner.lock_state();
        let running = state
            .poll
            .as_ref()
            .map(|poll| !poll.is_finished())
            .unwrap_or(false);
        let owned = state
            .key
            .as_deref()
            .map(|key| self.inner.registry.is_owner(key, &self.inner.owner))
            .unwrap_or(false);
        running && owned
    }
}

impl<T> Drop for PagedStageDetailPoller<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(follower) = self.inner.lock_state().follower.take() {
            follower.abort();
        }
        self.inner.halt("dropped");
        self.inner.resource.close();
        self.inner.has_error.close();
        self.inner.is_loading.close();
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, DetailState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, stage: &Stage, request: PageRequest) -> u64 {
        let key = stage.poll_key();
        let mut state = self.lock_state();
        if state.key.as_deref() == Some(key.as_str()) {
            state.cursor.rebase(request);
        } else {
            if let Some(previous) = state.key.take() {
                self.registry.release(&previous, &self.owner);
            }
            state.cursor.rebind(request);
            state.generation += 1;
            state.key = Some(key);
        }
        state.stage = Some(stage.clone());
        state.generation
    }

    fn claim_and_schedule(self: &Arc<Self>, generation: u64, key: String) {
        self.registry.claim(key.clone(), &self.owner);
        let inner = self.clone();
        let poll = tokio::spawn(poll_until_superseded(
            self.registry.clone(),
            key.clone(),
            self.owner.clone(),
            self.period,
            move || {
                let inner = inner.clone();
                async move {
                    inner.scheduled_fetch(generation).await;
                }
            },
        ));
        if let Some(previous) = self.lock_state().poll.replace(poll) {
            previous.abort();
        }
        info!(event = "detail_poll_start", key = %key, owner = %self.owner);
    }

    async fn scheduled_fetch(&self, generation: u64) {
        let target = {
            let state = self.lock_state();
            if state.generation != generation {
                return;
            }
            state
                .stage
                .clone()
                .map(|stage| (stage, state.cursor.request().clone()))
        };
        if let Some((stage, request)) = target {
            let _ = self.fetch(generation, stage, request).await;
        }
    }

    async fn fetch(
        &self,
        generation: u64,
        stage: Stage,
        request: PageRequest,
    ) -> Result<Page<T>, FetchError> {
        let first = self.lock_state().cursor.is_first_fetch();
        let result = {
            let _loading = first.then(|| FlagGuard::raise(&self.is_loading));
            self.fetcher.fetch_page(&stage, &request).await
        };

        let mut state = self.lock_state();
        if state.generation != generation {
            debug!(event = "detail_stale_response", stage_id = %stage.id);
            return result;
        }
        match &result {
            Ok(page) => {
                state.cursor.record(page.clone());
                self.has_error.publish_if_changed(false);
                self.resource.publish(page.clone());
            }
            Err(err) => {
                state.cursor.record_failure();
                self.has_error.publish_if_changed(true);
                warn!(
                    event = "detail_fetch_error",
                    stage_id = %stage.id,
                    page = request.page,
                    error = %err
                );
            }
        }
        result
    }

    fn halt(&self, reason: &str) {
        let mut state = self.lock_state();
        if let Some(poll) = state.poll.take() {
            poll.abort();
        }
        if let Some(key) = state.key.as_deref() {
            if self.registry.release(key, &self.owner) {
                info!(event = "detail_poll_stop", key = %key, owner = %self.owner, reason = reason);
            }
        }
    }
}
