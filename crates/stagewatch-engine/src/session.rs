use crate::config::PollingConfig;
use crate::detail::PagedStageDetailPoller;
use crate::orchestrator::StagePollingOrchestrator;
use crate::multicast::Subscription;
use crate::registry::PollRegistry;
use crate::tailer::IncrementalLogTailer;
use futures_util::Stream;
use stagewatch_core::{OutputFetcher, PageFetcher, RequestKind, Stage, StageFetcher};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Builds the polling components of one viewing session around a shared [`PollRegistry`].
///
/// Output tails started through [`ViewingSession::tail_stage`] are shared: every consumer of the
/// same stage of the same request reads from one tailer.
#[derive(Clone)]
pub struct ViewingSession {
    config: PollingConfig,
    stage_fetcher: Arc<dyn StageFetcher>,
    output_fetcher: Arc<dyn OutputFetcher>,
    registry: PollRegistry,
    tails: Arc<Mutex<HashMap<String, Arc<IncrementalLogTailer>>>>,
}

impl ViewingSession {
    pub fn new(
        config: PollingConfig,
        stage_fetcher: Arc<dyn StageFetcher>,
        output_fetcher: Arc<dyn OutputFetcher>,
    ) -> Self {
        Self {
            config,
            stage_fetcher,
            output_fetcher,
            registry: PollRegistry::new(),
            tails: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn registry(&self) -> &PollRegistry {
        &self.registry
    }

    pub fn orchestrator(&self, kind: RequestKind) -> StagePollingOrchestrator {
        StagePollingOrchestrator::for_kind(
            self.stage_fetcher.clone(),
            kind,
            self.config.stage_period,
        )
    }

    /// A private tailer. Use [`ViewingSession::tail_stage`] to share one across consumers.
    pub fn tailer(&self) -> IncrementalLogTailer {
        IncrementalLogTailer::new(self.output_fetcher.clone(), self.config.output_period)
    }

    /// Subscribes to the output of `stage_id` in `request_id`, joining the running tail when
    /// another consumer already started one. `stages` is dropped in that case.
    pub fn tail_stage<S>(&self, request_id: &str, stage_id: &str, stages: S) -> Subscription<String>
    where
        S: Stream<Item = Stage> + Send + 'static,
    {
        let key = tail_key(request_id, stage_id);
        let tailer = {
            let mut tails = self.lock_tails();
            tails.retain(|existing, tailer| existing == &key || tailer.is_active());
            tails
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(event = "session_tail_created", key = %key);
                    Arc::new(self.tailer())
                })
                .clone()
        };
        tailer.tail(stages, request_id)
    }

    /// Number of tails currently kept by the session.
    pub fn tail_count(&self) -> usize {
        self.lock_tails().len()
    }

    fn lock_tails(&self) -> MutexGuard<'_, HashMap<String, Arc<IncrementalLogTailer>>> {
        self.tails
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn detail_poller<T>(&self, fetcher: Arc<dyn PageFetcher<T>>) -> PagedStageDetailPoller<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        PagedStageDetailPoller::new(fetcher, self.registry.clone(), self.config.detail_period)
    }
}

fn tail_key(request_id: &str, stage_id: &str) -> String {
    format!("{request_id}/stage-{stage_id}")
}
