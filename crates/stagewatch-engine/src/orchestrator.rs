use crate::multicast::{FlagGuard, Multicast, Subscription};
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use stagewatch_core::{
    merge_snapshot, synthesize_finished, ErrorClassifier, FailureDisposition, FetchError, Request,
    RequestKind, RequestLifecycle, Stage, StageFetcher,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    PausedOnError,
    Retired,
}

impl PollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollPhase::Idle => "idle",
            PollPhase::Polling => "polling",
            PollPhase::PausedOnError => "paused_on_error",
            PollPhase::Retired => "retired",
        }
    }
}

/// Updates of a single stage, projected from an orchestrator's snapshot stream.
pub type StageFeed = BoxStream<'static, Stage>;

/// Drives periodic re-fetch of every stage of one request until the request is terminal.
///
/// Phases: `Idle -> Polling -> PausedOnError -> Polling ... -> Retired`. A transient failure
/// pauses the schedule until the next manual [`StagePollingOrchestrator::get_all`]; a terminal
/// snapshot is published once and retires the schedule for good. Dropping the handle cancels the
/// schedule and ends every stream.
pub struct StagePollingOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn StageFetcher>,
    classifier: Arc<dyn ErrorClassifier>,
    period: Duration,
    stages: Multicast<Vec<Stage>>,
    has_error: Multicast<bool>,
    is_loading: Multicast<bool>,
    phase: watch::Sender<PollPhase>,
    control: Mutex<Control>,
    fetch_gate: AsyncMutex<()>,
}

#[derive(Default)]
struct Control {
    context: Option<Request>,
    snapshot: Vec<Stage>,
    schedule: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

impl StagePollingOrchestrator {
    pub fn new(
        fetcher: Arc<dyn StageFetcher>,
        classifier: Arc<dyn ErrorClassifier>,
        period: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(PollPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                classifier,
                period,
                stages: Multicast::new(),
                has_error: Multicast::with_latest(false),
                is_loading: Multicast::with_latest(false),
                phase,
                control: Mutex::new(Control::default()),
                fetch_gate: AsyncMutex::new(()),
            }),
        }
    }

    pub fn for_kind(fetcher: Arc<dyn StageFetcher>, kind: RequestKind, period: Duration) -> Self {
        Self::new(fetcher, kind.classifier(), period)
    }

    /// (Re)starts the schedule for `request` from now. Has no effect once retired.
    pub fn start_polling(&self, request: Request) -> PollPhase {
        if self.phase() == PollPhase::Retired {
            debug!(event = "stage_poll_start_ignored", request_id = %request.id);
            return PollPhase::Retired;
        }
        let mut control = self.inner.lock_control();
        self.inner.bind(&mut control, request.clone());
        if let Some(schedule) = control.schedule.take() {
            schedule.abort();
        }
        self.inner.phase.send_replace(PollPhase::Polling);
        control.schedule = Some(tokio::spawn(run_schedule(self.inner.clone())));
        info!(
            event = "stage_poll_start",
            request_id = %request.id,
            period_ms = self.inner.period.as_millis() as u64
        );
        PollPhase::Polling
    }

    /// One-shot fetch of every stage of `request`. Resumes a schedule paused on error.
    pub async fn get_all(&self, request: &Request) -> Result<Vec<Stage>, FetchError> {
        {
            let mut control = self.inner.lock_control();
            self.inner.bind(&mut control, request.clone());
        }
        let resumed = self.inner.phase.send_if_modified(|phase| {
            if *phase == PollPhase::PausedOnError {
                *phase = PollPhase::Polling;
                true
            } else {
                false
            }
        });
        if resumed {
            info!(event = "stage_poll_resumed", request_id = %request.id);
        }
        self.inner.fetch_and_apply(request, Trigger::Manual).await
    }

    /// Cancels the schedule; streams stay open and a later `start_polling` arms it again.
    pub fn stop(&self) {
        let mut control = self.inner.lock_control();
        if let Some(schedule) = control.schedule.take() {
            schedule.abort();
        }
        self.inner.phase.send_if_modified(|phase| {
            if *phase == PollPhase::Retired || *phase == PollPhase::Idle {
                return false;
            }
            *phase = PollPhase::Idle;
            true
        });
    }

    pub fn stages(&self) -> Subscription<Vec<Stage>> {
        self.inner.stages.subscribe()
    }

    pub fn has_error(&self) -> Subscription<bool> {
        self.inner.has_error.subscribe()
    }

    pub fn is_loading(&self) -> Subscription<bool> {
        self.inner.is_loading.subscribe()
    }

    pub fn latest_stages(&self) -> Option<Vec<Stage>> {
        self.inner.stages.latest()
    }

    pub fn request(&self) -> Option<Request> {
        self.inner.lock_control().context.clone()
    }

    pub fn phase(&self) -> PollPhase {
        *self.inner.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<PollPhase> {
        self.inner.phase.subscribe()
    }

    /// Stream of one stage's updates; ends when the orchestrator retires or is dropped.
    pub fn stage_feed(&self, stage_id: impl Into<String>) -> StageFeed {
        let stage_id = stage_id.into();
        self.stages()
            .filter_map(move |snapshot| {
                let stage = snapshot.into_iter().find(|stage| stage.id == stage_id);
                futures_util::future::ready(stage)
            })
            .boxed()
    }
}

impl Drop for StagePollingOrchestrator {
    fn drop(&mut self) {
        if let Some(schedule) = self.inner.lock_control().schedule.take() {
            schedule.abort();
        }
        self.inner.stages.close();
        self.inner.has_error.close();
        self.inner.is_loading.close();
    }
}

async fn run_schedule(inner: Arc<Inner>) {
    let mut phase = inner.phase.subscribe();
    loop {
        tokio::time::sleep(inner.period).await;

        if *phase.borrow_and_update() == PollPhase::PausedOnError {
            let resumed = phase
                .wait_for(|phase| *phase != PollPhase::PausedOnError)
                .await
                .map(|phase| *phase == PollPhase::Polling)
                .unwrap_or(false);
            if !resumed {
                return;
            }
            continue;
        }
        if *phase.borrow() != PollPhase::Polling {
            return;
        }

        let Some(request) = inner.lock_control().context.clone() else {
            return;
        };
        let _ = inner.fetch_and_apply(&request, Trigger::Scheduled).await;
    }
}

impl Inner {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, control: &mut Control, request: Request) {
        let switched = control
            .context
            .as_ref()
            .map(|current| current.id != request.id)
            .unwrap_or(false);
        if switched {
            info!(event = "stage_poll_rebind", request_id = %request.id);
            control.snapshot.clear();
            self.stages.clear_latest();
        }
        control.context = Some(request);
    }

    fn is_current(&self, request: &Request) -> bool {
        self.lock_control()
            .context
            .as_ref()
            .map(|current| current.id == request.id)
            .unwrap_or(false)
    }

    fn phase(&self) -> PollPhase {
        *self.phase.borrow()
    }

    async fn fetch_and_apply(
        &self,
        request: &Request,
        trigger: Trigger,
    ) -> Result<Vec<Stage>, FetchError> {
        let _gate = self.fetch_gate.lock().await;
        let result = {
            let _loading = FlagGuard::raise(&self.is_loading);
            self.fetcher.fetch_stages(&request.id).await
        };

        if !self.is_current(request) {
            debug!(event = "stage_poll_stale_response", request_id = %request.id);
            return result;
        }
        if self.phase() == PollPhase::Retired {
            return result;
        }

        match result {
            Ok(fetched) => {
                let merged = {
                    let mut control = self.lock_control();
                    let merged = merge_snapshot(&control.snapshot, fetched);
                    control.snapshot = merged.stages.clone();
                    merged
                };
                for stage_id in &merged.regressed {
                    warn!(
                        event = "stage_regression_ignored",
                        request_id = %request.id,
                        stage_id = %stage_id
                    );
                }
                self.has_error.publish_if_changed(false);
                let lifecycle = RequestLifecycle::of(&merged.stages);
                self.stages.publish(merged.stages.clone());
                debug!(
                    event = "stage_poll_snapshot",
                    request_id = %request.id,
                    trigger = trigger.as_str(),
                    lifecycle = lifecycle.as_str(),
                    stages = merged.stages.len()
                );
                if lifecycle.is_terminal() {
                    self.retire(request, lifecycle.as_str());
                }
                Ok(merged.stages)
            }
            Err(err) => match self.classifier.classify(&err) {
                FailureDisposition::CompletedByAbsence => {
                    let snapshot = {
                        let mut control = self.lock_control();
                        control.snapshot = synthesize_finished(&control.snapshot, Utc::now());
                        control.snapshot.clone()
                    };
                    self.has_error.publish_if_changed(false);
                    self.stages.publish(snapshot.clone());
                    self.retire(request, "completed_by_absence");
                    Ok(snapshot)
                }
                FailureDisposition::Transient => {
                    self.has_error.publish_if_changed(true);
                    let paused = self.phase.send_if_modified(|phase| {
                        if *phase == PollPhase::Polling {
                            *phase = PollPhase::PausedOnError;
                            true
                        } else {
                            false
                        }
                    });
                    warn!(
                        event = "stage_poll_error",
                        request_id = %request.id,
                        trigger = trigger.as_str(),
                        paused = paused,
                        error = %err
                    );
                    Err(err)
                }
            },
        }
    }

    fn retire(&self, request: &Request, outcome: &str) {
        self.phase.send_replace(PollPhase::Retired);
        if let Some(schedule) = self.lock_control().schedule.take() {
            schedule.abort();
        }
        self.stages.close();
        info!(event = "stage_poll_retired", request_id = %request.id, outcome = outcome);
    }
}
