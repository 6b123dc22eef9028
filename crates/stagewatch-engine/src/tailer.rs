use crate::multicast::{Multicast, Subscription};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use stagewatch_core::{
    LogCursor, OutputFamily, OutputFetcher, OutputSource, Stage, StageState, LOGGING_ERROR_MARKER,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tails the text output of one stage with a monotonic row cursor.
///
/// A driver task follows the stage's state: nothing happens while QUEUED, a self-paced poll runs
/// while RUNNING (the period counts from the end of each fetch), and a terminal state either
/// performs one final fetch (when nothing was read yet) or re-emits the buffer. Failed fetches
/// append [`LOGGING_ERROR_MARKER`] and the loop carries on.
///
/// Each binding owns a fetch gate. Polls and refreshes that find it held are dropped, while the
/// terminal step waits for it, so the final fetch is never lost to a fetch still in flight.
pub struct IncrementalLogTailer {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn OutputFetcher>,
    period: Duration,
    state: Mutex<TailState>,
}

struct TailState {
    request_id: Option<String>,
    generation: u64,
    cursor: LogCursor,
    source: Option<OutputSource>,
    output: Multicast<String>,
    driver: Option<JoinHandle<()>>,
    /// Held for the duration of one fetch of the current binding.
    gate: Arc<AsyncMutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    OnChange,
    Always,
}

impl IncrementalLogTailer {
    pub fn new(fetcher: Arc<dyn OutputFetcher>, period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                period,
                state: Mutex::new(TailState {
                    request_id: None,
                    generation: 0,
                    cursor: LogCursor::new(),
                    source: None,
                    output: Multicast::new(),
                    driver: None,
                    gate: Arc::new(AsyncMutex::new(())),
                }),
            }),
        }
    }

    /// Returns a stream of the accumulated output of the stage described by `stages`.
    ///
    /// Binding to a different request resets the buffer and cursor and cancels the previous
    /// driver first. Calling again for the request already being tailed joins the running driver
    /// and drops `stages`.
    pub fn tail<S>(&self, stages: S, request_id: impl Into<String>) -> Subscription<String>
    where
        S: Stream<Item = Stage> + Send + 'static,
    {
        let request_id = request_id.into();
        let mut state = self.inner.lock_state();

        if state.request_id.as_deref() == Some(request_id.as_str()) {
            let live = state
                .driver
                .as_ref()
                .map(|driver| !driver.is_finished())
                .unwrap_or(false);
            if live {
                debug!(event = "tail_joined", request_id = %request_id);
                return state.output.subscribe();
            }
        } else {
            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
            if let Some(previous) = state.request_id.take() {
                info!(event = "tail_rebind", from = %previous, to = %request_id);
            }
            state.output.close();
            state.output = Multicast::new();
            state.cursor.reset();
            state.source = None;
            state.gate = Arc::new(AsyncMutex::new(()));
            state.generation += 1;
            state.request_id = Some(request_id.clone());
        }

        let subscription = state.output.subscribe();
        let generation = state.generation;
        info!(event = "tail_start", request_id = %request_id, generation = generation);
        state.driver = Some(tokio::spawn(drive(
            self.inner.clone(),
            stages.boxed(),
            generation,
        )));
        subscription
    }

    /// Fetches immediately. Returns false when nothing is bound or a fetch is already in flight.
    pub async fn refresh(&self) -> bool {
        let (generation, source) = {
            let state = self.inner.lock_state();
            (state.generation, state.source)
        };
        match source {
            Some(OutputSource::Supported(family)) => self.inner.try_fetch(generation, family).await,
            _ => false,
        }
    }

    pub fn content(&self) -> String {
        self.inner.lock_state().cursor.content().to_string()
    }

    pub fn rows(&self) -> u64 {
        self.inner.lock_state().cursor.rows()
    }

    pub fn request_id(&self) -> Option<String> {
        self.inner.lock_state().request_id.clone()
    }

    /// True while a driver is following the bound stage.
    pub fn is_active(&self) -> bool {
        self.inner
            .lock_state()
            .driver
            .as_ref()
            .map(|driver| !driver.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for IncrementalLogTailer {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        state.output.close();
    }
}

async fn drive(inner: Arc<Inner>, mut stages: BoxStream<'static, Stage>, generation: u64) {
    let Some(output) = inner.output_for(generation) else {
        return;
    };
    let mut last_state: Option<StageState> = None;
    let mut family: Option<OutputFamily> = None;
    let mut next_poll: Option<Instant> = None;

    loop {
        tokio::select! {
            item = stages.next() => {
                let Some(stage) = item else {
                    break;
                };
                if last_state == Some(stage.state) {
                    continue;
                }
                last_state = Some(stage.state);

                let resolved = match family {
                    Some(resolved) => resolved,
                    None => match inner.resolve_source(generation, &stage) {
                        Some(resolved) => {
                            family = Some(resolved);
                            resolved
                        }
                        None => break,
                    },
                };

                match stage.state {
                    StageState::Queued => next_poll = None,
                    StageState::Running => {
                        if next_poll.is_none() {
                            next_poll = Some(Instant::now());
                        }
                    }
                    StageState::Finished | StageState::Failed => {
                        inner.finish(generation, resolved).await;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(next_poll.unwrap_or_else(Instant::now)), if next_poll.is_some() => {
                if let Some(resolved) = family {
                    inner.try_fetch(generation, resolved).await;
                }
                next_poll = Some(Instant::now() + inner.period);
            }
            _ = output.idle() => {
                debug!(event = "tail_idle", generation = generation);
                break;
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, TailState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn output_for(&self, generation: u64) -> Option<Multicast<String>> {
        let state = self.lock_state();
        (state.generation == generation).then(|| state.output.clone())
    }

    /// Resolves the output family for `stage`, publishing the fallback text when there is none.
    fn resolve_source(&self, generation: u64, stage: &Stage) -> Option<OutputFamily> {
        let mut state = self.lock_state();
        if state.generation != generation {
            return None;
        }
        let source = OutputFamily::resolve(stage.stage_type);
        state.source = Some(source);
        match source {
            OutputSource::Supported(family) => Some(family),
            OutputSource::Unsupported(stage_type) => {
                debug!(
                    event = "tail_unsupported_stage",
                    stage_id = %stage.id,
                    stage_type = %stage_type
                );
                state
                    .output
                    .publish(OutputSource::fallback_text(stage_type));
                None
            }
        }
    }

    fn gate_for(&self, generation: u64) -> Option<Arc<AsyncMutex<()>>> {
        let state = self.lock_state();
        (state.generation == generation).then(|| state.gate.clone())
    }

    /// Waits for any fetch of this binding to settle, then fetches once if nothing was read yet
    /// or re-emits the buffer.
    async fn finish(&self, generation: u64, family: OutputFamily) {
        let Some(gate) = self.gate_for(generation) else {
            return;
        };
        let _flight = gate.lock().await;
        let fetched = {
            let state = self.lock_state();
            if state.generation != generation {
                return;
            }
            state.cursor.has_fetched_rows()
        };
        if !fetched {
            self.fetch_and_append(generation, family, Emit::Always).await;
            return;
        }
        let state = self.lock_state();
        if state.generation == generation {
            state.output.publish(state.cursor.content().to_string());
        }
    }

    /// Fetches unless a fetch of this binding is already in flight. Returns whether one was issued.
    async fn try_fetch(&self, generation: u64, family: OutputFamily) -> bool {
        let Some(gate) = self.gate_for(generation) else {
            return false;
        };
        let Ok(_flight) = gate.try_lock() else {
            debug!(event = "tail_fetch_dropped", generation = generation);
            return false;
        };
        self.fetch_and_append(generation, family, Emit::OnChange).await
    }

    /// Callers hold the binding's gate.
    async fn fetch_and_append(&self, generation: u64, family: OutputFamily, emit: Emit) -> bool {
        let (request_id, from_row) = {
            let state = self.lock_state();
            if state.generation != generation {
                return false;
            }
            let Some(request_id) = state.request_id.clone() else {
                return false;
            };
            (request_id, state.cursor.rows())
        };
        let result = self
            .fetcher
            .fetch_output(family, &request_id, from_row)
            .await;

        let mut state = self.lock_state();
        if state.generation != generation {
            debug!(event = "tail_stale_response", request_id = %request_id);
            return true;
        }
        let changed = match result {
            Ok(chunk) => state.cursor.append(chunk),
            Err(err) => {
                warn!(
                    event = "tail_fetch_error",
                    request_id = %request_id,
                    family = %family,
                    from_row = from_row,
                    error = %err
                );
                state.cursor.append_marker(LOGGING_ERROR_MARKER);
                true
            }
        };
        if changed || emit == Emit::Always {
            state.output.publish(state.cursor.content().to_string());
        }
        true
    }
}
