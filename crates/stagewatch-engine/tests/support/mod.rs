#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use stagewatch_core::{
    FetchError, LogChunk, OutputFamily, OutputFetcher, Page, PageFetcher, PageRequest, Pagination,
    Request, Stage, StageFetcher, StageState, StageType,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ts(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_708_995_600_000 + offset_ms)
        .single()
        .expect("valid timestamp")
}

pub fn request(id: &str) -> Request {
    Request::new(id, ts(0))
}

pub fn stage(id: &str, state: StageState) -> Stage {
    Stage::new(id, StageType::InfraProvisioning, state)
}

/// Advances paused time, letting every task due in between run.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Counts fetches and the peak number of fetches outstanding at once.
#[derive(Default)]
pub struct CallCounter {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

pub struct CounterGuard<'a> {
    counter: &'a CallCounter,
}

impl CallCounter {
    pub fn enter(&self) -> CounterGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        CounterGuard { counter: self }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.counter.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replies with each scripted snapshot in turn, then repeats the last one.
pub struct ScriptedStages {
    replies: Mutex<VecDeque<Result<Vec<Stage>, FetchError>>>,
    last: Mutex<Option<Result<Vec<Stage>, FetchError>>>,
    latency: Duration,
    seen: Mutex<Vec<String>>,
    pub counter: CallCounter,
}

impl ScriptedStages {
    pub fn new(replies: Vec<Result<Vec<Stage>, FetchError>>) -> Arc<Self> {
        Self::with_latency(replies, Duration::ZERO)
    }

    pub fn with_latency(
        replies: Vec<Result<Vec<Stage>, FetchError>>,
        latency: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            latency,
            seen: Mutex::new(Vec::new()),
            counter: CallCounter::default(),
        })
    }

    pub fn requested_ids(&self) -> Vec<String> {
        self.seen.lock().expect("seen lock").clone()
    }

    fn next_reply(&self) -> Result<Vec<Stage>, FetchError> {
        let mut last = self.last.lock().expect("last lock");
        if let Some(reply) = self.replies.lock().expect("replies lock").pop_front() {
            *last = Some(reply);
        }
        last.clone().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl StageFetcher for ScriptedStages {
    async fn fetch_stages(&self, request_id: &str) -> Result<Vec<Stage>, FetchError> {
        let _guard = self.counter.enter();
        self.seen
            .lock()
            .expect("seen lock")
            .push(request_id.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.next_reply()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCall {
    pub family: OutputFamily,
    pub request_id: String,
    pub from_row: u64,
}

/// Replies with each scripted chunk in turn; once exhausted, reports no new rows.
pub struct ScriptedOutput {
    replies: Mutex<VecDeque<Result<LogChunk, FetchError>>>,
    latency: Duration,
    calls: Mutex<Vec<OutputCall>>,
    pub counter: CallCounter,
}

impl ScriptedOutput {
    pub fn new(replies: Vec<Result<LogChunk, FetchError>>) -> Arc<Self> {
        Self::with_latency(replies, Duration::ZERO)
    }

    pub fn with_latency(replies: Vec<Result<LogChunk, FetchError>>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            latency,
            calls: Mutex::new(Vec::new()),
            counter: CallCounter::default(),
        })
    }

    pub fn calls(&self) -> Vec<OutputCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl OutputFetcher for ScriptedOutput {
    async fn fetch_output(
        &self,
        family: OutputFamily,
        request_id: &str,
        from_row: u64,
    ) -> Result<LogChunk, FetchError> {
        let _guard = self.counter.enter();
        self.calls.lock().expect("calls lock").push(OutputCall {
            family,
            request_id: request_id.to_string(),
            from_row,
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let reply = self.replies.lock().expect("replies lock").pop_front();
        reply.unwrap_or_else(|| Ok(LogChunk::new("", from_row)))
    }
}

/// Detail records served by [`ScriptedPages`]: `"<stage id>:<page>:<call number>"`.
pub struct ScriptedPages {
    failing: Mutex<VecDeque<bool>>,
    requests: Mutex<Vec<(String, PageRequest)>>,
    pub counter: CallCounter,
}

impl ScriptedPages {
    pub fn new() -> Arc<Self> {
        Self::failing_on(Vec::new())
    }

    /// `plan[n]` tells whether call `n` fails; calls past the plan succeed.
    pub fn failing_on(plan: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(plan.into()),
            requests: Mutex::new(Vec::new()),
            counter: CallCounter::default(),
        })
    }

    pub fn requests(&self) -> Vec<(String, PageRequest)> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl PageFetcher<String> for ScriptedPages {
    async fn fetch_page(
        &self,
        stage: &Stage,
        request: &PageRequest,
    ) -> Result<Page<String>, FetchError> {
        let _guard = self.counter.enter();
        let call = self.counter.calls();
        self.requests
            .lock()
            .expect("requests lock")
            .push((stage.id.clone(), request.clone()));
        let fail = self
            .failing
            .lock()
            .expect("failing lock")
            .pop_front()
            .unwrap_or(false);
        if fail {
            return Err(FetchError::Status {
                code: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(Page::new(
            vec![format!("{}:{}:{}", stage.id, request.page, call)],
            Pagination {
                page: request.page,
                size: request.size,
                total_elements: 1,
                total_pages: 1,
            },
        ))
    }
}
