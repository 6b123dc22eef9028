mod support;

use stagewatch_core::{PageRequest, StageState};
use stagewatch_engine::{
    poll_until_superseded, Multicast, OwnerId, PagedStageDetailPoller, PollRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::{advance, stage, ScriptedPages};

const PERIOD: Duration = Duration::from_secs(5);

fn poller(fetcher: &Arc<ScriptedPages>, registry: &PollRegistry) -> PagedStageDetailPoller<String> {
    PagedStageDetailPoller::new(fetcher.clone(), registry.clone(), PERIOD)
}

#[tokio::test(start_paused = true)]
async fn later_claim_takes_over_polling_of_the_same_stage() {
    let registry = PollRegistry::new();
    let first_fetcher = ScriptedPages::new();
    let second_fetcher = ScriptedPages::new();
    let first = poller(&first_fetcher, &registry);
    let second = poller(&second_fetcher, &registry);
    let seven = stage("7", StageState::Running);

    first
        .get_all(&seven, PageRequest::default())
        .await
        .expect("first page");
    advance(5_001).await;
    assert_eq!(first_fetcher.counter.calls(), 2);

    second
        .get_all(&seven, PageRequest::default())
        .await
        .expect("second page");
    // second ticks at t=10.001s and t=15.001s
    advance(14_000).await;

    assert_eq!(first_fetcher.counter.calls(), 2, "superseded poller stops fetching");
    assert_eq!(second_fetcher.counter.calls(), 3);
    assert!(!first.is_polling());
    assert!(second.is_polling());
    assert_eq!(registry.owner_of("stage-7"), Some(second.owner().clone()));

    let replayed = first
        .resource()
        .try_recv()
        .expect("superseded poller still replays");
    assert_eq!(replayed.elements, vec!["7:0:2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn fetch_errors_raise_flag_without_stopping_the_poll() {
    let registry = PollRegistry::new();
    let fetcher = ScriptedPages::failing_on(vec![false, true, true]);
    let poller = poller(&fetcher, &registry);
    let mut has_error = poller.has_error();
    let seven = stage("7", StageState::Running);

    poller
        .get_all(&seven, PageRequest::default())
        .await
        .expect("first page");
    advance(15_001).await;

    assert_eq!(fetcher.counter.calls(), 4);
    assert!(poller.is_polling());
    assert_eq!(has_error.try_recv(), Some(false));
    assert_eq!(has_error.try_recv(), Some(true));
    assert_eq!(has_error.try_recv(), Some(false));
    assert_eq!(has_error.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn manual_request_becomes_the_polling_baseline() {
    let registry = PollRegistry::new();
    let fetcher = ScriptedPages::new();
    let poller = poller(&fetcher, &registry);
    let seven = stage("7", StageState::Running);

    poller
        .get_all(&seven, PageRequest::new(2, 10))
        .await
        .expect("page 2");
    advance(5_001).await;
    poller
        .get_all(&seven, PageRequest::new(3, 10))
        .await
        .expect("page 3");
    advance(5_001).await;

    let pages: Vec<u32> = fetcher
        .requests()
        .iter()
        .map(|(_, request)| request.page)
        .collect();
    assert_eq!(pages, vec![2, 2, 3, 3]);
    assert_eq!(
        poller.latest_page().map(|page| page.pagination.page),
        Some(3)
    );
}

#[tokio::test(start_paused = true)]
async fn loading_flag_only_covers_first_fetch_of_a_binding() {
    let registry = PollRegistry::new();
    let fetcher = ScriptedPages::new();
    let poller = poller(&fetcher, &registry);
    let mut loading = poller.is_loading();

    poller
        .get_all(&stage("7", StageState::Running), PageRequest::default())
        .await
        .expect("stage 7");
    advance(10_001).await;
    assert_eq!(fetcher.counter.calls(), 3);
    assert_eq!(loading.try_recv(), Some(false));
    assert_eq!(loading.try_recv(), Some(true));
    assert_eq!(loading.try_recv(), Some(false));
    assert_eq!(loading.try_recv(), None);

    poller
        .get_all(&stage("8", StageState::Running), PageRequest::default())
        .await
        .expect("stage 8");
    assert_eq!(loading.try_recv(), Some(true));
    assert_eq!(loading.try_recv(), Some(false));
    assert_eq!(registry.owner_of("stage-7"), None);
    assert_eq!(registry.owner_of("stage-8"), Some(poller.owner().clone()));
}

#[tokio::test(start_paused = true)]
async fn terminal_stage_stops_polling_and_releases_claim() {
    let registry = PollRegistry::new();
    let fetcher = ScriptedPages::new();
    let poller = poller(&fetcher, &registry);
    let feed = Multicast::new();
    poller.follow_stage(feed.subscribe());

    poller
        .get_all(&stage("7", StageState::Running), PageRequest::default())
        .await
        .expect("first page");
    feed.publish(stage("7", StageState::Running));
    advance(5_001).await;
    assert_eq!(fetcher.counter.calls(), 2);

    feed.publish(stage("7", StageState::Finished));
    advance(30_000).await;
    assert_eq!(fetcher.counter.calls(), 2);
    assert_eq!(registry.owner_of("stage-7"), None);
    assert!(!poller.is_polling());
    assert!(poller.latest_page().is_some());
}

#[tokio::test(start_paused = true)]
async fn dropping_a_poller_releases_its_claim() {
    let registry = PollRegistry::new();
    let fetcher = ScriptedPages::new();
    let poller = poller(&fetcher, &registry);
    poller
        .get_all(&stage("7", StageState::Running), PageRequest::default())
        .await
        .expect("first page");
    assert_eq!(registry.entries().len(), 1);

    drop(poller);
    assert!(registry.entries().is_empty());
    advance(30_000).await;
    assert_eq!(fetcher.counter.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_primitive_ticks_until_another_owner_claims() {
    let registry = PollRegistry::new();
    let first = OwnerId::new("first");
    registry.claim("stage-3", &first);
    let ticks = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(poll_until_superseded(
        registry.clone(),
        "stage-3".to_string(),
        first,
        PERIOD,
        {
            let ticks = ticks.clone();
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                async {}
            }
        },
    ));
    advance(10_001).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);

    registry.claim("stage-3", &OwnerId::new("second"));
    task.await.expect("poll task ends once superseded");
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}
