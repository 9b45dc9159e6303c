// Integration tests for the fleet synchronization engine
use async_trait::async_trait;
use chrono::Utc;
use fleetview::vm::{ActionRequest, DetailSlot, VmState};
use fleetview::{
    ActionKind, FleetApi, FleetEngine, FleetError, Notification, Result, SelectionState,
    SortDirection, SortKey, SortOrder, StorePhase, VmDetail, VmSummary,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};

enum Scripted {
    Fleet(Vec<VmSummary>),
    Fail(u16),
}

#[derive(Default)]
struct MockApi {
    script: Mutex<VecDeque<Scripted>>,
    list_gate: Option<Arc<Semaphore>>,
    list_calls: AtomicUsize,
    details: Mutex<HashMap<String, VmDetail>>,
    detail_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    detail_calls: Mutex<Vec<String>>,
    action_gate: Option<Arc<Semaphore>>,
    action_failure: Option<u16>,
    actions: Mutex<Vec<ActionRequest>>,
}

impl MockApi {
    fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    fn add_detail(&self, detail: VmDetail) {
        self.details
            .lock()
            .unwrap()
            .insert(detail.summary.id.clone(), detail);
    }

    fn gate_detail(&self, vm_id: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.detail_gates
            .lock()
            .unwrap()
            .insert(vm_id.to_string(), gate.clone());
        gate
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn detail_calls(&self) -> Vec<String> {
        self.detail_calls.lock().unwrap().clone()
    }

    fn actions(&self) -> Vec<ActionRequest> {
        self.actions.lock().unwrap().clone()
    }
}

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

#[async_trait]
impl FleetApi for MockApi {
    async fn list_summaries(&self) -> Result<Vec<VmSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.list_gate).await;
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Fleet(summaries)) => Ok(summaries),
            Some(Scripted::Fail(status)) => Err(FleetError::Remote {
                status,
                message: "unavailable".to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_detail(&self, vm_id: &str) -> Result<VmDetail> {
        self.detail_calls.lock().unwrap().push(vm_id.to_string());
        let gate = self.detail_gates.lock().unwrap().get(vm_id).cloned();
        pass(&gate).await;
        self.details
            .lock()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| FleetError::Remote {
                status: 404,
                message: format!("VM {} not found", vm_id),
            })
    }

    async fn submit_action(&self, request: &ActionRequest) -> Result<()> {
        self.actions.lock().unwrap().push(request.clone());
        pass(&self.action_gate).await;
        match self.action_failure {
            Some(status) => Err(FleetError::Remote {
                status,
                message: "action rejected".to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn vm(id: &str, name: &str, state: VmState) -> VmSummary {
    VmSummary {
        id: id.to_string(),
        name: name.to_string(),
        state,
        cpu_allocation: 2,
        memory_mb: 1024,
        observed_at: Utc::now(),
    }
}

fn detail_for(summary: VmSummary) -> VmDetail {
    VmDetail {
        summary,
        disks: Vec::new(),
        interfaces: Vec::new(),
        metadata: BTreeMap::new(),
    }
}

fn engine_with(api: &Arc<MockApi>) -> Arc<FleetEngine> {
    Arc::new(FleetEngine::new(
        api.clone(),
        SortOrder::default(),
        Duration::from_secs(3600),
    ))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}

#[tokio::test]
async fn vanished_vm_empties_fleet_and_clears_selection() {
    let api = Arc::new(MockApi::default());
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::Running)]));
    api.push(Scripted::Fleet(Vec::new()));
    api.add_detail(detail_for(vm("1", "a", VmState::Running)));
    let engine = engine_with(&api);
    let mut rx = engine.subscribe();

    engine.scheduler().tick().unwrap().settled().await;
    engine.select_vm("1").await;
    assert_eq!(engine.selection().selected_id(), Some("1"));

    engine.scheduler().tick().unwrap().settled().await;

    assert!(engine.summaries().is_empty());
    assert_eq!(engine.selection(), SelectionState::None);
    assert!(
        drain(&mut rx).contains(&Notification::SelectionCleared {
            vm_id: "1".to_string()
        })
    );
}

#[tokio::test]
async fn dispatch_submits_once_and_forces_a_resync() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        action_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::ShutOff)]));
    let engine = engine_with(&api);
    let mut rx = engine.subscribe();

    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.dispatch_action("1", ActionKind::Stop).await }
    });

    wait_until(|| api.actions().len() == 1).await;
    assert!(engine.action_in_flight());
    assert_eq!(api.list_calls(), 0);

    gate.add_permits(1);
    task.await.unwrap().unwrap();

    assert!(!engine.action_in_flight());
    wait_until(|| engine.store().applied_sequence() == 1).await;
    assert_eq!(api.list_calls(), 1);

    let actions = api.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].vm_id, "1");
    assert_eq!(actions[0].kind, ActionKind::Stop);
    assert!(drain(&mut rx).contains(&Notification::ActionSucceeded {
        vm_id: "1".to_string(),
        kind: ActionKind::Stop,
    }));
}

#[tokio::test]
async fn second_dispatch_is_refused_while_first_is_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        action_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let engine = engine_with(&api);

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.dispatch_action("1", ActionKind::Restart).await }
    });
    wait_until(|| api.actions().len() == 1).await;

    let refused = engine.dispatch_action("2", ActionKind::Start).await;
    assert!(matches!(refused, Err(FleetError::ActionInFlight { .. })));
    assert_eq!(api.actions().len(), 1);

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    assert_eq!(api.actions().len(), 1);
    assert!(!engine.action_in_flight());
}

#[tokio::test]
async fn failed_action_clears_flag_and_is_reported() {
    let api = Arc::new(MockApi {
        action_failure: Some(409),
        ..MockApi::default()
    });
    let engine = engine_with(&api);
    let mut rx = engine.subscribe();

    let err = engine
        .dispatch_action("1", ActionKind::Start)
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Remote { status: 409, .. }));
    assert!(!engine.action_in_flight());
    wait_until(|| api.list_calls() == 1).await;
    assert!(
        drain(&mut rx)
            .iter()
            .any(|n| matches!(n, Notification::ActionFailed { kind: ActionKind::Start, .. }))
    );
}

#[tokio::test]
async fn abandoned_selection_result_is_discarded() {
    let api = Arc::new(MockApi::default());
    api.add_detail(detail_for(vm("2", "b", VmState::Running)));
    api.add_detail(detail_for(vm("3", "c", VmState::Paused)));
    let gate = api.gate_detail("2");
    let engine = engine_with(&api);
    let mut rx = engine.subscribe();

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.select_vm("2").await }
    });
    wait_until(|| api.detail_calls() == vec!["2".to_string()]).await;
    assert!(engine.selection().is_pending());

    engine.select_vm("3").await;
    gate.add_permits(1);
    first.await.unwrap();

    let selection = engine.selection();
    assert_eq!(selection.selected_id(), Some("3"));
    assert_eq!(selection.detail().unwrap().summary.state, VmState::Paused);
    assert!(drain(&mut rx).iter().all(|n| !n.is_failure()));
}

#[tokio::test]
async fn failed_detail_fetch_marks_selection_failed() {
    let api = Arc::new(MockApi::default());
    let engine = engine_with(&api);
    let mut rx = engine.subscribe();

    engine.select_vm("missing").await;

    match engine.selection() {
        SelectionState::Selected {
            id,
            detail: DetailSlot::Failed(reason),
        } => {
            assert_eq!(id, "missing");
            assert!(reason.contains("404"));
        }
        other => panic!("unexpected selection: {:?}", other),
    }
    assert!(
        drain(&mut rx)
            .iter()
            .any(|n| matches!(n, Notification::DetailFailed { vm_id, .. } if vm_id == "missing"))
    );
}

#[tokio::test]
async fn ticks_never_overlap() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        list_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let engine = engine_with(&api);
    let scheduler = engine.scheduler();

    let first = scheduler.tick().unwrap();
    assert_eq!(first.sequence, 1);
    assert!(scheduler.tick().is_none());
    assert_eq!(scheduler.in_flight(), Some(1));

    wait_until(|| api.list_calls() == 1).await;
    gate.add_permits(1);
    first.settled().await;

    assert_eq!(api.list_calls(), 1);
    gate.add_permits(1);
    let next = scheduler.tick().unwrap();
    assert_eq!(next.sequence, 2);
    next.settled().await;
    assert_eq!(engine.store().applied_sequence(), 2);
}

#[tokio::test]
async fn forced_ticks_during_a_poll_coalesce_into_one() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        list_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let engine = engine_with(&api);
    let scheduler = engine.scheduler();

    let first = scheduler.tick().unwrap();
    assert!(scheduler.force_tick().is_none());
    assert!(scheduler.force_tick().is_none());

    gate.add_permits(1);
    first.settled().await;
    wait_until(|| api.list_calls() == 2).await;

    gate.add_permits(1);
    wait_until(|| engine.store().applied_sequence() == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(api.list_calls(), 2);
}

#[tokio::test]
async fn poll_failure_keeps_last_known_good_state() {
    let api = Arc::new(MockApi::default());
    api.push(Scripted::Fail(503));
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::Running)]));
    api.push(Scripted::Fail(502));
    let engine = engine_with(&api);
    let mut rx = engine.subscribe();

    engine.store().mark_loading();
    engine.scheduler().tick().unwrap().settled().await;
    assert_eq!(engine.phase(), StorePhase::Ready);
    assert!(engine.summaries().is_empty());

    engine.scheduler().tick().unwrap().settled().await;
    engine.scheduler().tick().unwrap().settled().await;

    assert_eq!(engine.summaries().len(), 1);
    let failures: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter_map(|n| match n {
            Notification::PollFailed { sequence, .. } => Some(sequence),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![1, 3]);
}

#[tokio::test]
async fn start_polls_immediately_and_stop_is_terminal() {
    let api = Arc::new(MockApi::default());
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::Running)]));
    let engine = engine_with(&api);
    assert_eq!(engine.phase(), StorePhase::Init);

    engine.start();
    wait_until(|| engine.phase() == StorePhase::Ready).await;
    assert_eq!(api.list_calls(), 1);
    assert_eq!(engine.summaries().len(), 1);

    engine.shutdown();
    assert_eq!(engine.phase(), StorePhase::Stopped);
    assert!(!engine.scheduler().is_running());
    assert!(engine.scheduler().tick().is_none());
    assert!(engine.scheduler().force_tick().is_none());
}

#[tokio::test]
async fn stop_lets_an_in_flight_poll_land() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        list_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::Running)]));
    let engine = engine_with(&api);

    let pending = engine.scheduler().tick().unwrap();
    engine.shutdown();
    gate.add_permits(1);
    pending.settled().await;

    assert_eq!(engine.summaries().len(), 1);
    assert_eq!(engine.phase(), StorePhase::Stopped);
}

#[tokio::test]
async fn sort_toggle_needs_no_network() {
    let api = Arc::new(MockApi::default());
    api.push(Scripted::Fleet(vec![
        vm("a", "a", VmState::Running),
        vm("b", "b", VmState::Running),
        vm("c", "c", VmState::Running),
    ]));
    let engine = engine_with(&api);
    engine.scheduler().tick().unwrap().settled().await;
    let calls = api.list_calls();

    engine.set_sort(SortOrder::new(SortKey::Name, SortDirection::Descending));

    let names: Vec<String> = engine.summaries().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["c", "b", "a"]);
    assert_eq!(api.list_calls(), calls);
}

#[tokio::test]
async fn view_dispatches_against_its_own_vm() {
    let api = Arc::new(MockApi::default());
    api.add_detail(detail_for(vm("7", "g", VmState::ShutOff)));
    let engine = engine_with(&api);

    assert!(engine.current_view().is_none());
    engine.select_vm("7").await;

    let view = engine.current_view().unwrap();
    assert_eq!(view.id(), "7");
    assert!(view.actions_enabled());
    view.dispatch(ActionKind::Start).await.unwrap();

    let actions = api.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].vm_id, "7");
    assert_eq!(actions[0].kind, ActionKind::Start);
}

#[tokio::test]
async fn cancelled_dispatch_releases_the_action_slot() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        action_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let engine = engine_with(&api);

    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        engine.dispatch_action("1", ActionKind::Restart),
    )
    .await;
    assert!(timed_out.is_err());
    assert!(!engine.action_in_flight());

    gate.add_permits(1);
    engine.dispatch_action("2", ActionKind::Start).await.unwrap();
    let actions = api.actions();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[1].vm_id, "2");
}

#[tokio::test]
async fn aborted_dispatch_task_releases_the_action_slot() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        action_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let engine = engine_with(&api);

    let task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.dispatch_action("1", ActionKind::Stop).await }
    });
    wait_until(|| api.actions().len() == 1).await;
    assert!(engine.action_in_flight());

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(!engine.action_in_flight());
}

#[tokio::test(start_paused = true)]
async fn driver_skips_scheduled_ticks_while_a_poll_is_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        list_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let engine = Arc::new(FleetEngine::new(
        api.clone(),
        SortOrder::default(),
        Duration::from_millis(100),
    ));

    engine.start();
    wait_until(|| api.list_calls() == 1).await;

    // Several intervals pass while the first poll is held
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(api.list_calls(), 1);
    assert_eq!(engine.scheduler().in_flight(), Some(1));

    gate.add_permits(1);
    wait_until(|| engine.store().applied_sequence() == 1).await;

    // Cadence resumes once the poll has settled
    gate.add_permits(1);
    wait_until(|| engine.store().applied_sequence() == 2).await;
    assert_eq!(api.list_calls(), 2);

    engine.shutdown();
}

#[tokio::test]
async fn dispatch_and_resync_reports_state_fetched_after_the_action() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockApi {
        list_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::ShutOff)]));
    api.push(Scripted::Fleet(vec![vm("1", "a", VmState::Running)]));
    let engine = engine_with(&api);

    // A poll that started before the action is still outstanding
    let earlier = engine.scheduler().tick().unwrap();
    let task = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .dispatch_and_resync("1", ActionKind::Start, Duration::from_secs(5))
                .await
        }
    });
    wait_until(|| api.actions().len() == 1).await;

    gate.add_permits(2);
    let current = task.await.unwrap().unwrap().unwrap();
    earlier.settled().await;

    assert_eq!(current.state, VmState::Running);
    assert_eq!(engine.store().applied_sequence(), 2);
    assert_eq!(api.list_calls(), 2);
}

#[tokio::test]
async fn dispatch_and_resync_returns_after_a_failed_resync() {
    let api = Arc::new(MockApi::default());
    api.push(Scripted::Fail(503));
    let engine = engine_with(&api);

    let current = engine
        .dispatch_and_resync("1", ActionKind::Stop, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(current.is_none());
    assert_eq!(api.list_calls(), 1);
}
