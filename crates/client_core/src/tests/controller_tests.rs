use super::*;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::transport::{ApiRequest, ApiResponse, HttpMethod};

type Responder = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, CallError> + Send + Sync>;

/// Answers from a closure, records every request, and can park requests whose
/// endpoint contains a fragment until the test releases them.
struct ScriptedTransport {
    responder: Responder,
    requests: Mutex<Vec<ApiRequest>>,
    holds: Mutex<Vec<(String, oneshot::Receiver<()>)>>,
}

impl ScriptedTransport {
    fn new(
        responder: impl Fn(&ApiRequest) -> Result<ApiResponse, CallError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            holds: Mutex::new(Vec::new()),
        })
    }

    async fn hold(&self, fragment: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds.lock().await.push((fragment.to_string(), rx));
        tx
    }

    async fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().await.clone()
    }

    async fn wait_for_requests(&self, count: usize) {
        for _ in 0..200 {
            if self.requests.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} requests");
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, CallError> {
        self.requests.lock().await.push(request.clone());
        let hold = {
            let mut holds = self.holds.lock().await;
            holds
                .iter()
                .position(|(fragment, _)| request.endpoint.contains(fragment.as_str()))
                .map(|index| holds.remove(index).1)
        };
        if let Some(release) = hold {
            let _ = release.await;
        }
        (self.responder)(request)
    }
}

fn ok(body: Value) -> Result<ApiResponse, CallError> {
    Ok(ApiResponse::new(200, body))
}

fn status(code: u16) -> Result<ApiResponse, CallError> {
    Ok(ApiResponse::new(code, json!({"message": "upstream unavailable"})))
}

fn is_catalog(request: &ApiRequest) -> bool {
    request.endpoint.ends_with("/native/v2/offers.json")
}

fn catalog_body(ids: &[i64], auto_select: bool) -> Value {
    let offers: Vec<Value> = ids
        .iter()
        .map(|id| json!({"campaign_id": id, "title": format!("Offer {id}")}))
        .collect();
    json!({
        "data": {
            "offers": offers,
            "session_id": "s1",
            "settings": {"usp_all_offers_checked": auto_select},
        }
    })
}

fn catalog_then_ack(
    catalog: Value,
) -> impl Fn(&ApiRequest) -> Result<ApiResponse, CallError> + Send + Sync + 'static {
    move |request| {
        if is_catalog(request) {
            ok(catalog.clone())
        } else {
            ok(json!({"status": "success"}))
        }
    }
}

fn settings() -> ClientSettings {
    ClientSettings {
        api_base_url: "http://perks.test".into(),
        ..ClientSettings::default()
    }
}

fn identity() -> Identity {
    Identity::new("key-1", "user-1")
}

fn controller(transport: &Arc<ScriptedTransport>) -> Arc<SelectionController> {
    SelectionController::new_with_transport(&settings(), transport.clone()).expect("controller")
}

async fn started(transport: &Arc<ScriptedTransport>) -> Arc<SelectionController> {
    let controller = controller(transport);
    controller.start(identity()).await.expect("start");
    controller
}

fn ids(raw: &[i64]) -> BTreeSet<CampaignId> {
    raw.iter().copied().map(CampaignId).collect()
}

#[tokio::test]
async fn auto_select_setting_selects_every_offer_once() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1, 2], true)));
    let controller = controller(&transport);

    let summary = controller.start(identity()).await.expect("start");
    controller.join_background().await;

    assert!(summary.auto_selection_applied);
    assert_eq!(controller.selected_ids().await, ids(&[1, 2]));
    assert_eq!(controller.session_id().await, Some(SessionId("s1".into())));
    let log = controller.log();
    assert_eq!(log.count(LogAction::FetchOffers).await, 1);
    assert_eq!(log.count(LogAction::AutoSelectAll).await, 1);

    let requests = transport.requests().await;
    let bulk = requests
        .iter()
        .find(|request| request.method == HttpMethod::Put)
        .expect("auto-select request");
    assert!(bulk.endpoint.ends_with("/sdk/v4/usp/session/s1.json"));
    assert_eq!(
        bulk.body.as_ref().map(|body| body["selected_campaigns"].clone()),
        Some(json!([1, 2]))
    );
}

#[tokio::test]
async fn repeated_auto_selection_checks_log_a_single_entry() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1, 2], true)));
    let controller = started(&transport).await;

    assert!(!controller.apply_auto_selection().await);
    assert!(!controller.apply_auto_selection().await);
    controller.join_background().await;

    assert_eq!(controller.log().count(LogAction::AutoSelectAll).await, 1);
}

#[tokio::test]
async fn auto_select_failure_keeps_local_selection() {
    let transport = ScriptedTransport::new(|request| {
        if is_catalog(request) {
            ok(catalog_body(&[7, 8], true))
        } else {
            Err(CallError::Transport("connection reset".into()))
        }
    });
    let controller = started(&transport).await;
    controller.join_background().await;

    assert_eq!(controller.selected_ids().await, ids(&[7, 8]));
    let entries = controller.activity_log().await;
    let auto = entries
        .iter()
        .find(|entry| entry.action == LogAction::AutoSelectAll)
        .expect("auto-select entry");
    assert_eq!(
        auto.error.as_deref(),
        Some("auto-select network failure: transport failure: connection reset")
    );
}

#[tokio::test]
async fn successful_toggles_replay_to_the_last_intent() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1, 2, 3], false)));
    let controller = started(&transport).await;

    let steps = [(1, true), (2, true), (1, false), (3, true), (2, false), (1, true)];
    for (id, selected) in steps {
        let outcome = controller.set_selection(CampaignId(id), selected).await;
        assert_eq!(outcome, SelectionOutcome::Confirmed);
        assert_eq!(outcome.state(), Some(MutationState::Confirmed));
    }

    assert_eq!(controller.selected_ids().await, ids(&[1, 3]));
    assert_eq!(controller.log().count(LogAction::Select).await, 4);
    assert_eq!(controller.log().count(LogAction::Unselect).await, 2);
}

#[tokio::test]
async fn failed_select_is_rolled_back_and_logged() {
    let transport = ScriptedTransport::new(|request| {
        if is_catalog(request) {
            ok(catalog_body(&[1, 2], false))
        } else {
            status(500)
        }
    });
    let controller = started(&transport).await;

    let outcome = controller.set_selection(CampaignId(1), true).await;

    match &outcome {
        SelectionOutcome::Reverted { error } => assert_eq!(error.status(), Some(500)),
        other => panic!("expected revert, got {other:?}"),
    }
    assert_eq!(outcome.state(), Some(MutationState::Reverted));
    assert!(!controller.selected_ids().await.contains(&CampaignId(1)));
    assert!(controller.snapshot().await.pending.is_empty());

    let latest = &controller.activity_log().await[0];
    assert_eq!(latest.action, LogAction::Select);
    assert!(latest.is_error());
    assert_eq!(latest.response.as_ref().map(|r| r.status), Some(500));
}

#[tokio::test]
async fn failed_unselect_restores_the_selection() {
    let transport = ScriptedTransport::new(|request| {
        if is_catalog(request) {
            ok(catalog_body(&[1, 2], false))
        } else if request.endpoint.ends_with("/unselect.json") {
            status(502)
        } else {
            ok(json!({"status": "success"}))
        }
    });
    let controller = started(&transport).await;

    assert_eq!(
        controller.set_selection(CampaignId(1), true).await,
        SelectionOutcome::Confirmed
    );
    let outcome = controller.set_selection(CampaignId(1), false).await;
    assert!(matches!(outcome, SelectionOutcome::Reverted { .. }));

    assert!(controller.selected_ids().await.contains(&CampaignId(1)));
    let entries = controller.activity_log().await;
    let selection: Vec<_> = entries
        .iter()
        .filter(|entry| matches!(entry.action, LogAction::Select | LogAction::Unselect))
        .collect();
    assert_eq!(selection.len(), 2);
    assert_eq!(selection[0].action, LogAction::Unselect);
    assert!(selection[0].is_error());
    assert_eq!(selection[1].action, LogAction::Select);
    assert!(!selection[1].is_error());
}

#[tokio::test]
async fn pending_toggle_is_visible_until_the_server_answers() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[4], false)));
    let controller = started(&transport).await;
    let release = transport.hold("/4/select.json").await;

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_selection(CampaignId(4), true).await })
    };
    transport.wait_for_requests(2).await;

    let snapshot = controller.snapshot().await;
    assert!(snapshot.is_selected(CampaignId(4)));
    assert_eq!(snapshot.pending.get(&CampaignId(4)), Some(&true));

    release.send(()).expect("release");
    assert_eq!(task.await.expect("join"), SelectionOutcome::Confirmed);
    assert!(controller.snapshot().await.pending.is_empty());
}

#[tokio::test]
async fn bulk_selection_applies_target_whatever_the_server_says() {
    let transport = ScriptedTransport::new(|request| {
        if is_catalog(request) {
            ok(catalog_body(&[1, 2, 3], false))
        } else {
            status(503)
        }
    });
    let controller = started(&transport).await;

    let outcome = controller.set_all_selection(true).await;
    assert!(matches!(outcome, BulkOutcome::Unconfirmed { count: 3, .. }));
    assert_eq!(controller.selected_ids().await.len(), 3);

    let outcome = controller.set_all_selection(false).await;
    assert!(matches!(outcome, BulkOutcome::Unconfirmed { count: 3, .. }));
    assert!(controller.selected_ids().await.is_empty());

    let entries = controller.activity_log().await;
    assert_eq!(entries[0].action, LogAction::BulkUnselect);
    assert!(entries[0].is_error());
    assert_eq!(entries[1].action, LogAction::BulkSelect);
    let unselect_body = entries[0].request.body.clone().expect("body");
    assert_eq!(unselect_body["unselected_campaigns"], json!([1, 2, 3]));
    assert_eq!(unselect_body["pub_user_id"], json!("user-1"));
}

#[tokio::test]
async fn offers_without_campaign_ids_are_not_selectable() {
    let transport = ScriptedTransport::new(catalog_then_ack(json!({
        "offers": [
            {"campaign_id": 1, "title": "One"},
            {"title": "No id"},
            {"campaign_id": "2"},
        ],
        "session_id": "s1",
    })));
    let controller = started(&transport).await;

    assert_eq!(
        controller.set_all_selection(true).await,
        BulkOutcome::Confirmed { count: 2 }
    );
    assert_eq!(controller.selected_ids().await, ids(&[1, 2]));
    assert_eq!(
        controller.set_selection(CampaignId(99), true).await,
        SelectionOutcome::Skipped
    );

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.offers.len(), 3);
    assert_eq!(snapshot.selectable_count(), 2);
    assert!(!snapshot.can_select_all());
    assert!(snapshot.can_unselect_all());
}

#[tokio::test]
async fn mutations_without_a_session_send_nothing() {
    let transport = ScriptedTransport::new(catalog_then_ack(json!({
        "offers": [{"campaign_id": 1}],
    })));
    let controller = controller(&transport);

    assert_eq!(
        controller.set_selection(CampaignId(1), true).await,
        SelectionOutcome::Skipped
    );
    assert_eq!(controller.set_all_selection(true).await, BulkOutcome::Skipped);
    assert!(controller.wrap_session().await.expect("wrap").is_none());
    assert!(controller.get_session_details().await.expect("details").is_none());
    assert!(transport.requests().await.is_empty());
    assert!(controller.log().is_empty().await);

    // A catalog without a session id leaves selection disabled.
    controller.start(identity()).await.expect("start");
    assert_eq!(controller.snapshot().await.phase, Phase::Ready);
    assert_eq!(
        controller.set_selection(CampaignId(1), true).await,
        SelectionOutcome::Skipped
    );
    assert!(controller.wrap_session().await.expect("wrap").is_none());
    assert_eq!(transport.requests().await.len(), 1);
    assert_eq!(controller.log().len().await, 1);
}

#[tokio::test]
async fn wrap_returns_receipt_and_keeps_state() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1, 2], false)));
    let controller = started(&transport).await;
    controller.set_selection(CampaignId(2), true).await;

    let receipt = controller
        .wrap_session()
        .await
        .expect("wrap")
        .expect("session present");

    assert_eq!(receipt.session_id, SessionId("s1".into()));
    assert_eq!(receipt.selected_campaigns, vec![CampaignId(2)]);
    assert_eq!(receipt.webhook.payload["campaigns"][0]["title"], json!("Offer 2"));

    let latest = &controller.activity_log().await[0];
    assert_eq!(latest.action, LogAction::WrapSession);
    let body = latest.request.body.clone().expect("body");
    assert_eq!(body["action"], json!("wrap"));
    assert_eq!(latest.request.method, HttpMethod::Post);

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.offers.len(), 2);
    assert_eq!(snapshot.selected_ids, ids(&[2]));
}

#[tokio::test]
async fn wrap_failure_is_surfaced() {
    let transport = ScriptedTransport::new(|request| {
        if is_catalog(request) {
            ok(catalog_body(&[1], false))
        } else {
            status(500)
        }
    });
    let controller = started(&transport).await;

    let err = controller.wrap_session().await.expect_err("wrap should fail");
    assert!(matches!(err, ControllerError::WrapFailed(ref call) if call.status() == Some(500)));
    assert!(controller.activity_log().await[0].is_error());
    assert_eq!(controller.snapshot().await.phase, Phase::Ready);
}

#[tokio::test]
async fn fetch_failure_then_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport::new({
        let calls = calls.clone();
        move |request| {
            if is_catalog(request) && calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return status(500);
            }
            catalog_then_ack(catalog_body(&[5], false))(request)
        }
    });
    let controller = controller(&transport);

    let err = controller.start(identity()).await.expect_err("first fetch fails");
    assert!(matches!(err, ControllerError::FetchFailed(_)));
    let snapshot = controller.snapshot().await;
    assert!(snapshot.error().is_some());
    assert!(!snapshot.loading());
    let failed = &controller.activity_log().await[0];
    assert_eq!(failed.action, LogAction::FetchOffers);
    assert_eq!(failed.response.as_ref().map(|r| r.status), Some(500));

    let summary = controller.retry().await.expect("retry");
    assert_eq!(summary.offer_count, 1);
    assert_eq!(controller.snapshot().await.phase, Phase::Ready);
    assert_eq!(controller.log().count(LogAction::FetchOffers).await, 2);
}

#[tokio::test]
async fn empty_catalog_is_ready_not_failed() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[], true)));
    let controller = started(&transport).await;
    controller.join_background().await;

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Ready);
    assert!(snapshot.offers.is_empty());
    assert!(!snapshot.auto_selection_applied);
    assert_eq!(controller.set_all_selection(true).await, BulkOutcome::Skipped);
    assert_eq!(controller.log().count(LogAction::AutoSelectAll).await, 0);
}

#[tokio::test]
async fn retry_replaces_catalog_and_rearms_auto_select() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1, 2], true)));
    let controller = started(&transport).await;
    controller.join_background().await;
    controller.set_selection(CampaignId(1), false).await;

    controller.retry().await.expect("retry");
    controller.join_background().await;

    assert_eq!(controller.selected_ids().await, ids(&[1, 2]));
    assert_eq!(controller.log().count(LogAction::AutoSelectAll).await, 2);
}

#[tokio::test]
async fn stale_selection_response_is_discarded_after_retry() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport::new({
        let fetches = fetches.clone();
        move |request| {
            if is_catalog(request) {
                let campaigns: &[i64] = if fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                    &[1, 2]
                } else {
                    &[3]
                };
                return ok(catalog_body(campaigns, false));
            }
            ok(json!({"status": "success"}))
        }
    });
    let controller = started(&transport).await;
    let release = transport.hold("/1/select.json").await;

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_selection(CampaignId(1), true).await })
    };
    transport.wait_for_requests(2).await;

    controller.retry().await.expect("retry");
    release.send(()).expect("release");

    assert_eq!(task.await.expect("join"), SelectionOutcome::Discarded);
    assert!(controller.selected_ids().await.is_empty());
    assert_eq!(controller.log().count(LogAction::Select).await, 1);
}

#[tokio::test]
async fn toggles_of_one_campaign_run_one_at_a_time() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1], false)));
    let controller = started(&transport).await;
    let release = transport.hold("/1/select.json").await;

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_selection(CampaignId(1), true).await })
    };
    transport.wait_for_requests(2).await;
    let second = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_selection(CampaignId(1), false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.requests().await.len(), 2);

    release.send(()).expect("release");
    assert_eq!(first.await.expect("join"), SelectionOutcome::Confirmed);
    assert_eq!(second.await.expect("join"), SelectionOutcome::Confirmed);

    let requests = transport.requests().await;
    assert_eq!(requests.len(), 3);
    assert!(requests[2].endpoint.ends_with("/1/unselect.json"));
    assert!(controller.selected_ids().await.is_empty());
}

#[tokio::test]
async fn session_details_report_drift() {
    let transport = ScriptedTransport::new(|request| {
        if is_catalog(request) {
            ok(catalog_body(&[1, 2, 3], false))
        } else if request.method == HttpMethod::Get {
            ok(json!({"data": {"selected_campaigns": [{"campaign_id": 2}, 3]}}))
        } else {
            ok(json!({"status": "success"}))
        }
    });
    let controller = started(&transport).await;
    controller.set_selection(CampaignId(1), true).await;
    controller.set_selection(CampaignId(2), true).await;

    let details = controller
        .get_session_details()
        .await
        .expect("details")
        .expect("session present");
    let drift = details.drift(&controller.selected_ids().await);
    assert_eq!(drift.missing_on_server, ids(&[1]));
    assert_eq!(drift.only_on_server, ids(&[3]));

    let latest = &controller.activity_log().await[0];
    assert_eq!(latest.action, LogAction::SessionDetails);
    assert!(latest
        .request
        .endpoint
        .ends_with("/sdk/v4/usp/session/s1.json?key=key-1&pub_user_id=user-1"));
    assert!(latest.request.body.is_none());
}

#[tokio::test]
async fn identity_is_validated_and_bound_once() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1], false)));
    let controller = controller(&transport);

    let err = controller
        .start(Identity::new(" ", "user-1"))
        .await
        .expect_err("blank key");
    assert!(matches!(err, ControllerError::InvalidIdentity(_)));
    assert!(matches!(
        controller.retry().await,
        Err(ControllerError::NotStarted)
    ));
    assert!(transport.requests().await.is_empty());

    controller.start(identity()).await.expect("start");
    assert!(matches!(
        controller.start(identity()).await,
        Err(ControllerError::AlreadyStarted)
    ));
    assert_eq!(
        transport.requests().await[0].authorization(),
        "Bearer key-1"
    );
}

#[tokio::test]
async fn phase_changes_are_broadcast() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1], false)));
    let controller = controller(&transport);
    let mut events = controller.subscribe_events();

    controller.start(identity()).await.expect("start");

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::PhaseChanged(phase) = event {
            phases.push(phase);
        }
    }
    assert_eq!(phases, vec![Phase::Loading, Phase::Ready]);
}

#[tokio::test]
async fn log_subscribers_see_each_call() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1], false)));
    let controller = controller(&transport);
    let mut appended = controller.subscribe_log();

    controller.start(identity()).await.expect("start");
    controller.set_selection(CampaignId(1), true).await;

    let first = appended.recv().await.expect("fetch entry");
    let second = appended.recv().await.expect("select entry");
    assert_eq!(first.action, LogAction::FetchOffers);
    assert_eq!(second.action, LogAction::Select);
    assert_eq!(second.subject.label(), "Offer 1");
}

#[tokio::test]
async fn loosely_typed_offer_still_yields_ready_catalog() {
    let transport = ScriptedTransport::new(catalog_then_ack(json!({
        "offers": [
            {"campaign_id": 1, "title": "Good"},
            {"campaign_id": 2, "title": "Also good", "cta_text": 5, "image": {"src": "x"}},
        ],
        "session_id": "s1",
    })));
    let controller = started(&transport).await;

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Ready);
    assert_eq!(snapshot.offers.len(), 2);
    assert_eq!(snapshot.offers[1].display_title(), "Also good");
    assert_eq!(snapshot.offers[1].extra.get("cta_text"), Some(&json!(5)));
    assert_eq!(
        controller.set_selection(CampaignId(2), true).await,
        SelectionOutcome::Confirmed
    );
}

#[tokio::test]
async fn older_fetch_finishing_last_is_superseded() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport::new({
        let fetches = fetches.clone();
        move |request| {
            if is_catalog(request) {
                // The retry answers first; the held original answers last.
                let campaigns: &[i64] = if fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                    &[3]
                } else {
                    &[1, 2]
                };
                return ok(catalog_body(campaigns, false));
            }
            ok(json!({"status": "success"}))
        }
    });
    let controller = controller(&transport);
    let release = transport.hold("/offers.json").await;

    let original = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(identity()).await })
    };
    transport.wait_for_requests(1).await;

    let summary = controller.retry().await.expect("retry");
    assert_eq!(summary.offer_count, 1);
    release.send(()).expect("release");

    let result = original.await.expect("join");
    assert!(matches!(result, Err(ControllerError::Superseded)));

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Ready);
    let catalog: Vec<_> = snapshot.offers.iter().filter_map(|offer| offer.campaign_id).collect();
    assert_eq!(catalog, vec![CampaignId(3)]);
    assert_eq!(controller.log().count(LogAction::FetchOffers).await, 2);
}

#[tokio::test]
async fn refetch_drops_toggle_locks_and_queued_toggles() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1, 2], false)));
    let controller = started(&transport).await;
    controller.set_selection(CampaignId(2), true).await;
    let release = transport.hold("/1/select.json").await;

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_selection(CampaignId(1), true).await })
    };
    transport.wait_for_requests(3).await;
    let queued = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.set_selection(CampaignId(1), false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.toggle_locks.lock().await.len(), 2);

    controller.retry().await.expect("retry");
    assert!(controller.toggle_locks.lock().await.is_empty());

    release.send(()).expect("release");
    assert_eq!(first.await.expect("join"), SelectionOutcome::Discarded);
    assert_eq!(queued.await.expect("join"), SelectionOutcome::Skipped);
    assert_eq!(controller.log().count(LogAction::Unselect).await, 0);
    assert!(controller.selected_ids().await.is_empty());
}

#[tokio::test]
async fn finished_background_tasks_are_not_retained() {
    let transport = ScriptedTransport::new(catalog_then_ack(catalog_body(&[1], true)));
    let controller = started(&transport).await;

    for _ in 0..200 {
        if controller
            .background
            .lock()
            .await
            .iter()
            .all(|handle| handle.is_finished())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    controller.retry().await.expect("retry");

    assert_eq!(controller.background.lock().await.len(), 1);
    controller.join_background().await;
    assert_eq!(controller.log().count(LogAction::AutoSelectAll).await, 2);
}
