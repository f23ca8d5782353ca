//! Session & selection controller: owns the catalog, the selection set and
//! the session id for one user session, and reconciles optimistic local
//! changes with what the offers API reports.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use futures::future::join_all;
use serde::Serialize;
use shared::{
    domain::{CampaignId, Identity, Offer, SessionId},
    protocol::BulkChange,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    activity_log::{ActivityLog, LogAction, LogEntry},
    api::{self, ApiContext},
    config::ClientSettings,
    error::{CallError, ControllerError},
    session::{SessionDetails, WrapReceipt},
    transport::{ApiTransport, HttpTransport},
};

/// Top-level lifecycle. `Ready` and `Failed` are the two settled outcomes of
/// a fetch; neither is terminal, `retry` goes back to `Loading`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "error", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

/// Lifecycle of one optimistic single-offer change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    /// No session, unknown campaign, or the catalog is not ready.
    Skipped,
    Confirmed,
    Reverted { error: CallError },
    /// The catalog was replaced while the call was in flight; the response
    /// was logged but not applied.
    Discarded,
}

impl SelectionOutcome {
    pub fn state(&self) -> Option<MutationState> {
        match self {
            Self::Confirmed => Some(MutationState::Confirmed),
            Self::Reverted { .. } => Some(MutationState::Reverted),
            Self::Skipped | Self::Discarded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome {
    Skipped,
    Confirmed { count: usize },
    /// The local selection was still applied.
    Unconfirmed { count: usize, error: CallError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub offer_count: usize,
    pub selectable_count: usize,
    pub session_id: Option<SessionId>,
    pub auto_select_setting: bool,
    pub auto_selection_applied: bool,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    PhaseChanged(Phase),
    SelectionChanged(BTreeSet<CampaignId>),
}

/// Point-in-time copy of everything a UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub phase: Phase,
    pub session_id: Option<SessionId>,
    pub offers: Vec<Offer>,
    pub selected_ids: BTreeSet<CampaignId>,
    /// Single-offer changes still waiting on the server, by target state.
    pub pending: BTreeMap<CampaignId, bool>,
    pub auto_select_setting: bool,
    pub auto_selection_applied: bool,
}

impl ControllerSnapshot {
    pub fn loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            Phase::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_selected(&self, campaign_id: CampaignId) -> bool {
        self.selected_ids.contains(&campaign_id)
    }

    pub fn selectable_count(&self) -> usize {
        self.offers.iter().filter(|offer| offer.is_selectable()).count()
    }

    pub fn can_select_all(&self) -> bool {
        self.session_id.is_some() && self.selected_ids.len() < self.selectable_count()
    }

    pub fn can_unselect_all(&self) -> bool {
        self.session_id.is_some() && !self.selected_ids.is_empty()
    }

    pub fn can_wrap(&self) -> bool {
        self.session_id.is_some() && !self.selected_ids.is_empty()
    }
}

struct ControllerState {
    identity: Option<Identity>,
    phase: Phase,
    offers: Vec<Offer>,
    session_id: Option<SessionId>,
    selected_ids: BTreeSet<CampaignId>,
    pending: BTreeMap<CampaignId, bool>,
    auto_select_setting: bool,
    auto_selection_applied: bool,
    /// Bumped on every fetch; responses from an older catalog are dropped.
    generation: u64,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            identity: None,
            phase: Phase::Idle,
            offers: Vec::new(),
            session_id: None,
            selected_ids: BTreeSet::new(),
            pending: BTreeMap::new(),
            auto_select_setting: false,
            auto_selection_applied: false,
            generation: 0,
        }
    }

    /// Identity and session id when mutations may be sent.
    fn established(&self) -> Option<(Identity, SessionId)> {
        if self.phase != Phase::Ready {
            return None;
        }
        Some((self.identity.clone()?, self.session_id.clone()?))
    }

    fn selectable_ids(&self) -> Vec<CampaignId> {
        let mut seen = BTreeSet::new();
        self.offers
            .iter()
            .filter_map(|offer| offer.campaign_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    fn offer(&self, campaign_id: CampaignId) -> Option<&Offer> {
        self.offers
            .iter()
            .find(|offer| offer.campaign_id == Some(campaign_id))
    }

    fn selected_offers(&self) -> Vec<Offer> {
        self.offers
            .iter()
            .filter(|offer| {
                offer
                    .campaign_id
                    .is_some_and(|id| self.selected_ids.contains(&id))
            })
            .cloned()
            .collect()
    }

    fn summary(&self) -> CatalogSummary {
        CatalogSummary {
            offer_count: self.offers.len(),
            selectable_count: self.selectable_ids().len(),
            session_id: self.session_id.clone(),
            auto_select_setting: self.auto_select_setting,
            auto_selection_applied: self.auto_selection_applied,
        }
    }
}

pub struct SelectionController {
    api: ApiContext,
    serialize_toggles: bool,
    inner: Mutex<ControllerState>,
    toggle_locks: Mutex<HashMap<CampaignId, Arc<Mutex<()>>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SelectionController {
    pub fn new(settings: &ClientSettings) -> Result<Arc<Self>, ControllerError> {
        let transport = HttpTransport::new(settings.request_timeout())
            .map_err(|err| ControllerError::Config(err.to_string()))?;
        Self::new_with_transport(settings, Arc::new(transport))
    }

    pub fn new_with_transport(
        settings: &ClientSettings,
        transport: Arc<dyn ApiTransport>,
    ) -> Result<Arc<Self>, ControllerError> {
        let endpoints = settings
            .endpoints()
            .map_err(|err| ControllerError::Config(err.to_string()))?;
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            api: ApiContext {
                transport,
                endpoints,
                targeting: settings.targeting.clone(),
                log: Arc::new(ActivityLog::new(settings.activity_log_capacity)),
            },
            serialize_toggles: settings.serialize_toggles,
            inner: Mutex::new(ControllerState::new()),
            toggle_locks: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            events,
        }))
    }

    /// Binds the identity and fetches the catalog. The identity is fixed for
    /// the controller's lifetime; later fetches go through [`Self::retry`].
    pub async fn start(
        self: &Arc<Self>,
        identity: Identity,
    ) -> Result<CatalogSummary, ControllerError> {
        identity.validate()?;
        {
            let mut guard = self.inner.lock().await;
            if guard.identity.is_some() {
                return Err(ControllerError::AlreadyStarted);
            }
            info!(pub_user_id = %identity.pub_user_id, "session: starting");
            guard.identity = Some(identity);
        }
        self.load_catalog().await
    }

    /// Re-fetches the catalog, replacing offers, session and selection
    /// wholesale. In-flight calls are not cancelled.
    pub async fn retry(self: &Arc<Self>) -> Result<CatalogSummary, ControllerError> {
        if self.inner.lock().await.identity.is_none() {
            return Err(ControllerError::NotStarted);
        }
        self.load_catalog().await
    }

    async fn load_catalog(self: &Arc<Self>) -> Result<CatalogSummary, ControllerError> {
        let (identity, generation) = {
            let mut guard = self.inner.lock().await;
            let identity = guard.identity.clone().ok_or(ControllerError::NotStarted)?;
            guard.generation += 1;
            guard.phase = Phase::Loading;
            guard.offers.clear();
            guard.session_id = None;
            guard.selected_ids.clear();
            guard.pending.clear();
            guard.auto_select_setting = false;
            guard.auto_selection_applied = false;
            self.emit(ControllerEvent::PhaseChanged(Phase::Loading));
            self.emit(ControllerEvent::SelectionChanged(BTreeSet::new()));
            (identity, guard.generation)
        };
        // Queued toggles keep their own handle; later ones start fresh.
        self.toggle_locks.lock().await.clear();

        let result = api::fetch_catalog(&self.api, &identity).await;

        let summary = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                info!(generation, "offers: dropping superseded catalog response");
                return Err(ControllerError::Superseded);
            }
            match result {
                Ok(fetch) => {
                    guard.offers = fetch.offers;
                    guard.session_id = fetch.session_id;
                    guard.auto_select_setting = fetch.auto_select_setting;
                    guard.phase = Phase::Ready;
                    if guard.session_id.is_none() {
                        warn!("offers: response carried no session id; selection disabled");
                    }
                    self.emit(ControllerEvent::PhaseChanged(Phase::Ready));
                }
                Err(err) => {
                    let phase = Phase::Failed(err.to_string());
                    guard.phase = phase.clone();
                    self.emit(ControllerEvent::PhaseChanged(phase));
                    return Err(ControllerError::FetchFailed(err));
                }
            }
            guard.summary()
        };

        let applied = self.apply_auto_selection().await;
        Ok(CatalogSummary {
            auto_selection_applied: summary.auto_selection_applied || applied,
            ..summary
        })
    }

    /// Runs the auto-selection check. Safe to call repeatedly: it applies at
    /// most once per fetched catalog and returns whether it applied now.
    ///
    /// The local selection is set before the server call is spawned and is
    /// kept even if that call fails.
    pub async fn apply_auto_selection(self: &Arc<Self>) -> bool {
        let job = {
            let mut guard = self.inner.lock().await;
            if guard.phase != Phase::Ready
                || !guard.auto_select_setting
                || guard.auto_selection_applied
                || guard.offers.is_empty()
            {
                return false;
            }
            let ids = guard.selectable_ids();
            guard.selected_ids = ids.iter().copied().collect();
            guard.auto_selection_applied = true;
            self.emit(ControllerEvent::SelectionChanged(guard.selected_ids.clone()));
            info!(count = ids.len(), "selection: auto-selected all offers");
            guard
                .established()
                .filter(|_| !ids.is_empty())
                .map(|(identity, session_id)| (identity, session_id, ids))
        };

        if let Some((identity, session_id, ids)) = job {
            let controller = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let result = api::set_bulk_selection(
                    &controller.api,
                    &identity,
                    &session_id,
                    BulkChange::SelectedCampaigns(ids),
                    LogAction::AutoSelectAll,
                )
                .await;
                if let Err(err) = result {
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        "selection: auto-select not confirmed by server; keeping local selection"
                    );
                }
            });
            let mut background = self.background.lock().await;
            background.retain(|handle| !handle.is_finished());
            background.push(handle);
        }
        true
    }

    /// Selects or unselects one offer: applied locally first, sent to the
    /// server, and rolled back if the server call fails.
    pub async fn set_selection(&self, campaign_id: CampaignId, selected: bool) -> SelectionOutcome {
        let Some(issued_generation) = self.accepts_selection(campaign_id).await else {
            return SelectionOutcome::Skipped;
        };

        let _turn = if self.serialize_toggles {
            Some(self.toggle_lock(campaign_id).await.lock_owned().await)
        } else {
            None
        };

        let (identity, session_id, offer, previously_selected, generation) = {
            let mut guard = self.inner.lock().await;
            // A toggle queued behind a replaced catalog never reaches the new one.
            if guard.generation != issued_generation {
                return SelectionOutcome::Skipped;
            }
            let Some((identity, session_id)) = guard.established() else {
                return SelectionOutcome::Skipped;
            };
            let Some(offer) = guard.offer(campaign_id).cloned() else {
                return SelectionOutcome::Skipped;
            };
            let previously_selected = guard.selected_ids.contains(&campaign_id);
            if selected {
                guard.selected_ids.insert(campaign_id);
            } else {
                guard.selected_ids.remove(&campaign_id);
            }
            guard.pending.insert(campaign_id, selected);
            self.emit(ControllerEvent::SelectionChanged(guard.selected_ids.clone()));
            (
                identity,
                session_id,
                offer,
                previously_selected,
                guard.generation,
            )
        };

        let result = api::set_offer_selection(
            &self.api,
            &identity,
            &session_id,
            campaign_id,
            selected,
            Some(offer),
        )
        .await;

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            info!(campaign_id = %campaign_id, "selection: dropping response for replaced catalog");
            return SelectionOutcome::Discarded;
        }
        guard.pending.remove(&campaign_id);
        match result {
            Ok(_) => SelectionOutcome::Confirmed,
            Err(error) => {
                if previously_selected {
                    guard.selected_ids.insert(campaign_id);
                } else {
                    guard.selected_ids.remove(&campaign_id);
                }
                self.emit(ControllerEvent::SelectionChanged(guard.selected_ids.clone()));
                warn!(
                    campaign_id = %campaign_id,
                    selected,
                    error = %error,
                    "selection: reverted after failed call"
                );
                SelectionOutcome::Reverted { error }
            }
        }
    }

    /// Selects or clears every selectable offer in one call. The local
    /// selection always ends at the target set, whatever the server says.
    pub async fn set_all_selection(&self, select_all: bool) -> BulkOutcome {
        let (identity, session_id, ids) = {
            let mut guard = self.inner.lock().await;
            if guard.offers.is_empty() {
                return BulkOutcome::Skipped;
            }
            let Some((identity, session_id)) = guard.established() else {
                return BulkOutcome::Skipped;
            };
            let ids = guard.selectable_ids();
            guard.selected_ids = if select_all {
                ids.iter().copied().collect()
            } else {
                BTreeSet::new()
            };
            self.emit(ControllerEvent::SelectionChanged(guard.selected_ids.clone()));
            (identity, session_id, ids)
        };

        let count = ids.len();
        let (change, action) = if select_all {
            (BulkChange::SelectedCampaigns(ids), LogAction::BulkSelect)
        } else {
            (BulkChange::UnselectedCampaigns(ids), LogAction::BulkUnselect)
        };

        match api::set_bulk_selection(&self.api, &identity, &session_id, change, action).await {
            Ok(_) => BulkOutcome::Confirmed { count },
            Err(error) => BulkOutcome::Unconfirmed { count, error },
        }
    }

    /// Finalizes the session. `Ok(None)` means there was no session to wrap
    /// and nothing was sent. Offers and selection stay inspectable afterwards.
    pub async fn wrap_session(&self) -> Result<Option<WrapReceipt>, ControllerError> {
        let (identity, session_id, selected) = {
            let guard = self.inner.lock().await;
            let Some((identity, session_id)) = guard.established() else {
                return Ok(None);
            };
            (identity, session_id, guard.selected_offers())
        };

        match api::wrap_session(&self.api, &identity, &session_id).await {
            Ok(response) => {
                info!(session_id = %session_id, selected = selected.len(), "session: wrapped");
                Ok(Some(WrapReceipt::new(session_id, &identity, selected, response)))
            }
            Err(err) => Err(ControllerError::WrapFailed(err)),
        }
    }

    /// Reads the server's view of the session. `Ok(None)` when no session
    /// exists yet.
    pub async fn get_session_details(&self) -> Result<Option<SessionDetails>, ControllerError> {
        let (identity, session_id) = {
            let guard = self.inner.lock().await;
            match guard.established() {
                Some(established) => established,
                None => return Ok(None),
            }
        };

        api::session_details(&self.api, &identity, &session_id)
            .await
            .map(|payload| Some(SessionDetails::new(session_id, payload)))
            .map_err(ControllerError::SessionDetailsFailed)
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        let guard = self.inner.lock().await;
        ControllerSnapshot {
            phase: guard.phase.clone(),
            session_id: guard.session_id.clone(),
            offers: guard.offers.clone(),
            selected_ids: guard.selected_ids.clone(),
            pending: guard.pending.clone(),
            auto_select_setting: guard.auto_select_setting,
            auto_selection_applied: guard.auto_selection_applied,
        }
    }

    pub async fn selected_ids(&self) -> BTreeSet<CampaignId> {
        self.inner.lock().await.selected_ids.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().await.session_id.clone()
    }

    /// Activity entries, newest first.
    pub async fn activity_log(&self) -> Vec<LogEntry> {
        self.api.log.entries().await
    }

    pub fn log(&self) -> &Arc<ActivityLog> {
        &self.api.log
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEntry> {
        self.api.log.subscribe()
    }

    /// Waits for spawned work (the auto-select call) to finish.
    pub async fn join_background(&self) {
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "controller: background task failed");
            }
        }
    }

    /// Catalog generation a toggle is issued against, if it may run at all.
    async fn accepts_selection(&self, campaign_id: CampaignId) -> Option<u64> {
        let guard = self.inner.lock().await;
        (guard.established().is_some() && guard.offer(campaign_id).is_some())
            .then_some(guard.generation)
    }

    async fn toggle_lock(&self, campaign_id: CampaignId) -> Arc<Mutex<()>> {
        let mut locks = self.toggle_locks.lock().await;
        Arc::clone(locks.entry(campaign_id).or_default())
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
