//! The remote operations the controller is built from. Each one resolves its
//! request, performs it, and appends exactly one activity entry whatever the
//! outcome.

use std::sync::Arc;

use serde_json::Value;
use shared::{
    domain::{CampaignId, Identity, Offer, SessionId},
    protocol::{
        BulkChange, BulkSelectionRequest, OffersPayload, OffersRequest, SelectionRequest,
        SessionDetailsPayload, SessionDetailsQuery, Targeting, WrapRequest,
    },
};
use tracing::info;

use crate::{
    activity_log::{ActivityLog, LogAction, LogEntry, LogSubject},
    endpoints::Endpoints,
    error::CallError,
    transport::{ApiRequest, ApiResponse, ApiTransport, HttpMethod},
};

#[derive(Clone)]
pub struct ApiContext {
    pub transport: Arc<dyn ApiTransport>,
    pub endpoints: Endpoints,
    pub targeting: Targeting,
    pub log: Arc<ActivityLog>,
}

impl ApiContext {
    async fn exchange(&self, request: &ApiRequest) -> Result<ApiResponse, CallError> {
        self.transport.send(request).await?.ensure_success()
    }

    /// Requests that cannot even be encoded are still recorded.
    async fn record_unsent(
        &self,
        action: LogAction,
        subject: LogSubject,
        endpoint: String,
        identity: &Identity,
        error: CallError,
    ) -> CallError {
        let request = ApiRequest::new(request_method(action), endpoint, identity, None);
        self.log
            .append(LogEntry::from_outcome(
                action,
                subject,
                &request,
                &Err(error.clone()),
            ))
            .await;
        error
    }
}

fn request_method(action: LogAction) -> HttpMethod {
    match action {
        LogAction::BulkSelect | LogAction::BulkUnselect | LogAction::AutoSelectAll => {
            HttpMethod::Put
        }
        LogAction::SessionDetails => HttpMethod::Get,
        _ => HttpMethod::Post,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogFetch {
    pub offers: Vec<Offer>,
    pub session_id: Option<SessionId>,
    pub auto_select_setting: bool,
}

pub async fn fetch_catalog(
    ctx: &ApiContext,
    identity: &Identity,
) -> Result<CatalogFetch, CallError> {
    let endpoint = ctx.endpoints.offers();
    let subject_on_failure = LogSubject::Catalog {
        count: 0,
        session_id: None,
    };
    let request = match ApiRequest::json(
        HttpMethod::Post,
        endpoint.clone(),
        identity,
        &OffersRequest::new(identity, &ctx.targeting),
    ) {
        Ok(request) => request,
        Err(err) => {
            return Err(ctx
                .record_unsent(LogAction::FetchOffers, subject_on_failure, endpoint, identity, err)
                .await)
        }
    };

    info!(
        endpoint = %request.endpoint,
        placement = %ctx.targeting.placement,
        "offers: fetching catalog"
    );
    let outcome = ctx.exchange(&request).await;

    let parsed = match &outcome {
        Ok(response) => parse_catalog(&response.body),
        Err(err) => Err(err.clone()),
    };

    let entry = match &parsed {
        Ok(fetch) => LogEntry::from_outcome(
            LogAction::FetchOffers,
            LogSubject::Catalog {
                count: fetch.offers.len(),
                session_id: fetch.session_id.clone(),
            },
            &request,
            &outcome,
        ),
        Err(err) => LogEntry::new(
            LogAction::FetchOffers,
            subject_on_failure,
            &request,
            outcome.as_ref().ok().cloned().or_else(|| err.response().cloned()),
            Some(err.to_string()),
        ),
    };
    ctx.log.append(entry).await;

    if let Ok(fetch) = &parsed {
        info!(
            offers = fetch.offers.len(),
            session_id = fetch.session_id.as_ref().map(SessionId::as_str),
            auto_select = fetch.auto_select_setting,
            "offers: catalog fetched"
        );
    }
    parsed
}

fn parse_catalog(body: &Value) -> Result<CatalogFetch, CallError> {
    if !body.is_object() {
        return Err(CallError::Decode(
            "offers response is not a JSON object".to_string(),
        ));
    }
    let payload = OffersPayload::from_body(body)
        .map_err(|err| CallError::Decode(format!("malformed offers list: {err}")))?;
    Ok(CatalogFetch {
        offers: payload.offers,
        session_id: payload.session_id,
        auto_select_setting: payload.auto_select_all,
    })
}

pub async fn set_offer_selection(
    ctx: &ApiContext,
    identity: &Identity,
    session_id: &SessionId,
    campaign_id: CampaignId,
    selected: bool,
    offer: Option<Offer>,
) -> Result<ApiResponse, CallError> {
    let action = if selected {
        LogAction::Select
    } else {
        LogAction::Unselect
    };
    let endpoint = ctx.endpoints.selection(session_id, campaign_id, selected);
    let subject = LogSubject::Offer { campaign_id, offer };
    let request = match ApiRequest::json(
        HttpMethod::Post,
        endpoint.clone(),
        identity,
        &SelectionRequest::new(identity),
    ) {
        Ok(request) => request,
        Err(err) => return Err(ctx.record_unsent(action, subject, endpoint, identity, err).await),
    };

    info!(
        session_id = %session_id,
        campaign_id = %campaign_id,
        action = action.as_str(),
        "selection: sending"
    );
    let outcome = ctx.exchange(&request).await;
    ctx.log
        .append(LogEntry::from_outcome(action, subject, &request, &outcome))
        .await;
    outcome
}

/// `action` tells a user-driven bulk change apart from auto-selection; both
/// hit the same endpoint.
pub async fn set_bulk_selection(
    ctx: &ApiContext,
    identity: &Identity,
    session_id: &SessionId,
    change: BulkChange,
    action: LogAction,
) -> Result<ApiResponse, CallError> {
    let endpoint = ctx.endpoints.session(session_id);
    let subject = LogSubject::campaigns(change.campaigns());
    let request = match ApiRequest::json(
        HttpMethod::Put,
        endpoint.clone(),
        identity,
        &BulkSelectionRequest::new(identity, change),
    ) {
        Ok(request) => request,
        Err(err) => return Err(ctx.record_unsent(action, subject, endpoint, identity, err).await),
    };

    info!(
        session_id = %session_id,
        action = action.as_str(),
        "selection: sending bulk change"
    );
    let outcome = ctx.exchange(&request).await;
    ctx.log
        .append(LogEntry::from_outcome(action, subject, &request, &outcome))
        .await;
    outcome
}

pub async fn wrap_session(
    ctx: &ApiContext,
    identity: &Identity,
    session_id: &SessionId,
) -> Result<ApiResponse, CallError> {
    let endpoint = ctx.endpoints.session(session_id);
    let subject = LogSubject::Session {
        session_id: session_id.clone(),
    };
    let request = match ApiRequest::json(
        HttpMethod::Post,
        endpoint.clone(),
        identity,
        &WrapRequest::new(identity),
    ) {
        Ok(request) => request,
        Err(err) => {
            return Err(ctx
                .record_unsent(LogAction::WrapSession, subject, endpoint, identity, err)
                .await)
        }
    };

    info!(session_id = %session_id, "session: wrapping");
    let outcome = ctx.exchange(&request).await;
    ctx.log
        .append(LogEntry::from_outcome(
            LogAction::WrapSession,
            subject,
            &request,
            &outcome,
        ))
        .await;
    outcome
}

pub async fn session_details(
    ctx: &ApiContext,
    identity: &Identity,
    session_id: &SessionId,
) -> Result<SessionDetailsPayload, CallError> {
    let request = ApiRequest::new(
        HttpMethod::Get,
        ctx.endpoints
            .session_details(session_id, &SessionDetailsQuery::new(identity)),
        identity,
        None,
    );

    info!(session_id = %session_id, "session: reading details");
    let outcome = ctx.exchange(&request).await;
    ctx.log
        .append(LogEntry::from_outcome(
            LogAction::SessionDetails,
            LogSubject::Session {
                session_id: session_id.clone(),
            },
            &request,
            &outcome,
        ))
        .await;
    outcome.map(|response| SessionDetailsPayload::from_body(&response.body))
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
