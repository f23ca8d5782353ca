use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use shared::{
    domain::{CampaignId, Identity, Offer, SessionId},
    protocol::{webhook_from_wrap_body, SessionDetailsPayload},
};

use crate::transport::ApiResponse;

pub const WEBHOOK_PREVIEW_ENDPOINT: &str = "/api/webhook/offers-selected";

/// Offer fields copied into a locally built webhook preview when present.
const WEBHOOK_OFFER_FIELDS: &[&str] = &[
    "click_url",
    "cta_no",
    "short_headline",
    "offer_description",
    "terms_and_conditions",
    "mini_text",
    "unique_id",
    "category_display_name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Server,
    Local,
}

/// What the downstream delivery of a wrapped session looks like.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPreview {
    pub source: WebhookSource,
    pub method: &'static str,
    pub endpoint: String,
    pub payload: Value,
}

impl WebhookPreview {
    pub fn local(
        session_id: &SessionId,
        pub_user_id: &str,
        selected: &[Offer],
        timestamp: DateTime<Utc>,
    ) -> Self {
        let campaigns: Vec<Value> = selected.iter().map(webhook_campaign).collect();
        Self {
            source: WebhookSource::Local,
            method: "POST",
            endpoint: WEBHOOK_PREVIEW_ENDPOINT.to_string(),
            payload: json!({
                "campaigns": campaigns,
                "pub_user_id": pub_user_id,
                "session_id": session_id,
                "timestamp": timestamp.to_rfc3339(),
            }),
        }
    }

    fn server(payload: Value) -> Self {
        Self {
            source: WebhookSource::Server,
            method: "POST",
            endpoint: WEBHOOK_PREVIEW_ENDPOINT.to_string(),
            payload,
        }
    }
}

fn webhook_campaign(offer: &Offer) -> Value {
    let mut campaign = Map::new();
    campaign.insert("campaign_id".into(), json!(offer.campaign_id));
    campaign.insert("advertiser_name".into(), json!(offer.advertiser()));
    campaign.insert("title".into(), json!(offer.display_title()));
    campaign.insert("description".into(), json!(offer.display_description()));
    if let Some(image) = offer.image_url() {
        campaign.insert("image".into(), json!(image));
    }
    if let Some(cta) = offer.cta_yes.as_ref().or(offer.cta_text.as_ref()) {
        campaign.insert("cta_yes".into(), json!(cta));
    }
    for field in WEBHOOK_OFFER_FIELDS {
        if let Some(value) = offer.extra.get(*field) {
            campaign.insert((*field).to_string(), value.clone());
        }
    }
    Value::Object(campaign)
}

/// Result of a successful wrap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WrapReceipt {
    pub session_id: SessionId,
    pub selected_campaigns: Vec<CampaignId>,
    pub response: ApiResponse,
    pub webhook: WebhookPreview,
}

impl WrapReceipt {
    /// Uses the webhook payload from the response when the server sent one.
    pub fn new(
        session_id: SessionId,
        identity: &Identity,
        selected: Vec<Offer>,
        response: ApiResponse,
    ) -> Self {
        let webhook = match webhook_from_wrap_body(&response.body) {
            Some(payload) => WebhookPreview::server(payload),
            None => WebhookPreview::local(&session_id, &identity.pub_user_id, &selected, Utc::now()),
        };
        Self {
            selected_campaigns: selected.iter().filter_map(|offer| offer.campaign_id).collect(),
            session_id,
            response,
            webhook,
        }
    }
}

/// Differences between the local selection and what the server holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionDrift {
    /// Selected locally, unknown to the server.
    pub missing_on_server: BTreeSet<CampaignId>,
    /// Held by the server, not selected locally.
    pub only_on_server: BTreeSet<CampaignId>,
}

impl SelectionDrift {
    pub fn is_empty(&self) -> bool {
        self.missing_on_server.is_empty() && self.only_on_server.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetails {
    pub session_id: SessionId,
    pub selected_campaigns: BTreeSet<CampaignId>,
    pub raw: Value,
}

impl SessionDetails {
    pub fn new(session_id: SessionId, payload: SessionDetailsPayload) -> Self {
        Self {
            session_id,
            selected_campaigns: payload.selected_campaigns.into_iter().collect(),
            raw: payload.raw,
        }
    }

    pub fn drift(&self, local: &BTreeSet<CampaignId>) -> SelectionDrift {
        SelectionDrift {
            missing_on_server: local.difference(&self.selected_campaigns).copied().collect(),
            only_on_server: self.selected_campaigns.difference(local).copied().collect(),
        }
    }
}
