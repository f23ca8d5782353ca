use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{campaign_id_from_value, CampaignId, Identity, Offer, SessionId};

/// Placement and targeting fields sent alongside the identity on catalog fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targeting {
    pub placement: String,
    pub user_agent: String,
    pub ip: String,
    pub fingerprint: String,
    pub country: String,
    pub dev: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffersRequest {
    pub key: String,
    pub pub_user_id: String,
    pub placement: String,
    pub user_agent: String,
    pub ip: String,
    pub fingerprint: String,
    pub membership_id: String,
    pub country: String,
    pub dev: u8,
}

impl OffersRequest {
    pub fn new(identity: &Identity, targeting: &Targeting) -> Self {
        Self {
            key: identity.api_key.clone(),
            pub_user_id: identity.pub_user_id.clone(),
            placement: targeting.placement.clone(),
            user_agent: targeting.user_agent.clone(),
            ip: targeting.ip.clone(),
            fingerprint: targeting.fingerprint.clone(),
            membership_id: identity.pub_user_id.clone(),
            country: targeting.country.clone(),
            dev: targeting.dev,
        }
    }
}

/// Body of the single-offer select/unselect call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub key: String,
    pub pub_user_id: String,
}

impl SelectionRequest {
    pub fn new(identity: &Identity) -> Self {
        Self {
            key: identity.api_key.clone(),
            pub_user_id: identity.pub_user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkChange {
    SelectedCampaigns(Vec<CampaignId>),
    UnselectedCampaigns(Vec<CampaignId>),
}

impl BulkChange {
    pub fn campaigns(&self) -> &[CampaignId] {
        match self {
            Self::SelectedCampaigns(ids) | Self::UnselectedCampaigns(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSelectionRequest {
    pub key: String,
    pub pub_user_id: String,
    #[serde(flatten)]
    pub change: BulkChange,
}

impl BulkSelectionRequest {
    pub fn new(identity: &Identity, change: BulkChange) -> Self {
        Self {
            key: identity.api_key.clone(),
            pub_user_id: identity.pub_user_id.clone(),
            change,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Wrap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapRequest {
    pub key: String,
    pub pub_user_id: String,
    pub action: SessionAction,
}

impl WrapRequest {
    pub fn new(identity: &Identity) -> Self {
        Self {
            key: identity.api_key.clone(),
            pub_user_id: identity.pub_user_id.clone(),
            action: SessionAction::Wrap,
        }
    }
}

/// Query string of the session details GET.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetailsQuery {
    pub key: String,
    pub pub_user_id: String,
}

impl SessionDetailsQuery {
    pub fn new(identity: &Identity) -> Self {
        Self {
            key: identity.api_key.clone(),
            pub_user_id: identity.pub_user_id.clone(),
        }
    }
}

/// What the catalog fetch yields once the envelope has been unwrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct OffersPayload {
    pub offers: Vec<Offer>,
    pub session_id: Option<SessionId>,
    pub auto_select_all: bool,
}

impl OffersPayload {
    /// Reads `data.*` first and falls back to top-level fields. A missing
    /// offers array is an empty catalog, not an error; a malformed entry is
    /// kept as a degraded offer.
    pub fn from_body(body: &Value) -> Result<Self, serde_json::Error> {
        let offers = match lookup(body, &["/data/offers", "/offers"]) {
            None => Vec::new(),
            Some(raw) => Vec::<Value>::deserialize(raw)?
                .iter()
                .map(Offer::from_value)
                .collect(),
        };

        let session_id = lookup(body, &["/data/session_id", "/session_id"]).and_then(|raw| {
            match raw {
                Value::String(text) => SessionId::parse(text.clone()),
                Value::Number(number) => SessionId::parse(number.to_string()),
                _ => None,
            }
        });

        let auto_select_all = lookup(
            body,
            &[
                "/data/settings/usp_all_offers_checked",
                "/settings/usp_all_offers_checked",
            ],
        )
        .is_some_and(is_truthy);

        Ok(Self {
            offers,
            session_id,
            auto_select_all,
        })
    }
}

/// Server-side view of a session as returned by the details GET.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetailsPayload {
    pub selected_campaigns: Vec<CampaignId>,
    pub raw: Value,
}

impl SessionDetailsPayload {
    pub fn from_body(body: &Value) -> Self {
        let selected_campaigns = lookup(
            body,
            &[
                "/data/selected_campaigns",
                "/selected_campaigns",
                "/data/session/selected_campaigns",
            ],
        )
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(map) => map.get("campaign_id").and_then(campaign_id_from_value),
                    other => campaign_id_from_value(other),
                })
                .collect()
        })
        .unwrap_or_default();

        Self {
            selected_campaigns,
            raw: body.clone(),
        }
    }
}

/// Webhook payload the server may echo back on wrap.
pub fn webhook_from_wrap_body(body: &Value) -> Option<Value> {
    lookup(
        body,
        &["/data/webhook", "/webhook", "/data/webhook_preview", "/webhook_preview"],
    )
    .filter(|value| !value.is_null())
    .cloned()
}

/// First candidate holding something; null and blank strings fall through.
fn lookup<'a>(body: &'a Value, pointers: &[&str]) -> Option<&'a Value> {
    pointers
        .iter()
        .filter_map(|pointer| body.pointer(pointer))
        .find(|value| !is_blank(value))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}
