//! Append-only record of every call the controller attempted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use shared::domain::{CampaignId, Offer, SessionId};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::CallError,
    transport::{ApiRequest, ApiResponse, HttpMethod},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    FetchOffers,
    Select,
    Unselect,
    BulkSelect,
    BulkUnselect,
    AutoSelectAll,
    WrapSession,
    SessionDetails,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchOffers => "fetch_offers",
            Self::Select => "select",
            Self::Unselect => "unselect",
            Self::BulkSelect => "bulk_select",
            Self::BulkUnselect => "bulk_unselect",
            Self::AutoSelectAll => "auto_select_all",
            Self::WrapSession => "wrap_session",
            Self::SessionDetails => "session_details",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::FetchOffers => "Fetch the offers available to the user",
            Self::Select => "The user selected a single offer",
            Self::Unselect => "The user unselected a single offer",
            Self::BulkSelect => "The user selected all available offers at once",
            Self::BulkUnselect => "The user unselected all offers at once",
            Self::AutoSelectAll => "Automatically selected all offers based on session settings",
            Self::WrapSession => "Finalize the session and trigger delivery of the selected offers",
            Self::SessionDetails => "Read the current server-side session state",
        }
    }

    /// Message stored on the entry when the call fails.
    fn failure_message(self, error: &CallError) -> String {
        match self {
            Self::AutoSelectAll => format!("auto-select network failure: {error}"),
            _ => error.to_string(),
        }
    }
}

/// What an entry is about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSubject {
    Catalog {
        count: usize,
        session_id: Option<SessionId>,
    },
    Offer {
        campaign_id: CampaignId,
        offer: Option<Offer>,
    },
    Campaigns {
        count: usize,
        campaigns: Vec<CampaignId>,
    },
    Session {
        session_id: SessionId,
    },
}

impl LogSubject {
    pub fn campaigns(campaigns: &[CampaignId]) -> Self {
        Self::Campaigns {
            count: campaigns.len(),
            campaigns: campaigns.to_vec(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Catalog { count, .. } => format!("{count} offers fetched"),
            Self::Offer {
                offer: Some(offer), ..
            } if offer.title.is_some() || offer.headline.is_some() => {
                offer.display_title().to_string()
            }
            Self::Offer { campaign_id, .. } => format!("Campaign {campaign_id}"),
            Self::Campaigns { count, .. } => format!("{count} offers"),
            Self::Session { session_id } => format!("Session {session_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub curl: String,
}

impl From<&ApiRequest> for RequestRecord {
    fn from(request: &ApiRequest) -> Self {
        Self {
            method: request.method,
            endpoint: request.endpoint.clone(),
            body: request.body.clone(),
            curl: request.curl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: LogAction,
    pub subject: LogSubject,
    pub request: RequestRecord,
    pub response: Option<ApiResponse>,
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(
        action: LogAction,
        subject: LogSubject,
        request: &ApiRequest,
        response: Option<ApiResponse>,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            subject,
            request: RequestRecord::from(request),
            response,
            error,
        }
    }

    /// Builds the entry for a finished call. A non-2xx keeps its response
    /// next to the error.
    pub fn from_outcome(
        action: LogAction,
        subject: LogSubject,
        request: &ApiRequest,
        outcome: &Result<ApiResponse, CallError>,
    ) -> Self {
        match outcome {
            Ok(response) => Self::new(action, subject, request, Some(response.clone()), None),
            Err(error) => Self::new(
                action,
                subject,
                request,
                error.response().cloned(),
                Some(action.failure_message(error)),
            ),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Newest-first entry list. Entries are never edited or removed, except that
/// a configured capacity drops the oldest once it is exceeded.
pub struct ActivityLog {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: Option<usize>,
    appended: broadcast::Sender<LogEntry>,
}

impl ActivityLog {
    pub fn new(capacity: Option<usize>) -> Self {
        let (appended, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.filter(|capacity| *capacity > 0),
            appended,
        }
    }

    pub async fn append(&self, entry: LogEntry) {
        if let Some(error) = &entry.error {
            warn!(
                action = entry.action.as_str(),
                endpoint = %entry.request.endpoint,
                status = entry.response.as_ref().map(|response| response.status),
                error = %error,
                "activity: call failed"
            );
        } else {
            debug!(
                action = entry.action.as_str(),
                endpoint = %entry.request.endpoint,
                status = entry.response.as_ref().map(|response| response.status),
                "activity: call succeeded"
            );
        }

        {
            let mut entries = self.entries.write().await;
            entries.push_front(entry.clone());
            if let Some(capacity) = self.capacity {
                entries.truncate(capacity);
            }
        }
        let _ = self.appended.send(entry);
    }

    /// All entries, newest first.
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn count(&self, action: LogAction) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.action == action)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.appended.subscribe()
    }
}
