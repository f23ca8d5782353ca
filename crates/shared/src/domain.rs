use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(CampaignId);

/// Server-issued identifier of one offer-selection session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Returns `None` for blank ids; a blank id never establishes a session.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("API Key is required")]
    MissingApiKey,
    #[error("pub_user_id is required")]
    MissingPubUserId,
}

/// Credentials a session is opened with. The API key doubles as the bearer
/// credential, so `Debug` masks it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub api_key: String,
    pub pub_user_id: String,
}

impl Identity {
    pub fn new(api_key: impl Into<String>, pub_user_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            pub_user_id: pub_user_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.api_key.trim().is_empty() {
            return Err(IdentityError::MissingApiKey);
        }
        if self.pub_user_id.trim().is_empty() {
            return Err(IdentityError::MissingPubUserId);
        }
        Ok(())
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Identity")
            .field("api_key", &format_args!("{visible}***"))
            .field("pub_user_id", &self.pub_user_id)
            .finish()
    }
}

/// One entry of the offer catalog.
///
/// The upstream schema is loose: every known field is optional and anything
/// unrecognised is kept verbatim in `extra` so it survives a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_campaign_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub campaign_id: Option<CampaignId>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub headline: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub short_description: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub advertiser_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub image: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub creative: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub logo: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub cta_text: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub cta_yes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Known fields that must hold text.
const TEXT_FIELDS: &[&str] = &[
    "title",
    "headline",
    "description",
    "short_description",
    "advertiser_name",
    "image",
    "creative",
    "logo",
    "cta_text",
    "cta_yes",
];

impl Offer {
    /// Decodes one catalog entry without ever failing. A known text field
    /// holding another type is left unset and its raw value moves to
    /// `extra`; an entry that is not an object becomes an empty offer.
    pub fn from_value(raw: &Value) -> Self {
        let Value::Object(fields) = raw else {
            return Self::default();
        };
        let mut offer = Self::deserialize(raw).unwrap_or_default();
        for key in TEXT_FIELDS {
            if let Some(value) = fields.get(*key) {
                if !value.is_string() && !value.is_null() {
                    offer.extra.insert((*key).to_string(), value.clone());
                }
            }
        }
        offer
    }

    /// Offers without a campaign id are shown but can never be selected.
    pub fn is_selectable(&self) -> bool {
        self.campaign_id.is_some()
    }

    pub fn display_title(&self) -> &str {
        first_present(&[&self.title, &self.headline]).unwrap_or("Untitled Offer")
    }

    pub fn display_description(&self) -> &str {
        first_present(&[&self.description, &self.short_description])
            .unwrap_or("No description available")
    }

    pub fn image_url(&self) -> Option<&str> {
        first_present(&[&self.image, &self.creative, &self.logo])
    }

    pub fn advertiser(&self) -> &str {
        first_present(&[&self.advertiser_name]).unwrap_or("Unknown Advertiser")
    }
}

fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Ok(Some(text)),
        _ => Ok(None),
    }
}

fn first_present<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|value| value.as_deref())
        .find(|value| !value.trim().is_empty())
}

/// Accepts numbers and numeric strings; zero, negatives and anything else
/// collapse to `None`.
fn deserialize_campaign_id<'de, D>(deserializer: D) -> Result<Option<CampaignId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(campaign_id_from_value))
}

pub fn campaign_id_from_value(value: &Value) -> Option<CampaignId> {
    let id = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (id > 0).then_some(CampaignId(id))
}
