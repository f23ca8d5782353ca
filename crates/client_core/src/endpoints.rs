use shared::{
    domain::{CampaignId, SessionId},
    protocol::SessionDetailsQuery,
};
use url::Url;

/// URL builder for the offers API. Path segments are percent-encoded, so a
/// session id can never escape its segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
    offers_path: Vec<String>,
    session_prefix: Vec<String>,
}

impl Endpoints {
    pub fn new(base_url: &str, offers_path: &str, session_prefix: &str) -> Result<Self, String> {
        let base = Url::parse(base_url.trim())
            .map_err(|err| format!("invalid api base url '{base_url}': {err}"))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(format!(
                "api base url must be an http(s) url, got '{base_url}'"
            ));
        }
        Ok(Self {
            base,
            offers_path: split_path(offers_path),
            session_prefix: split_path(session_prefix),
        })
    }

    pub fn offers(&self) -> String {
        self.build(self.offers_path.iter().map(String::as_str))
            .to_string()
    }

    pub fn selection(&self, session_id: &SessionId, campaign_id: CampaignId, selected: bool) -> String {
        let campaign = campaign_id.to_string();
        let action = if selected { "select.json" } else { "unselect.json" };
        self.build(
            self.session_prefix
                .iter()
                .map(String::as_str)
                .chain([session_id.as_str(), campaign.as_str(), action]),
        )
        .to_string()
    }

    /// Shared by bulk selection and wrap.
    pub fn session(&self, session_id: &SessionId) -> String {
        self.session_url(session_id).to_string()
    }

    pub fn session_details(&self, session_id: &SessionId, query: &SessionDetailsQuery) -> String {
        let mut url = self.session_url(session_id);
        url.query_pairs_mut()
            .append_pair("key", &query.key)
            .append_pair("pub_user_id", &query.pub_user_id);
        url.to_string()
    }

    fn session_url(&self, session_id: &SessionId) -> Url {
        let file = format!("{}.json", session_id.as_str());
        self.build(
            self.session_prefix
                .iter()
                .map(String::as_str)
                .chain(["session", file.as_str()]),
        )
    }

    fn build<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}
