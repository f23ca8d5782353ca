pub mod activity_log;
pub mod api;
pub mod config;
pub mod controller;
pub mod endpoints;
pub mod error;
pub mod session;
pub mod transport;

pub use activity_log::{ActivityLog, LogAction, LogEntry, LogSubject};
pub use config::{load_settings, load_settings_from, ClientSettings, SettingsError};
pub use controller::{
    BulkOutcome, CatalogSummary, ControllerEvent, ControllerSnapshot, MutationState, Phase,
    SelectionController, SelectionOutcome,
};
pub use error::{CallError, ControllerError};
pub use session::{SessionDetails, SelectionDrift, WebhookPreview, WebhookSource, WrapReceipt};
pub use transport::{ApiRequest, ApiResponse, ApiTransport, HttpMethod, HttpTransport};
