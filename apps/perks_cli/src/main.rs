use std::{fmt::Write as _, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings_from, BulkOutcome, CatalogSummary, ControllerError, ControllerSnapshot,
    LogEntry, SelectionController, SelectionOutcome, SessionDetails, WrapReceipt,
};
use serde_json::json;
use shared::domain::{CampaignId, Identity};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs one offer selection session against the perks API.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    pub_user_id: String,
    /// Overrides the configured API base URL.
    #[arg(long)]
    base_url: Option<String>,
    /// Settings file; defaults to ./perks.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long = "select", value_name = "CAMPAIGN_ID")]
    select: Vec<i64>,
    #[arg(long = "unselect", value_name = "CAMPAIGN_ID")]
    unselect: Vec<i64>,
    #[arg(long, conflicts_with = "unselect_all")]
    select_all: bool,
    #[arg(long)]
    unselect_all: bool,
    /// Read the server-side session after the selection steps.
    #[arg(long)]
    details: bool,
    /// Finalize the session once everything else has run.
    #[arg(long)]
    wrap: bool,
    /// Print the final state and activity log as JSON.
    #[arg(long)]
    json: bool,
}

/// Everything one run produced, including the failure that ended it early.
struct SessionReport {
    summary: Option<CatalogSummary>,
    steps: Vec<String>,
    snapshot: ControllerSnapshot,
    details: Option<SessionDetails>,
    receipt: Option<WrapReceipt>,
    log: Vec<LogEntry>,
    failure: Option<ControllerError>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings =
        load_settings_from(args.config.as_deref()).context("failed to load settings")?;
    if let Some(base_url) = &args.base_url {
        settings.api_base_url = base_url.clone();
        settings.endpoints()?;
    }
    info!(api_base_url = %settings.api_base_url, "perks_cli: starting session");

    let controller = SelectionController::new(&settings)?;
    let identity = Identity::new(&args.api_key, &args.pub_user_id);
    let report = run_session(&controller, identity, &args).await;

    let output = if args.json {
        render_json(&report)?
    } else {
        render_text(&report, args.wrap)?
    };
    print!("{output}");

    match report.failure {
        Some(failure) => Err(failure).context("session did not complete"),
        None => Ok(()),
    }
}

/// Drives the requested steps. A failed fetch skips the rest; the log and
/// state collected so far are still returned.
async fn run_session(
    controller: &Arc<SelectionController>,
    identity: Identity,
    args: &Args,
) -> SessionReport {
    let mut steps = Vec::new();
    let mut details = None;
    let mut receipt = None;
    let mut failure = None;

    let summary = match controller.start(identity).await {
        Ok(summary) => Some(summary),
        Err(err) => {
            warn!(error = %err, "perks_cli: catalog unavailable");
            failure = Some(err);
            None
        }
    };
    controller.join_background().await;

    if summary.is_some() {
        if args.select_all || args.unselect_all {
            let outcome = controller.set_all_selection(args.select_all).await;
            steps.push(describe_bulk(args.select_all, &outcome));
        }
        let toggles = args
            .select
            .iter()
            .map(|id| (*id, true))
            .chain(args.unselect.iter().map(|id| (*id, false)));
        for (id, selected) in toggles {
            let outcome = controller.set_selection(CampaignId(id), selected).await;
            steps.push(describe_toggle(CampaignId(id), selected, &outcome));
        }

        if args.details {
            match controller.get_session_details().await {
                Ok(found) => details = found,
                Err(err) => warn!(error = %err, "perks_cli: session details unavailable"),
            }
        }
        if args.wrap {
            match controller.wrap_session().await {
                Ok(wrapped) => receipt = wrapped,
                Err(err) => {
                    warn!(error = %err, "perks_cli: wrap failed");
                    failure = Some(err);
                }
            }
        }
    }

    SessionReport {
        summary,
        steps,
        snapshot: controller.snapshot().await,
        details,
        receipt,
        log: controller.activity_log().await,
        failure,
    }
}

fn render_json(report: &SessionReport) -> Result<String> {
    let drift = report
        .details
        .as_ref()
        .map(|details| details.drift(&report.snapshot.selected_ids));
    let mut out = serde_json::to_string_pretty(&json!({
        "summary": report.summary,
        "state": report.snapshot,
        "session_details": report.details,
        "drift": drift,
        "wrap": report.receipt,
        "error": report.failure.as_ref().map(ToString::to_string),
        "activity_log": report.log,
    }))?;
    out.push('\n');
    Ok(out)
}

fn render_text(report: &SessionReport, wrap_requested: bool) -> Result<String> {
    let mut out = String::new();
    if let Some(summary) = &report.summary {
        writeln!(
            out,
            "Fetched {} offers ({} selectable), session {}",
            summary.offer_count,
            summary.selectable_count,
            summary
                .session_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "<none>".into())
        )?;
        if summary.auto_selection_applied {
            writeln!(out, "Session settings auto-selected every offer")?;
        }
    }
    for step in &report.steps {
        writeln!(out, "{step}")?;
    }

    write_offers(&mut out, &report.snapshot)?;
    if let Some(details) = &report.details {
        let drift = details.drift(&report.snapshot.selected_ids);
        if drift.is_empty() {
            writeln!(out, "Server selection matches local selection")?;
        } else {
            writeln!(
                out,
                "Selection drift: missing on server {:?}, only on server {:?}",
                drift.missing_on_server, drift.only_on_server
            )?;
        }
    }
    if let Some(receipt) = &report.receipt {
        writeln!(
            out,
            "Wrapped session {} with {} offers",
            receipt.session_id,
            receipt.selected_campaigns.len()
        )?;
        writeln!(
            out,
            "Webhook ({:?}) {} {}:\n{}",
            receipt.webhook.source,
            receipt.webhook.method,
            receipt.webhook.endpoint,
            serde_json::to_string_pretty(&receipt.webhook.payload)?
        )?;
    } else if wrap_requested && report.failure.is_none() {
        writeln!(out, "No session to wrap")?;
    }
    if let Some(failure) = &report.failure {
        writeln!(out, "Failed: {failure}")?;
    }
    write_log(&mut out, &report.log)?;
    Ok(out)
}

fn describe_bulk(select_all: bool, outcome: &BulkOutcome) -> String {
    let verb = if select_all { "Selected" } else { "Unselected" };
    match outcome {
        BulkOutcome::Skipped => format!("{verb} nothing: no session or no offers"),
        BulkOutcome::Confirmed { count } => format!("{verb} {count} offers"),
        BulkOutcome::Unconfirmed { count, error } => {
            format!("{verb} {count} offers locally; server did not confirm: {error}")
        }
    }
}

fn describe_toggle(campaign_id: CampaignId, selected: bool, outcome: &SelectionOutcome) -> String {
    let verb = if selected { "select" } else { "unselect" };
    match outcome {
        SelectionOutcome::Skipped => format!("Skipped {verb} of {campaign_id}"),
        SelectionOutcome::Confirmed => format!("Confirmed {verb} of {campaign_id}"),
        SelectionOutcome::Reverted { error } => {
            format!("Reverted {verb} of {campaign_id}: {error}")
        }
        SelectionOutcome::Discarded => format!("Discarded {verb} of {campaign_id}"),
    }
}

fn write_offers(out: &mut String, snapshot: &ControllerSnapshot) -> std::fmt::Result {
    writeln!(out, "Offers:")?;
    for offer in &snapshot.offers {
        let mark = match offer.campaign_id {
            Some(id) if snapshot.is_selected(id) => "[x]",
            Some(_) => "[ ]",
            None => " - ",
        };
        let id = offer
            .campaign_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        writeln!(
            out,
            "  {mark} {id:>8}  {} ({})",
            offer.display_title(),
            offer.advertiser()
        )?;
    }
    Ok(())
}

fn write_log(out: &mut String, log: &[LogEntry]) -> std::fmt::Result {
    writeln!(out, "Activity (newest first):")?;
    for entry in log {
        let status = entry
            .response
            .as_ref()
            .map(|response| response.status.to_string())
            .unwrap_or_else(|| "---".into());
        writeln!(
            out,
            "  {} {:<16} {} {} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.action.as_str(),
            status,
            entry.subject.label(),
            entry.error.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
