use std::fs;

use bluesky_rs::config::{ConfigOverrides, LoggingOverrides, MergeOverrides};
use bluesky_rs::model::RecordDraft;
use bluesky_rs::{
    BatchRequest, Bluesky, BlueskyConfig, Interval, MatchMode, OrganizationId, Precedence,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn parse_precedence(value: Option<String>) -> anyhow::Result<Option<Precedence>> {
    match value.as_deref() {
        None => Ok(None),
        Some("favor-new") => Ok(Some(Precedence::FavorNew)),
        Some("favor-existing") => Ok(Some(Precedence::FavorExisting)),
        Some(other) => anyhow::bail!("unknown precedence `{}`", other),
    }
}

fn parse_instant(flag: &str) -> anyhow::Result<OffsetDateTime> {
    let raw = parse_arg(flag).ok_or_else(|| anyhow::anyhow!("{} is required with --cycle", flag))?;
    Ok(OffsetDateTime::parse(&raw, &Rfc3339)?)
}

/// Drafts are a JSON array; rows without an organization inherit the one
/// given on the command line.
fn load_drafts(path: &str, organization: OrganizationId) -> anyhow::Result<Vec<RecordDraft>> {
    let raw = fs::read_to_string(path)?;
    let drafts: Vec<RecordDraft> = serde_json::from_str(&raw)?;
    Ok(drafts
        .into_iter()
        .map(|draft| match draft.organization {
            Some(_) => draft,
            None => draft.with_organization(organization),
        })
        .collect())
}

fn main() -> anyhow::Result<()> {
    let input = parse_arg("--input").ok_or_else(|| anyhow::anyhow!("--input is required"))?;
    let config_path = parse_arg("--config");
    let organization = OrganizationId(
        parse_arg("--organization")
            .unwrap_or_else(|| "1".to_string())
            .parse()?,
    );
    let batch_name = parse_arg("--batch-name").unwrap_or_else(|| input.clone());
    let mode = if has_flag("--force-new") {
        MatchMode::ForceNew
    } else {
        MatchMode::Reconcile
    };

    let overrides = ConfigOverrides {
        merge: parse_precedence(parse_arg("--precedence"))?.map(|precedence| MergeOverrides {
            precedence: Some(precedence),
        }),
        logging: parse_arg("--log").map(|filter| LoggingOverrides {
            filter: Some(filter),
        }),
        ..ConfigOverrides::default()
    };
    let config = BlueskyConfig::load(config_path.as_deref(), overrides)?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .with_writer(std::io::stderr)
        .init();

    let drafts = load_drafts(&input, organization)?;
    let engine = Bluesky::new(config)?;
    let batch = engine.open_batch(organization, &batch_name)?;
    let mut request = BatchRequest::new(organization, batch, drafts).with_mode(mode);

    if let Some(name) = parse_arg("--cycle") {
        let period = Interval::from_utc_datetimes(
            parse_instant("--cycle-start")?,
            parse_instant("--cycle-end")?,
        )?;
        let cycle = engine.create_cycle(organization, &name, period)?;
        request = request.with_cycle(cycle);
    }

    info!(%organization, batch = %batch, input = %input, "importing");
    let report = engine.ingest(request)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}
