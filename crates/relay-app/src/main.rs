use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use relay_config::{FileSettingsSource, NotifyConfigToml, RelayConfig};
use relay_core::{BlobStore, CoreError, Environment, HistoryKind, HousekeepingFilter};
use relay_dedup::{DedupGuard, IntakePipeline, IntakePolicy};
use relay_history::DeliveryTracker;
use relay_ledger::{
    IdentifierLedger, InMemoryBlobStore, LedgerStore, SnapshotLedger, SqliteBlobStore,
};
use relay_notify::{FlowRule, FlowRules, NotificationDispatcher, NotifySettings};
use relay_scheduler::{MonitorCycle, PollingScheduler};
use tokio::sync::watch;

mod inbox;
mod outbox;
mod source;

use inbox::{run_intake_pass, spawn_intake_loop, InboxSpool};
use outbox::OutboxMailSender;
use source::{HttpAttachmentSource, HttpHistorySource, HttpTicketCreator};

const LOG_FILE_NAME: &str = "ticket-relay.log";

#[derive(Debug, Default, PartialEq, Eq)]
struct CliFlags {
    config_path: Option<PathBuf>,
    once: bool,
    log_stderr: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli_flags()?;
    let config_path = match cli.config_path {
        Some(path) => path,
        None => relay_config::config_path_from_env()?,
    };
    let config = relay_config::load_from_path(&config_path)?;
    if cli.log_stderr {
        init_stderr_logging();
    } else {
        init_file_logging(&config.log_dir())?;
    }
    tracing::info!(config = %config_path.display(), "ticket relay starting");

    let store = open_ledger(&config)?;
    let scheduler = build_scheduler(&config, &config_path, store.clone())?;
    let intake = build_intake(&config, store)?;

    if cli.once {
        if let Some((pipeline, spool)) = &intake {
            let report = run_intake_pass(pipeline, spool).await?;
            println!(
                "intake: created={} duplicates={} ignored={} retry={} unreadable={}",
                report.created, report.duplicates, report.ignored, report.retry, report.unreadable
            );
        }
        let report = scheduler.run_once().await?;
        println!(
            "monitor: checked={} updated={} notified={} failed={} skipped={}",
            report.checked, report.updated, report.notified, report.failed, report.skipped
        );
        return Ok(());
    }

    scheduler.start().await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let intake_task = intake.map(|(pipeline, spool)| {
        spawn_intake_loop(pipeline, spool, config.intake_poll_interval(), stop_rx)
    });

    tokio::signal::ctrl_c().await.map_err(|error| {
        CoreError::DependencyUnavailable(format!("failed to listen for ctrl-c: {error}"))
    })?;
    tracing::info!("shutdown requested");

    let _ = stop_tx.send(true);
    if let Some(task) = intake_task {
        if let Err(error) = task.await {
            tracing::warn!(error = %error, "intake task ended abnormally");
        }
    }
    scheduler.stop().await?;

    Ok(())
}

fn open_ledger(config: &RelayConfig) -> Result<LedgerStore, CoreError> {
    let blob: Arc<dyn BlobStore> = if config.uses_memory_storage() {
        tracing::warn!("using in-memory ledger; delivery state is lost on exit");
        Arc::new(InMemoryBlobStore::new())
    } else {
        let path = config.sqlite_path();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                CoreError::Configuration(format!(
                    "failed to create ledger directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
        Arc::new(SqliteBlobStore::open(&path)?)
    };
    Ok(LedgerStore::new(blob))
}

fn build_intake(
    config: &RelayConfig,
    store: LedgerStore,
) -> Result<Option<(Arc<IntakePipeline>, InboxSpool)>, CoreError> {
    if !config.intake.enabled {
        tracing::info!("email intake disabled");
        return Ok(None);
    }

    let guard = DedupGuard::new(
        &config.dedup_rules(),
        &config.dedup.allowed_senders,
        IdentifierLedger::new(store.clone()),
    );
    let creator = HttpTicketCreator::from_config(
        &config.source,
        Environment::new(config.intake.environment.clone()),
        config.source_timeout(),
    )?;
    let policy = IntakePolicy {
        blocked_senders: config.intake.blocked_senders.clone(),
        allowed_domains: config.intake.allowed_domains.clone(),
    };
    tracing::info!(
        rules = guard.rule_count(),
        inbox = %config.inbox_dir().display(),
        "email intake enabled"
    );

    let pipeline = IntakePipeline::new(guard, SnapshotLedger::new(store), Arc::new(creator), policy);
    Ok(Some((Arc::new(pipeline), InboxSpool::new(config.inbox_dir()))))
}

fn build_scheduler(
    config: &RelayConfig,
    config_path: &Path,
    store: LedgerStore,
) -> Result<PollingScheduler, CoreError> {
    let snapshots = SnapshotLedger::new(store);

    let timeout = config.source_timeout();
    let history = Arc::new(HttpHistorySource::from_config(&config.source, timeout)?);
    let attachments = Arc::new(HttpAttachmentSource::from_config(&config.source, timeout)?);
    let mail = Arc::new(OutboxMailSender::new(config.outbox_dir()));

    let dispatcher = NotificationDispatcher::new(
        mail,
        attachments,
        DeliveryTracker::new(snapshots.clone()),
        flow_rules_from(&config.notify)?,
        NotifySettings {
            max_items: config.notify.max_items,
            ticket_link_template: config.ticket_link_template(),
        },
    );
    let cycle = MonitorCycle::new(
        history,
        snapshots,
        dispatcher,
        HousekeepingFilter::new(config.monitor.housekeeping_marker.clone()),
    );

    Ok(PollingScheduler::new(
        Arc::new(cycle),
        Arc::new(FileSettingsSource::new(config_path)),
    ))
}

fn flow_rules_from(notify: &NotifyConfigToml) -> Result<FlowRules, CoreError> {
    let mut rules = FlowRules::new();
    for entry in &notify.flow {
        let rule = FlowRule {
            skip: entry.skip,
            step_description: entry.step_description.clone(),
            show_comment: entry.show_comment,
            show_assignees: entry.show_assignees,
        };
        match (entry.state_name.as_deref(), entry.kind.as_deref()) {
            (Some(state_name), None) => rules.insert_state_rule(state_name, rule),
            (None, Some(kind)) => {
                let kind = HistoryKind::from_key(kind).ok_or_else(|| {
                    CoreError::Configuration(format!("unknown flow rule kind '{kind}'"))
                })?;
                rules.insert_kind_rule(kind, rule);
            }
            _ => {
                return Err(CoreError::Configuration(
                    "each notify.flow entry needs exactly one of state_name or kind".to_owned(),
                ))
            }
        }
    }
    Ok(rules)
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn init_file_logging(log_dir: &Path) -> Result<(), CoreError> {
    std::fs::create_dir_all(log_dir).map_err(|error| {
        CoreError::Configuration(format!(
            "failed to create log directory '{}': {error}",
            log_dir.display()
        ))
    })?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|error| {
            CoreError::Configuration(format!(
                "failed to open log file '{}': {error}",
                log_path.display()
            ))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

fn parse_cli_flags() -> Result<CliFlags, CoreError> {
    parse_cli_args(std::env::args().skip(1))
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliFlags, CoreError> {
    let mut flags = CliFlags::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            "--once" => flags.once = true,
            "--log-stderr" => flags.log_stderr = true,
            "--config" => {
                let value = read_cli_value(&mut args, "--config")?;
                flags.config_path = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--config=") => {
                let value = arg.trim_start_matches("--config=");
                if value.trim().is_empty() {
                    return Err(CoreError::Configuration(
                        "--config requires a path".to_owned(),
                    ));
                }
                flags.config_path = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--") => {
                return Err(CoreError::Configuration(format!(
                    "unknown flag '{arg}'. Run with --help for usage."
                )))
            }
            _ => {
                return Err(CoreError::Configuration(format!(
                    "unexpected argument '{arg}'. Run with --help for usage."
                )))
            }
        }
    }
    Ok(flags)
}

fn read_cli_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, CoreError> {
    match args.next() {
        Some(value) if !value.starts_with("--") && !value.trim().is_empty() => Ok(value),
        _ => Err(CoreError::Configuration(format!("{flag} requires a value"))),
    }
}

fn print_cli_help() {
    println!("ticket-relay");
    println!();
    println!("Opens tickets from spooled inbound mail without duplicates, watches ticket");
    println!("histories and mails undelivered updates to the requester.");
    println!();
    println!("Usage:");
    println!("  ticket-relay [--config <path>] [--once] [--log-stderr]");
    println!();
    println!("Options:");
    println!("  --config <path>   Config file (default: $RELAY_CONFIG or ~/.config/ticket-relay/config.toml)");
    println!("  --once            Run one intake pass and one monitoring cycle, then exit");
    println!("  --log-stderr      Log to stderr instead of the data directory");
    println!("  -h, --help        Print this help");
}
