//! Subcommand execution against a live portal session.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use cadex_core::{AddressFields, Entry, PortalConfig, RecordFilter, RecordSorter, ResultRecord};
use cadex_portal::{
    EventSink, PortalClient, PortalEvent, ReqwestTransport, SearchOutcome, SearchSummary,
};
use cadex_store::ReferenceCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cli::{
    AddressArgs, CadArgs, Cli, Commands, OutputArgs, PortalArgs, RefsArgs, SearchCommand,
    SelectionArgs,
};
use crate::display;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.portal)?;
    info!(
        portal = %config.portal_url,
        enrich = ?config.enrich,
        "cadex v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cache = if cli.portal.no_cache {
        None
    } else {
        open_cache(&cli.portal.cache).await
    };

    let (events, rx) = EventSink::channel();
    let printer = spawn_event_printer(rx);
    let transport = Arc::new(ReqwestTransport::new(&config).context("building HTTP client")?);
    let client = Arc::new(PortalClient::new(config, transport, cache, events));

    let connect = client.spawn_connect();
    let timeout = Duration::from_secs(cli.portal.connect_timeout);
    let connected = tokio::time::timeout(timeout, client.session().wait_connected()).await;
    if connected.is_err() {
        connect.abort();
        bail!("portal session not established within {}s", timeout.as_secs());
    }

    let interrupt = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; keeping what was fetched so far");
                client.cancel();
            }
        })
    };

    let result = match cli.command {
        Commands::Refs(args) => refs(&client, &args).await,
        Commands::Search(SearchCommand::Address(args)) => search_address(&client, &args).await,
        Commands::Search(SearchCommand::Cad(args)) => search_cad(&client, &args).await,
    };

    interrupt.abort();
    drop(client);
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    result
}

fn load_config(args: &PortalArgs) -> anyhow::Result<PortalConfig> {
    let base = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => PortalConfig::default(),
    };
    Ok(args.apply(base))
}

/// Open the reference cache; on failure continue without one.
async fn open_cache(path: &Path) -> Option<ReferenceCache> {
    let owned = path.to_path_buf();
    let opened = tokio::task::spawn_blocking(move || ReferenceCache::open(owned))
        .await
        .context("cache task failed")
        .and_then(|r| r.with_context(|| format!("opening cache {}", path.display())));
    match opened {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("continuing without the reference cache: {e:#}");
            None
        }
    }
}

/// Print progress to stderr; notices already go through the log.
fn spawn_event_printer(mut rx: mpsc::UnboundedReceiver<PortalEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PortalEvent::Connected => eprintln!("  Connected to portal"),
                PortalEvent::TotalFound(total) => eprintln!("  Portal reports {total} objects"),
                PortalEvent::Progress {
                    fetched,
                    total,
                    elapsed,
                } => eprintln!("  {fetched}/{total} ({:.1}s)", elapsed.as_secs_f64()),
                PortalEvent::Notice(_) => {}
            }
        }
    })
}

// ── refs ──

async fn refs(client: &PortalClient, args: &RefsArgs) -> anyhow::Result<()> {
    let loader = client.references();
    loader.load_common().await;
    let lists = loader.lists();
    print!("{}", display::entry_list("Subjects", &lists.subjects));
    print!("{}", display::entry_list("Street types", &lists.street_types));

    let Some(subject) = &args.subject else {
        return Ok(());
    };
    loader
        .select_subject(Some(pick(&lists.subjects, subject)))
        .await;
    let lists = loader.lists();
    print!("{}", display::entry_list("Regions", &lists.regions));

    let Some(region) = &args.region else {
        return Ok(());
    };
    loader.select_region(Some(pick(&lists.regions, region))).await;
    let lists = loader.lists();
    print!("{}", display::entry_list("Settlement types", &lists.settlement_types));

    if let Some(settlement_type) = &args.settlement_type {
        loader
            .select_settlement_type(Some(pick(&lists.settlement_types, settlement_type)))
            .await;
    }
    print!("{}", display::entry_list("Settlements", &loader.lists().settlements));
    Ok(())
}

/// Look `code` up in a loaded list; unknown codes are passed through as-is.
fn pick(entries: &[Entry], code: &str) -> Entry {
    entries
        .iter()
        .find(|e| e.code == code)
        .cloned()
        .unwrap_or_else(|| {
            warn!(code, "code not in the loaded reference list");
            Entry::new(code, code)
        })
}

async fn apply_selection(client: &PortalClient, selection: &SelectionArgs) {
    let loader = client.references();
    if selection.subject.is_none() && selection.street_type.is_none() {
        return;
    }
    loader.load_common().await;

    if let Some(code) = &selection.subject {
        let subject = pick(&loader.lists().subjects, code);
        loader.select_subject(Some(subject)).await;
    }
    if let Some(code) = &selection.region {
        let region = pick(&loader.lists().regions, code);
        loader.select_region(Some(region)).await;
    }
    if let Some(code) = &selection.settlement_type {
        let settlement_type = pick(&loader.lists().settlement_types, code);
        loader.select_settlement_type(Some(settlement_type)).await;
    }
    if let Some(code) = &selection.settlement {
        loader.select_settlement(Some(pick(&loader.lists().settlements, code)));
    }
    if let Some(code) = &selection.street_type {
        loader.select_street_type(Some(pick(&loader.lists().street_types, code)));
    }
}

// ── search ──

fn completed(outcome: SearchOutcome) -> anyhow::Result<SearchSummary> {
    match outcome {
        SearchOutcome::Completed(summary) => Ok(summary),
        SearchOutcome::Busy => bail!("another search is still running"),
        SearchOutcome::NotConnected => bail!("portal session is not connected"),
        SearchOutcome::Aborted { message } => bail!("search aborted: {message}"),
    }
}

async fn search_address(client: &PortalClient, args: &AddressArgs) -> anyhow::Result<()> {
    apply_selection(client, &args.selection).await;
    let address = AddressFields {
        street: args.street.clone(),
        house: args.house.clone(),
        building: args.building.clone(),
        structure: args.structure.clone(),
        apartment: args.apartment.clone(),
    };
    let summary = completed(client.download_address(&address).await)?;
    print_results(client, &args.output, &summary)
}

async fn search_cad(client: &PortalClient, args: &CadArgs) -> anyhow::Result<()> {
    apply_selection(client, &args.selection).await;

    let mut collected: Option<SearchSummary> = None;
    for input in &args.inputs {
        let summary = match completed(client.download_cad_numbers(input).await) {
            Ok(summary) => summary,
            Err(e) => {
                error!(input = %input, error = %e, "search failed");
                continue;
            }
        };
        let cancelled = summary.cancelled;
        if args.each {
            print_results(client, &args.output, &summary)?;
            client.new_session(true).await;
            apply_selection(client, &args.selection).await;
        }
        collected = Some(match collected {
            Some(total) => merge_summaries(total, summary),
            None => summary,
        });
        if cancelled {
            break;
        }
    }

    let Some(summary) = collected else {
        bail!("no search completed");
    };
    if !args.each {
        print_results(client, &args.output, &summary)?;
    }
    Ok(())
}

fn merge_summaries(a: SearchSummary, b: SearchSummary) -> SearchSummary {
    SearchSummary {
        total_found: a.total_found + b.total_found,
        fetched: a.fetched + b.fetched,
        failed_pages: a.failed_pages + b.failed_pages,
        message: b.message.or(a.message),
        cancelled: a.cancelled || b.cancelled,
        elapsed: a.elapsed + b.elapsed,
    }
}

fn print_results(
    client: &PortalClient,
    output: &OutputArgs,
    summary: &SearchSummary,
) -> anyhow::Result<()> {
    let filter = RecordFilter::new(output.filter.as_deref(), output.filter_direction());
    let sorter = RecordSorter::new(output.sort.as_deref(), output.sort_direction());
    let records: Vec<ResultRecord> = client.project(&filter, &sorter);

    if output.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("serialising records")?
        );
    } else if output.details {
        for record in &records {
            println!("{}", display::record_card(record));
        }
    } else {
        print!("{}", display::record_lines(&records));
    }
    eprintln!(
        "{}",
        display::summary(summary, records.len(), chrono::Local::now())
    );
    Ok(())
}
