//! Main Entrypoint for the Chatstream Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and applying CLI overrides.
//! 2. Opening the conversation store and running migrations.
//! 3. Spawning a session over the configured transport.
//! 4. Running a line-oriented prompt until `/quit` or end of input.

use anyhow::Context;
use chatstream_client::{
    config::{Config, TransportKind},
    session::SessionHandle,
    state::SessionContext,
    store::{ConversationStore, SqliteStore},
};
use chatstream_core::{ConversationId, Mode, PresentationEvent, Scope, TranscriptEntry};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Interactive client for a streaming conversational query service.
#[derive(Parser, Debug)]
#[command(name = "chatstream", version, about)]
struct Cli {
    /// Transport to use (duplex or push). Overrides CHATSTREAM_TRANSPORT.
    #[arg(long)]
    transport: Option<TransportKind>,
    /// Service endpoint for the chosen transport.
    #[arg(long)]
    url: Option<String>,
    /// Caller identity. Overrides CHATSTREAM_CALLER_ID.
    #[arg(long)]
    caller_id: Option<String>,
    /// Conversation database. Overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    /// Initial query scope.
    #[arg(long, default_value = Scope::ALL)]
    scope: String,
    /// Initial answer mode (list, summarize or generate).
    #[arg(long, default_value_t = Mode::List)]
    mode: Mode,
}

/// One parsed prompt line.
enum Input {
    New(Option<String>),
    Load(ConversationId),
    Join(ConversationId),
    List,
    Scope(Scope),
    Mode(Mode),
    Snapshot,
    Quit,
    Query(String),
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return Input::Query(line.to_string());
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("new", "") => Input::New(None),
        ("new", title) => Input::New(Some(title.to_string())),
        ("load", id) if !id.is_empty() => Input::Load(ConversationId::new(id)),
        ("join", id) if !id.is_empty() => Input::Join(ConversationId::new(id)),
        ("list", _) => Input::List,
        ("scope", scope) if !scope.is_empty() => Input::Scope(Scope::new(scope)),
        ("mode", mode) => match mode.parse::<Mode>() {
            Ok(mode) => Input::Mode(mode),
            Err(e) => Input::Invalid(e),
        },
        ("snapshot", _) => Input::Snapshot,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Invalid(format!("unknown command '/{name}'")),
    }
}

fn render(event: &PresentationEvent) -> Option<String> {
    let line = match event {
        PresentationEvent::QueryEcho {
            text,
            caller_id,
            own,
        } => {
            if *own {
                format!("> {text}")
            } else {
                format!("[{caller_id}] > {text}")
            }
        }
        PresentationEvent::BlockStarted { query, .. } => {
            format!("... searching{}", query.as_deref().map(|q| format!(" for '{q}'")).unwrap_or_default())
        }
        PresentationEvent::ItemReceived { item, best, .. } => format!(
            "  {} {:>6} {}",
            if *best { "*" } else { " " },
            item.item
                .score
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "-".into()),
            item.item.payload
        ),
        PresentationEvent::DomainsComplete { .. } => "  (all domains answered)".into(),
        PresentationEvent::BlockFinalized { block } => {
            let mut out = format!("== {} result(s), ranked:", block.items.len());
            for (rank, ranked) in block.items.iter().enumerate() {
                out.push_str(&format!("\n  {:>2}. {}", rank + 1, ranked.item.payload));
            }
            out
        }
        PresentationEvent::NoResults { query, .. } => format!(
            "== no results{}",
            query.as_deref().map(|q| format!(" for '{q}'")).unwrap_or_default()
        ),
        PresentationEvent::Failure { reason } => format!("!! {reason}"),
        PresentationEvent::HistoryLoaded { entries } => {
            let queries = entries
                .iter()
                .filter(|e| matches!(e, TranscriptEntry::Query { .. }))
                .count();
            format!("-- history: {} entries, {} queries", entries.len(), queries)
        }
        PresentationEvent::ParticipantJoined { participant } => format!(
            "-- {} joined",
            participant.name.as_deref().unwrap_or(&participant.id)
        ),
        PresentationEvent::ParticipantLeft { participant } => format!(
            "-- {} left",
            participant.name.as_deref().unwrap_or(&participant.id)
        ),
        PresentationEvent::SitesAvailable { sites } => format!("-- sites: {}", sites.join(", ")),
        PresentationEvent::ConversationStarted { conversation_id } => {
            format!("-- conversation {conversation_id}")
        }
        PresentationEvent::ConversationLoaded {
            conversation_id,
            entries,
        } => format!("-- loaded {conversation_id} ({entries} entries)"),
        PresentationEvent::ConnectionLost { attempts } => {
            format!("!! connection lost after {attempts} attempts")
        }
        PresentationEvent::StateChanged { .. } => return None,
    };
    Some(line)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(url) = cli.url {
        match config.transport {
            TransportKind::Duplex => config.ws_url = Some(url),
            TransportKind::Push => config.http_url = Some(url),
        }
    }
    if let Some(caller_id) = cli.caller_id {
        config.caller_id = caller_id;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    config.validate().context("Invalid configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(transport = %config.transport, caller_id = %config.caller_id, "Configuration loaded.");

    // --- 3. Initialize Store ---
    let store: Arc<dyn ConversationStore> = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .context("Failed to open conversation store")?,
    );

    // --- 4. Start Session ---
    let session = SessionHandle::spawn(SessionContext::from_config(&config, store.clone()));
    let mut events = session.observe()?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render(&event) {
                println!("{line}");
            }
        }
    });

    // --- 5. Prompt Loop ---
    let mut scope = Scope::new(cli.scope);
    let mut mode = cli.mode;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_input(&line) {
            Input::Query(text) => session.send_query(text, scope.clone(), mode)?,
            Input::New(title) => {
                let id = session.create_conversation(title).await?;
                println!("-- new conversation {id}");
            }
            Input::Load(id) => match session.load_conversation(id).await {
                Ok(_) => {}
                Err(e) => println!("!! {e}"),
            },
            Input::Join(id) => session.join(id)?,
            Input::List => {
                for record in store.list_conversations().await? {
                    println!(
                        "{}  {}  {}",
                        record.id,
                        record.created_at.format("%Y-%m-%d %H:%M"),
                        record.title
                    );
                }
            }
            Input::Scope(next) => {
                println!("-- scope {next}");
                scope = next;
            }
            Input::Mode(next) => {
                println!("-- mode {next}");
                mode = next;
            }
            Input::Snapshot => {
                let snapshot = session.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            Input::Invalid(message) => println!("!! {message}"),
            Input::Quit => break,
        }
    }

    session.teardown().await?;
    drop(session);
    printer.await?;
    info!("Client has shut down.");
    Ok(())
}
