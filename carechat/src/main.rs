//! `CareChat`: terminal chat client for the caregiver marketplace.
//!
//! Reads commands and messages from stdin and prints conversation events
//! to stdout. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/carechat/config.toml`).
//!
//! ```bash
//! # Sign in as user 7 and open a conversation with caregiver 42
//! cargo run --bin carechat -- --sign-in user_7 --token secret \
//!     --socket-url ws://127.0.0.1:9000/ws --contact caregiver_42
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use carechat::app::AppContext;
use carechat::chat::ChatEvent;
use carechat::config::{CliArgs, ClientConfig};
use carechat::connection::Connector;
use carechat::connection::ws::WsConnector;
use carechat::history::{HistoryApi, RestHistoryClient};
use carechat::notify::terminal::TerminalSink;
use carechat::notify::{NotificationSink, PageState};
use carechat::storage::LocalStore;
use carechat_proto::conversation::ConversationId;

type Context = AppContext<WsConnector, RestHistoryClient, TerminalSink>;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("carechat starting");

    let store = match open_store(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(sign_in) = &cli.sign_in
        && let Err(e) = seed_session(&config, &store, sign_in, &cli)
    {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let connector = match WsConnector::new(&config.socket_url) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let history = match RestHistoryClient::new(
        &config.api_url,
        config.identity.resolver(),
        config.reconnect.connect_timeout,
    ) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let (ctx, events) = AppContext::new(config, store, connector, history, TerminalSink);
    ctx.start();

    let badge = Arc::clone(&ctx);
    tokio::spawn(async move {
        if let Err(e) = badge.refresh_unread().await {
            tracing::warn!(error = %e, "could not fetch unread count");
        }
    });

    let result = run(&ctx, events, cli.contact.as_deref()).await;
    ctx.shutdown();
    tracing::info!("carechat exiting");
    result
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the conversation on
/// stdout. Returns a [`WorkerGuard`] that must be held until shutdown to
/// flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("carechat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn open_store(config: &ClientConfig) -> Result<LocalStore, String> {
    let path = config
        .storage_path
        .clone()
        .or_else(LocalStore::default_path)
        .ok_or_else(|| "no data directory for the local store".to_string())?;
    LocalStore::open(path).map_err(|e| e.to_string())
}

/// Store a session for `--sign-in <type>_<id> --token <t>`.
fn seed_session(
    config: &ClientConfig,
    store: &LocalStore,
    sign_in: &str,
    cli: &CliArgs,
) -> Result<(), String> {
    let party = config
        .identity
        .resolver()
        .resolve(sign_in, None)
        .map_err(|e| e.to_string())?;
    let token = cli
        .token
        .as_deref()
        .ok_or_else(|| "--sign-in requires --token".to_string())?;
    let name = cli.name.clone().unwrap_or_else(|| party.to_string());
    store
        .set_session(
            party.kind,
            json!({"id": party.id.as_str(), "name": name}),
            token,
        )
        .map_err(|e| e.to_string())?;
    tracing::info!(party = %party, "session stored");
    Ok(())
}

/// Line loop: commands and messages in, conversation events out.
async fn run(
    ctx: &Arc<Context>,
    mut events: mpsc::Receiver<ChatEvent>,
    contact: Option<&str>,
) -> io::Result<()> {
    let mut current: Option<ConversationId> = None;
    if let Some(contact) = contact {
        current = open(ctx, contact);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if !handle_line(ctx, &mut current, line.trim()) {
                    return Ok(());
                }
            }
            Some(event) = events.recv() => {
                if let Some(text) = render(&event, &ctx.config().timestamp_format) {
                    println!("{text}");
                }
            }
        }
    }
}

/// Returns `false` to quit.
fn handle_line<C: Connector, H: HistoryApi, S: NotificationSink>(
    ctx: &Arc<AppContext<C, H, S>>,
    current: &mut Option<ConversationId>,
    line: &str,
) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    let arg = arg.trim();

    match command {
        "" => {}
        "/quit" => return false,
        "/open" => {
            if let Some(id) = open(ctx, arg) {
                *current = Some(id);
            }
        }
        "/status" => print_status(ctx, current.as_ref()),
        "/sound" => toggle(arg, "sound", |on| ctx.store().set_sound_enabled(on)),
        "/vibrate" => toggle(arg, "vibration", |on| ctx.store().set_vibration_enabled(on)),
        "/away" => ctx.set_page_state(PageState {
            visible: false,
            focused: false,
        }),
        "/back" => ctx.set_page_state(PageState::default()),
        "/close" | "/min" | "/read" => {
            let Some(id) = current.clone() else {
                println!("no conversation open, use /open <contact>");
                return true;
            };
            let result = match command {
                "/close" => ctx.close(&id).map(|()| {
                    *current = None;
                }),
                "/min" => ctx.toggle_minimize(&id).map(|state| {
                    println!("{id}: {state:?}");
                }),
                _ => ctx.mark_read(&id).map(|n| println!("{n} marked read")),
            };
            if let Err(e) = result {
                println!("{e}");
            }
        }
        _ if command.starts_with('/') => println!("unknown command {command}"),
        _ => match current {
            Some(id) => {
                if let Err(e) = ctx.send(id, line) {
                    tracing::debug!(error = %e, "send failed");
                }
            }
            None => println!("no conversation open, use /open <contact>"),
        },
    }
    true
}

fn open<C: Connector, H: HistoryApi, S: NotificationSink>(
    ctx: &Arc<AppContext<C, H, S>>,
    contact: &str,
) -> Option<ConversationId> {
    match ctx.open(contact, None) {
        Ok(id) => {
            println!("-- {id} --");
            Some(id)
        }
        Err(e) => {
            println!("cannot open {contact}: {e}");
            None
        }
    }
}

fn toggle<E: std::fmt::Display>(arg: &str, what: &str, set: impl FnOnce(bool) -> Result<(), E>) {
    let on = match arg {
        "on" => true,
        "off" => false,
        _ => {
            println!("usage: /{what} on|off");
            return;
        }
    };
    match set(on) {
        Ok(()) => println!("{what} {arg}"),
        Err(e) => println!("could not save preference: {e}"),
    }
}

fn print_status<C: Connector, H: HistoryApi, S: NotificationSink>(
    ctx: &Arc<AppContext<C, H, S>>,
    current: Option<&ConversationId>,
) {
    let party = ctx
        .local_party()
        .map_or_else(|| "not signed in".to_string(), |p| p.party.to_string());
    println!("signed in as {party}, {}", ctx.connection().state());
    ctx.with_chat(|chat| {
        for session in chat.sessions() {
            let marker = if Some(session.conversation_id()) == current {
                "*"
            } else {
                " "
            };
            let online = if chat.is_online(session.contact()) {
                "online"
            } else {
                "offline"
            };
            println!(
                "{marker} {} ({online}) {:?}, {} unread",
                session.contact(),
                session.state(),
                session.unread()
            );
        }
        println!("unread total: {}", chat.total_unread());
    });
}

fn render(event: &ChatEvent, time_format: &str) -> Option<String> {
    let text = match event {
        ChatEvent::MessageAppended { message, status } => {
            let who = message
                .sender_name
                .clone()
                .unwrap_or_else(|| message.sender.to_string());
            format!(
                "[{}] {who}: {} ({})",
                message.created_at.format(time_format),
                message.content,
                status.label()
            )
        }
        ChatEvent::StatusChanged {
            message_id, status, ..
        } => format!("   {message_id} {}", status.label()),
        ChatEvent::HistoryLoaded {
            conversation_id,
            count,
        } => format!("-- {conversation_id}: {count} earlier messages --"),
        ChatEvent::HistoryFailed {
            conversation_id,
            reason,
        } => format!("-- {conversation_id}: history unavailable ({reason}) --"),
        ChatEvent::TypingChanged {
            party, typing: true, ..
        } => format!("   {party} is typing..."),
        ChatEvent::PresenceChanged { party, online } => {
            format!("   {party} is {}", if *online { "online" } else { "offline" })
        }
        ChatEvent::Connection(state) => format!("-- {state} --"),
        ChatEvent::SessionClosed { conversation_id } => format!("-- closed {conversation_id} --"),
        _ => return None,
    };
    Some(text)
}
