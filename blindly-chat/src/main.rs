//! Blindly chat console client.
//!
//! Opens one conversation against a chat server and bridges it to the
//! terminal: lines typed on stdin are sent as messages, session events are
//! printed as they arrive. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/blindly/config.toml`).
//!
//! ```bash
//! cargo run --bin blindly-chat -- --server ws://127.0.0.1:4000 \
//!     --conversation c-42 --user alice
//! ```
//!
//! Commands: `/older` loads more history, `/end` ends the conversation,
//! `/quit` exits locally. Anything else is sent as a message.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use blindly_chat::cache::InMemoryCache;
use blindly_chat::config::{CliArgs, ClientConfig};
use blindly_chat::connection::ws::WsConnector;
use blindly_chat::session::{ChatEvent, ChatSession, SessionCommand, SessionHandle};
use blindly_proto::message::{ConversationId, UserId};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (Some(conversation), Some(user)) = (cli.conversation.clone(), cli.user.clone()) else {
        eprintln!("error: --conversation and --user are required");
        return ExitCode::from(2);
    };

    // Logs go to a file so stdout stays free for the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(server = %config.server_url, %conversation, %user, "blindly-chat starting");

    let connector = WsConnector::new(config.server_url.clone());
    let cache = InMemoryCache::new();
    let (handle, event_rx) = ChatSession::spawn(
        config.session_config(),
        connector,
        cache,
        UserId::new(user),
        ConversationId::new(conversation),
    );

    run_console(handle, event_rx).await;

    tracing::info!("blindly-chat exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("blindly-chat.log");
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

/// Bridge between stdin and the session until either side finishes.
async fn run_console(handle: SessionHandle, mut event_rx: mpsc::Receiver<ChatEvent>) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => {
                    if !print_event(&event) {
                        break;
                    }
                }
                None => break,
            },
            line = line_rx.recv() => match line {
                Some(line) => {
                    if !dispatch_line(&handle, line).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    stdin_task.abort();
    handle.shutdown().await;
}

/// Print a session event. Returns `false` once the conversation is over.
fn print_event(event: &ChatEvent) -> bool {
    match event {
        ChatEvent::Connected => println!("* connected"),
        ChatEvent::Disconnected { reason } => println!("* disconnected: {reason}"),
        ChatEvent::Reconnecting { attempt, delay } => {
            println!("* reconnecting (attempt {attempt}, in {delay:?})");
        }
        ChatEvent::SendStaged { .. } => println!("* sending..."),
        ChatEvent::SendRejected { reason } => println!("* not sent: {reason}"),
        ChatEvent::MessageReceived { message } => {
            println!("<{}> {}", message.sender_id.as_str(), message.content);
        }
        ChatEvent::MessageConfirmed { message, .. } => {
            println!("* delivered: {}", message.content);
        }
        ChatEvent::MessageUpdated { message } => {
            println!("* edited <{}> {}", message.sender_id.as_str(), message.content);
        }
        ChatEvent::HistoryLoaded { count } => println!("* loaded {count} older messages"),
        ChatEvent::SeenUpdated { message_ids } => {
            println!("* seen: {} messages", message_ids.len());
        }
        ChatEvent::RemoteTyping { active } => {
            if *active {
                println!("* typing...");
            }
        }
        ChatEvent::ReactionChanged { message_id } => {
            println!("* reaction on {}", message_id.as_str());
        }
        ChatEvent::ChatEnded => {
            println!("* chat ended");
            return false;
        }
        ChatEvent::Error { detail } => println!("* error: {detail}"),
    }
    true
}

/// Map one stdin line to session commands. Returns `false` on `/quit`.
async fn dispatch_line(handle: &SessionHandle, line: String) -> bool {
    match line.trim() {
        "/quit" => return false,
        "/older" => {
            handle.load_older().await;
        }
        "/end" => {
            handle.command(SessionCommand::EndChat).await;
        }
        _ => {
            handle.input_changed().await;
            handle.send_text(line).await;
        }
    }
    true
}
