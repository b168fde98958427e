use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, SendOutcome, SyncEvent, SyncSession};
use shared::domain::{ChatId, MessageId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml and SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long, env = "CHAT_PASSWORD")]
    password: String,
    /// Chat to open after login.
    #[arg(long)]
    chat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }

    let session = SyncSession::init(settings).context("invalid settings")?;
    let printer = tokio::spawn(print_events(Arc::clone(&session)));

    let credential = session
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;
    tracing::info!(subject = %credential.subject_id, "desktop: logged in");
    println!("Logged in as {} ({})", credential.display_name, credential.subject_id);

    for conversation in session.conversations().await {
        let with = conversation
            .target
            .as_ref()
            .map(|target| target.username.as_str())
            .unwrap_or("?");
        println!(
            "  {} with {with} ({} unread)",
            conversation.chat_id, conversation.unread_count
        );
    }

    let mut active = args.chat.map(ChatId);
    if let Some(chat_id) = &active {
        session.open_chat(chat_id).await?;
        session.mark_read(chat_id).await;
    }

    println!("Commands: /open <chat>, /older, /read, /edit <id> <text>, /delete <id>, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "/quit" => break,
            "/open" => {
                if let Some(previous) = active.take() {
                    session.close_chat(&previous).await;
                }
                let chat_id = ChatId::from(rest.trim());
                session.open_chat(&chat_id).await?;
                session.mark_read(&chat_id).await;
                active = Some(chat_id);
            }
            "/older" => match &active {
                Some(chat_id) => {
                    if !session.load_older(chat_id).await? {
                        println!("No older messages.");
                    }
                }
                None => println!("Open a chat first."),
            },
            "/read" => {
                if let Some(chat_id) = &active {
                    session.mark_read(chat_id).await;
                }
            }
            "/edit" => {
                let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                if let Err(err) = session.edit_message(&MessageId::from(id), text).await {
                    tracing::warn!(message_id = id, "desktop: edit failed: {err}");
                    println!("Edit failed: {err}");
                }
            }
            "/delete" => {
                if let Err(err) = session.delete_message(&MessageId::from(rest.trim())).await {
                    tracing::warn!(message_id = rest.trim(), "desktop: delete failed: {err}");
                    println!("Delete failed: {err}");
                }
            }
            _ => match &active {
                Some(chat_id) => match session.send_to_chat(chat_id, line).await {
                    SendOutcome::Sent | SendOutcome::Queued => {}
                    other => {
                        tracing::warn!(chat_id = %chat_id, outcome = ?other, "desktop: message not sent");
                        println!("Not sent: {other:?}");
                    }
                },
                None => println!("Open a chat first."),
            },
        }
    }

    tracing::debug!("desktop: shutting down");
    session.logout().await;
    session.dispose().await;
    printer.abort();
    Ok(())
}

async fn print_events(session: Arc<SyncSession>) {
    let mut events = session.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "desktop: event printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            SyncEvent::MessagesUpdated { chat_id } => {
                if let Some(last) = session.messages(&chat_id).await.last() {
                    println!("[{chat_id}] {}: {}", last.sender.username, last.content);
                }
            }
            SyncEvent::ConversationsUpdated => {
                println!("({} unread)", session.total_unread().await);
            }
            SyncEvent::ConnectionChanged(state) => println!("connection: {state:?}"),
            SyncEvent::Offline { attempts } => {
                println!("offline after {attempts} attempts, still probing")
            }
            SyncEvent::AuthRejected(reason) => println!("server rejected credentials: {reason}"),
            SyncEvent::SessionEnded => println!("session ended, log in again"),
            SyncEvent::Notification(value) => println!("notification: {value}"),
            SyncEvent::Error(message) => println!("error: {message}"),
        }
    }
}
