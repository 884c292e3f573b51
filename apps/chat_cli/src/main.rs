use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, BroadcastSession, ChatService, FetchOutcome, InMemoryCredentialStore,
    SessionEvent, StoreEvent, TracingNotifier,
};
use shared::domain::{Message, MessageExtras, Sender, ThreadId, ThreadKind, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `api_base_url` from settings.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,
    #[arg(long, default_value = "me")]
    user_id: String,
    #[arg(long, default_value = "me")]
    user_name: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Direct,
    Community,
}

impl From<Kind> for ThreadKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Direct => ThreadKind::Direct,
            Kind::Community => ThreadKind::Community,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the thread's history, oldest first.
    History {
        thread_id: String,
        #[arg(long, value_enum, default_value = "direct")]
        kind: Kind,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Send one message and wait for the server's answer.
    Send {
        thread_id: String,
        text: String,
        #[arg(long, value_enum, default_value = "direct")]
        kind: Kind,
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Stream realtime updates until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(url) = cli.server_url {
        settings.api_base_url = url;
    }

    let credentials = Arc::new(InMemoryCredentialStore::default());
    if let Some(token) = cli.token {
        credentials.set_token(token).await;
    }
    let session = Arc::new(BroadcastSession::new());
    let mut logouts = session.subscribe();
    tokio::spawn(async move {
        while let Ok(SessionEvent::LoggedOut) = logouts.recv().await {
            warn!("session invalidated, log in again");
        }
    });

    let me = Sender {
        id: UserId::from(cli.user_id),
        name: cli.user_name,
        avatar: None,
    };
    let chat = ChatService::from_settings(
        &settings,
        credentials,
        session,
        Arc::new(TracingNotifier),
        me,
    )
    .context("invalid socket settings")?;

    match cli.command {
        Command::History {
            thread_id,
            kind,
            pages,
        } => {
            let thread_id = ThreadId::from(thread_id);
            for _ in 0..pages.max(1) {
                match chat.load_older(&thread_id, kind.into()).await? {
                    FetchOutcome::Fetched { has_more: true, .. } => {}
                    _ => break,
                }
            }
            for message in chat.store().thread_messages(&thread_id).await {
                print_message(&message);
            }
        }
        Command::Send {
            thread_id,
            text,
            kind,
            wait_secs,
        } => {
            let thread_id = ThreadId::from(thread_id);
            let mut events = chat.subscribe();
            let handle = chat.connect();
            let local_id = chat
                .send_message(&thread_id, kind.into(), text, MessageExtras::default())
                .await?;
            info!(%local_id, socket = ?handle.state(), "queued message");

            let outcome = tokio::time::timeout(Duration::from_secs(wait_secs), async {
                let mut current = local_id.clone();
                while let Ok(event) = events.recv().await {
                    match event {
                        StoreEvent::MessageRekeyed { old_id, new_id, .. } if old_id == current => {
                            current = new_id;
                        }
                        StoreEvent::MessageUpdated { message, .. } if message.id == current => {
                            return Some(message);
                        }
                        _ => {}
                    }
                }
                None
            })
            .await;
            match outcome {
                Ok(Some(message)) => print_message(&message),
                _ => warn!(%local_id, "no answer from server yet"),
            }
            chat.disconnect().await;
        }
        Command::Watch => {
            let mut events = chat.subscribe();
            let mut socket_state = chat.connect().watch_state();
            info!(state = ?*socket_state.borrow(), "socket");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = socket_state.changed() => {
                        if changed.is_err() {
                            warn!("socket closed");
                            break;
                        }
                        info!(state = ?*socket_state.borrow_and_update(), "socket");
                    }
                    event = events.recv() => match event {
                        Ok(StoreEvent::MessageAdded { thread_id, message })
                        | Ok(StoreEvent::MessageUpdated { thread_id, message }) => {
                            print!("[{thread_id}] ");
                            print_message(&message);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            chat.disconnect().await;
        }
    }

    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "{} {:<9} {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        format!("{:?}", message.status).to_lowercase(),
        message.sender_name,
        message.text
    );
}
