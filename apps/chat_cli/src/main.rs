use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chat_client::{
    load_settings, ChatConnection, ChatSession, HttpChatApi, SessionEvent, StaticTokenProvider,
    StoredSession, TokenProvider, TungsteniteConnector,
};
use clap::Parser;
use shared::{
    domain::{ChatId, MessageId, MessageStatus, UserSummary},
    protocol::Message,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Join one chat, print its traffic and send lines typed on stdin")]
struct Args {
    /// REST base URL; the websocket URL is derived from it.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long, conflicts_with = "session_file")]
    token: Option<String>,
    /// JSON file holding the stored user record, token included.
    #[arg(long)]
    session_file: Option<PathBuf>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    username: Option<String>,
    chat_id: String,
}

async fn resolve_identity(args: &Args) -> Result<(Arc<dyn TokenProvider>, UserSummary)> {
    match (&args.token, &args.session_file) {
        (Some(token), _) => {
            let user_id = args
                .user_id
                .clone()
                .context("--user-id is required together with --token")?;
            let username = args.username.clone().unwrap_or_else(|| user_id.clone());
            Ok((
                Arc::new(StaticTokenProvider::new(token.clone())),
                UserSummary::new(user_id, username),
            ))
        }
        (None, Some(path)) => {
            let stored = StoredSession::new(path);
            let user = stored
                .user()
                .await
                .with_context(|| format!("reading session file {}", path.display()))?;
            Ok((Arc::new(stored), user))
        }
        (None, None) => bail!("either --token or --session-file is required"),
    }
}

fn render(message: &Message) -> String {
    let who = if message.is_from_current_user {
        "you"
    } else {
        message.sender.username.as_str()
    };
    format!(
        "[{}] {who}: {} ({})",
        message.sent_at.format("%H:%M:%S"),
        message.content,
        message.status
    )
}

/// Prints messages not seen before and status changes of known ones.
fn print_changes(printed: &mut HashMap<MessageId, MessageStatus>, messages: &[Message]) {
    for message in messages.iter().rev() {
        match printed.insert(message.id.clone(), message.status) {
            None => println!("{}", render(message)),
            Some(previous) if previous != message.status => {
                println!("  {} -> {}", message.id, message.status)
            }
            Some(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = &args.api_url {
        settings.api_url = api_url.clone();
    }
    let (tokens, user) = resolve_identity(&args).await?;
    info!(user = %user.id, chat_id = %args.chat_id, api_url = %settings.api_url, "starting chat client");

    let connection = ChatConnection::new(
        settings.clone(),
        Arc::clone(&tokens),
        Arc::new(TungsteniteConnector),
    );
    let api = Arc::new(HttpChatApi::new(&settings, tokens));
    let session = ChatSession::new(
        ChatId::new(args.chat_id.clone()),
        user,
        settings,
        connection,
        api,
    );

    let mut events = session.subscribe();
    let mut states = session.connection().watch_state();
    if let Err(error) = session.start().await {
        warn!(%error, "initial connect failed, retrying in background");
    }
    if let Some(chat) = session.chat() {
        println!(
            "joined {} ({} participants)",
            chat.name.as_deref().unwrap_or(chat.id.as_str()),
            chat.participants.len()
        );
    }

    let mut printed = HashMap::new();
    print_changes(&mut printed, &session.messages());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/typing" => session.notify_typing(),
                    "/more" => match session.load_more_messages().await {
                        Ok(0) => println!("no older messages"),
                        Ok(added) => println!("loaded {added} older messages"),
                        Err(error) => warn!(error = %format!("{error:#}"), "loading older messages failed"),
                    },
                    text => {
                        if let Err(error) = session.send_message(text) {
                            warn!(%error, "message not sent");
                        }
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::MessagesChanged) => print_changes(&mut printed, &session.messages()),
                Ok(SessionEvent::TypingChanged(true)) => println!("  (typing...)"),
                Ok(SessionEvent::TypingChanged(false)) => {}
                Ok(SessionEvent::ChatUpdated(chat)) => {
                    println!("  chat {} now has {} participants", chat.id, chat.participants.len())
                }
                Ok(SessionEvent::NewChat(chat)) => println!("  new chat {}", chat.id),
                Ok(SessionEvent::Error(message)) => eprintln!("error: {message}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                    print_changes(&mut printed, &session.messages());
                }
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(?state, "connection state changed");
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
