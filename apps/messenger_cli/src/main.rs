use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    load_settings, ClientEvent, ClientHandle, MissingNegotiatorFactory, Session, SessionDeps,
    SessionHandle, TimelineEntry,
};
use shared::domain::{ChatRef, Credential, LocalMessageId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    login: String,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Open(ChatRef),
    Send(String),
    Retry(LocalMessageId),
    Call(String),
    Accept,
    Decline,
    Hangup,
    Chats,
    Quit,
}

fn parse_command(line: &str) -> Result<CliCommand> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match head {
        "/open" => match rest.split_once(' ') {
            Some(("user", target)) => Ok(CliCommand::Open(ChatRef::user(target.trim()))),
            Some(("group", target)) => Ok(CliCommand::Open(ChatRef::group(target.trim()))),
            _ => Err(anyhow!("usage: /open user|group <target>")),
        },
        "/send" => Ok(CliCommand::Send(rest.to_string())),
        "/retry" => {
            let id = Uuid::parse_str(rest).map_err(|err| anyhow!("invalid message id: {err}"))?;
            Ok(CliCommand::Retry(LocalMessageId(id)))
        }
        "/call" if !rest.is_empty() => Ok(CliCommand::Call(rest.to_string())),
        "/call" => Err(anyhow!("usage: /call <login>")),
        "/accept" => Ok(CliCommand::Accept),
        "/decline" => Ok(CliCommand::Decline),
        "/hangup" => Ok(CliCommand::Hangup),
        "/chats" => Ok(CliCommand::Chats),
        "/quit" => Ok(CliCommand::Quit),
        // Plain text goes to the open chat.
        _ if !line.starts_with('/') => Ok(CliCommand::Send(line.to_string())),
        other => Err(anyhow!("unknown command {other}")),
    }
}

fn describe(event: &ClientEvent) -> String {
    match event {
        ClientEvent::ChannelStateChanged {
            state,
            attempt,
            retry_in,
        } => match retry_in {
            Some(delay) => format!("channel {state:?} (attempt {attempt}, retry in {delay:?})"),
            None => format!("channel {state:?}"),
        },
        ClientEvent::ChatsUpdated => "chats updated".to_string(),
        ClientEvent::TimelineUpdated { chat } => format!("timeline updated: {chat}"),
        ClientEvent::IncomingMessage {
            chat,
            sender_name,
            preview,
        } => format!("[{chat}] {sender_name}: {preview}"),
        ClientEvent::MessageFailed {
            local_id, reason, ..
        } => format!("{} (/retry {local_id})", reason.user_message()),
        ClientEvent::IncomingCall(invite) => format!(
            "incoming call from {} ({}), /accept or /decline",
            invite.from_name, invite.from_login
        ),
        ClientEvent::CallStateChanged(call) => {
            format!("call with {}: {:?}", call.remote_peer, call.state)
        }
        ClientEvent::Failure(err) => format!("error: {err}"),
        ClientEvent::LoggedOut => "logged out".to_string(),
    }
}

async fn print_chats(client: &dyn ClientHandle) -> Result<()> {
    let snapshot = client.snapshot().await?;
    for summary in &snapshot.summaries {
        println!(
            "{} {:<24} unread={} {}",
            summary.chat_ref(),
            summary.display_name,
            summary.unread_count,
            summary.last_message_preview
        );
    }
    if snapshot.active_chat.is_some() {
        for entry in &snapshot.timeline {
            match entry {
                TimelineEntry::Delivered(message) => println!("  {}: {}", message.sender, message.text),
                TimelineEntry::Pending(message) => {
                    println!("  (me, {:?} {}): {}", message.status, message.local_id, message.text())
                }
            }
        }
    }
    Ok(())
}

async fn run_command(client: &dyn ClientHandle, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Open(chat) => client.open_chat(chat).await?,
        CliCommand::Send(text) => {
            let chat = client
                .snapshot()
                .await?
                .active_chat
                .ok_or_else(|| anyhow!("open a chat first"))?;
            let local_id = client.send(chat, text, None).await?;
            println!("queued {local_id}");
        }
        CliCommand::Retry(local_id) => client.retry(local_id).await?,
        CliCommand::Call(login) => {
            let room = client.start_call(ChatRef::user(login)).await?;
            println!("calling in room {room}");
        }
        CliCommand::Accept => {
            let invite = client.accept_call().await?;
            println!("answering {}", invite.from_login);
        }
        CliCommand::Decline => {
            let invite = client.decline_call().await?;
            println!("declined {}", invite.from_login);
        }
        CliCommand::Hangup => client.hangup().await?,
        CliCommand::Chats => print_chats(client).await?,
        CliCommand::Quit => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let deps = SessionDeps::over_network(&settings, Arc::new(MissingNegotiatorFactory))?;
    let session = Session::new(Credential::new(args.token), args.login);
    let client = SessionHandle::start(session, settings, deps)?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("* {}", describe(&event));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == CliCommand::Quit {
            break;
        }
        if let Err(err) = run_command(&client, command).await {
            warn!("command failed: {err}");
            println!("{err}");
        }
    }

    client.logout().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_command("/open user bob").expect("open"),
            CliCommand::Open(ChatRef::user("bob"))
        );
        assert_eq!(
            parse_command("/open group 42").expect("open group"),
            CliCommand::Open(ChatRef::group("42"))
        );
        assert_eq!(
            parse_command("/send hello there").expect("send"),
            CliCommand::Send("hello there".into())
        );
        assert_eq!(
            parse_command("just text").expect("plain"),
            CliCommand::Send("just text".into())
        );
        assert_eq!(parse_command("/call bob").expect("call"), CliCommand::Call("bob".into()));
        assert_eq!(parse_command(" /quit ").expect("quit"), CliCommand::Quit);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("/open channel x").is_err());
        assert!(parse_command("/retry not-a-uuid").is_err());
        assert!(parse_command("/call").is_err());
        assert!(parse_command("/dance").is_err());
    }

    #[test]
    fn retry_takes_a_local_id() {
        let id = Uuid::from_u128(5);
        assert_eq!(
            parse_command(&format!("/retry {id}")).expect("retry"),
            CliCommand::Retry(LocalMessageId(id))
        );
    }
}
