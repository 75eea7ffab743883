use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chat_core::{
    config::load_settings,
    notifications::{LineNotificationSource, NoNotificationSource},
    sound::notification_clip,
    BridgeSignal, ConversationSession, DeliveryState, HttpConversationApi, Interaction, Message,
    NotificationBridge, NotificationSource, SessionEvent, SessionIdentity, SessionOptions,
    SoundGate, WebSocketTransport,
};
use clap::Parser;
use shared::domain::{ConversationId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};

/// Terminal client for one conversation. Lines typed on stdin are sent;
/// `/retry` re-sends failed messages and `/quit` exits.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    conversation: i64,
    #[arg(long, default_value = "client.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    /// File or FIFO carrying notification events as JSON lines. Opening a
    /// FIFO waits for its writer.
    #[arg(long)]
    notifications: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config)?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    settings.validate()?;

    let api = Arc::new(HttpConversationApi::new(
        settings.server_url.clone(),
        settings.auth_token.clone(),
    ));
    let transport = Arc::new(WebSocketTransport::new(
        settings.ws_base()?,
        settings.auth_token.clone(),
    ));
    let session = ConversationSession::open(
        ConversationId(args.conversation),
        SessionIdentity {
            user_id: UserId(settings.user_id),
            display_name: settings.display_name.clone(),
        },
        api,
        transport,
        SessionOptions {
            backoff: settings.backoff(),
            mark_read_delay: settings.mark_read_delay(),
        },
    );

    let sound = Arc::new(SoundGate::new(notification_clip(Path::new(
        &settings.notification_sound_path,
    ))));
    let source = notification_source(args.notifications).await?;
    let mut bridge = NotificationBridge::attach(source.as_ref(), sound.clone());

    session.refresh().await;
    let mut rendered = HashMap::new();
    render(&session.messages(), &mut rendered);

    let mut events = session.subscribe();
    let mut signals = bridge.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                sound.handle_interaction(Interaction::KeyPress);
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/retry" => retry_failed(&session).await,
                    text => {
                        if let Err(err) = session.send(text).await {
                            warn!(error = %err, "chat: message not delivered, /retry to resend");
                        }
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::MessagesChanged) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    render(&session.messages(), &mut rendered);
                }
                Ok(SessionEvent::ConnectionStateChanged(state)) => {
                    info!(?state, "chat: connection state changed");
                }
                Ok(SessionEvent::Warning(warning)) => warn!(%warning, "chat: session warning"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Ok(BridgeSignal::Reload) = signals.recv() => session.refresh().await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bridge.detach();
    sound.dispose();
    session.close();
    Ok(())
}

async fn notification_source(path: Option<PathBuf>) -> Result<Box<dyn NotificationSource>> {
    let Some(path) = path else {
        return Ok(Box::new(NoNotificationSource));
    };
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("failed to open notification source {}", path.display()))?;
    Ok(Box::new(LineNotificationSource::new(file)))
}

async fn retry_failed(session: &ConversationSession) {
    let failed: Vec<_> = session
        .messages()
        .into_iter()
        .filter(|message| message.delivery_state == DeliveryState::Failed)
        .filter_map(|message| message.correlation_id)
        .collect();
    if failed.is_empty() {
        println!("nothing to retry");
    }
    for correlation_id in failed {
        if let Err(err) = session.retry(&correlation_id).await {
            warn!(error = %err, "chat: retry failed");
        }
    }
}

/// Prints entries that are new or whose delivery state changed.
fn render(messages: &[Message], rendered: &mut HashMap<String, DeliveryState>) {
    for message in messages {
        let key = match (&message.correlation_id, message.id) {
            (Some(correlation_id), _) => correlation_id.0.clone(),
            (None, Some(id)) => id.to_string(),
            (None, None) => continue,
        };
        if rendered.get(&key) == Some(&message.delivery_state) {
            continue;
        }
        rendered.insert(key, message.delivery_state);

        let marker = match message.delivery_state {
            DeliveryState::Pending => "…",
            DeliveryState::Sent => "✓",
            DeliveryState::Acknowledged => "✓✓",
            DeliveryState::Failed => "!",
        };
        println!(
            "{} {:>2} {}: {}",
            message.created_at.format("%H:%M"),
            marker,
            message.sender_display_name,
            message.body
        );
    }
}
