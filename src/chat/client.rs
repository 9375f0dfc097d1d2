//! Chat connection lifecycle: connect, stream events, reconnect with capped
//! backoff, and the outbound sender handle.

use super::{chat_event_from_irc, ChatEvent, Egress};
use crate::error::ChatError;
use async_trait::async_trait;
use futures_util::StreamExt;
use irc::client::prelude::{Capability, Client, Config as IrcConfig};
use irc::proto::{Command, Response};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::MESSAGE_BYTE_LIMIT;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Outbound handle; the connection loop swaps the live sender in and out as
/// it reconnects.
#[derive(Default)]
pub struct ChatHandle {
    sender: Mutex<Option<irc::client::Sender>>,
}

impl ChatHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_sender(&self, sender: irc::client::Sender) {
        *self.sender.lock().expect("sender lock poisoned") = Some(sender);
    }

    fn clear_sender(&self) {
        *self.sender.lock().expect("sender lock poisoned") = None;
    }
}

#[async_trait]
impl Egress for ChatHandle {
    async fn send(&self, channel: &str, text: &str) -> Result<(), ChatError> {
        let sender = self
            .sender
            .lock()
            .expect("sender lock poisoned")
            .clone()
            .ok_or(ChatError::Closed)?;

        // Last-line defense: one line, bounded bytes. Generated text was
        // already post-processed; command replies are short.
        let mut line = text.replace(['\r', '\n'], " ");
        if line.len() > MESSAGE_BYTE_LIMIT {
            let mut cut = MESSAGE_BYTE_LIMIT;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }

        sender
            .send_privmsg(channel, line)
            .map_err(|e| ChatError::Send(e.to_string()))
    }
}

/// Parameters for the connection loop.
pub struct ChatParams {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub bot_username: String,
    pub access_token: String,
    pub channels: Vec<String>,
}

/// Run the chat connection until shutdown.
///
/// Reconnects with exponential backoff capped at five minutes, reset on a
/// successful registration. A channel that bans the bot is recorded and never
/// rejoined until the process restarts.
pub async fn run_chat(
    params: ChatParams,
    handle: std::sync::Arc<ChatHandle>,
    events: mpsc::Sender<ChatEvent>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut banned: HashSet<String> = HashSet::new();

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let join_channels: Vec<String> = params
            .channels
            .iter()
            .filter(|c| !banned.contains(c.as_str()))
            .cloned()
            .collect();
        if join_channels.is_empty() {
            warn!("No joinable channels remain; chat loop idle until shutdown");
            shutdown.cancelled().await;
            return;
        }

        let config = IrcConfig {
            nickname: Some(params.bot_username.clone()),
            server: Some(params.server.clone()),
            port: Some(params.port),
            use_tls: Some(params.use_tls),
            password: Some(format!("oauth:{}", params.access_token)),
            channels: join_channels,
            ..IrcConfig::default()
        };

        match connect_and_stream(config, &handle, &events, &shutdown, &mut banned, &mut backoff)
            .await
        {
            SessionEnd::Shutdown => return,
            SessionEnd::Lost => {
                handle.clear_sender();
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                let delay = backoff.mul_f64(jitter);
                warn!(delay_s = delay.as_secs(), "Chat connection lost; reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

async fn connect_and_stream(
    config: IrcConfig,
    handle: &ChatHandle,
    events: &mpsc::Sender<ChatEvent>,
    shutdown: &CancellationToken,
    banned: &mut HashSet<String>,
    backoff: &mut Duration,
) -> SessionEnd {
    let mut client = match Client::from_config(config).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Chat connect failed");
            return SessionEnd::Lost;
        }
    };

    if let Err(e) = client.send_cap_req(&[
        Capability::Custom("twitch.tv/tags"),
        Capability::Custom("twitch.tv/commands"),
    ]) {
        warn!(error = %e, "Capability request failed");
        return SessionEnd::Lost;
    }
    if let Err(e) = client.identify() {
        warn!(error = %e, "Chat identify failed");
        return SessionEnd::Lost;
    }

    let mut stream = match client.stream() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Chat stream failed");
            return SessionEnd::Lost;
        }
    };

    handle.set_sender(client.sender());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = client.send_quit("shutting down");
                handle.clear_sender();
                return SessionEnd::Shutdown;
            }
            item = stream.next() => match item {
                Some(Ok(message)) => {
                    match &message.command {
                        Command::Response(Response::RPL_WELCOME, _) => {
                            info!("Chat registration complete");
                            *backoff = INITIAL_BACKOFF;
                        }
                        Command::Response(Response::ERR_BANNEDFROMCHAN, args) => {
                            if let Some(channel) = args.get(1) {
                                warn!(channel = %channel, "Banned from channel; will not rejoin");
                                banned.insert(channel.clone());
                            }
                        }
                        _ => {}
                    }
                    if let Some(event) = chat_event_from_irc(&message) {
                        // The processor owns backpressure; a closed receiver
                        // means the pipeline is gone.
                        if events.send(event).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Chat stream error");
                    return SessionEnd::Lost;
                }
                None => {
                    warn!("Chat stream closed by peer");
                    return SessionEnd::Lost;
                }
            }
        }
    }
}
