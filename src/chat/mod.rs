//! The Discord side: slash commands, the restart button, and relaying stop
//! notifications into the channel.
//!
//! Everything that reaches the chat goes through one task ([`ChatLoop`]) fed by
//! a bounded channel, so HTTP handlers never talk to Discord directly.

pub mod commands;
pub mod discord;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;

pub use commands::{CommandContext, CommandRegistry};
pub use discord::DiscordClient;

pub const START_BUTTON_ID: &str = "start_minecraft_server_button";

/// How long the webhook waits for the notification to go out.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Discord returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("the chat loop isn't running")]
    LoopClosed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub custom_id: String,
    pub label: String,
    pub disabled: bool,
}

/// The button that starts the server.
pub fn start_button(disabled: bool) -> Button {
    Button {
        custom_id: START_BUTTON_ID.to_string(),
        label: "Start Minecraft server".to_string(),
        disabled,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub content: String,
    pub button: Option<Button>,
}

impl Message {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            button: None,
        }
    }

    pub fn with_button(mut self, button: Button) -> Self {
        self.button = Some(button);
        self
    }
}

/// Points at a message we sent so it can be edited later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel_id: u64,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        channel_id: u64,
        message: &Message,
    ) -> Result<MessageHandle, ChatError>;
    async fn edit_message(&self, handle: &MessageHandle, message: &Message)
    -> Result<(), ChatError>;
    async fn register_commands(&self, commands: &[CommandSpec]) -> Result<(), ChatError>;
}

#[derive(Debug)]
pub enum ChatEvent {
    Command {
        name: String,
    },
    Button {
        custom_id: String,
        /// The message the button was on.
        message: Option<MessageHandle>,
    },
    VmStopped {
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
}

/// The sending half, cheap to clone and handed to the HTTP layer.
#[derive(Clone)]
pub struct ChatHandle {
    tx: mpsc::Sender<ChatEvent>,
}

impl ChatHandle {
    /// Queue an event without waiting. Fails if the queue is full or the loop
    /// is gone.
    pub fn try_send(&self, event: ChatEvent) -> Result<(), ChatEvent> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => {
                event
            }
        })
    }

    /// Post the "server stopped" message and wait for it to go through.
    pub async fn relay_vm_stopped(&self, timeout: Duration) -> Result<(), ChatError> {
        let relay = async {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(ChatEvent::VmStopped { reply })
                .await
                .map_err(|_| ChatError::LoopClosed)?;
            rx.await.map_err(|_| ChatError::LoopClosed)?
        };
        tokio::time::timeout(timeout, relay)
            .await
            .map_err(|_| ChatError::Timeout(timeout))?
    }
}

pub struct ChatLoop {
    rx: mpsc::Receiver<ChatEvent>,
    registry: Arc<CommandRegistry>,
    ctx: CommandContext,
}

/// Create the chat loop and a handle for feeding it.
pub fn chat_loop(
    capacity: usize,
    registry: CommandRegistry,
    ctx: CommandContext,
) -> (ChatHandle, ChatLoop) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChatHandle { tx },
        ChatLoop {
            rx,
            registry: Arc::new(registry),
            ctx,
        },
    )
}

impl ChatLoop {
    /// Register the slash commands, then handle events until every handle is
    /// dropped.
    pub async fn run(mut self) {
        if let Err(err) = self.ctx.chat.register_commands(&self.registry.specs()).await {
            error!("couldn't register slash commands: {err}");
        }

        while let Some(event) = self.rx.recv().await {
            self.handle(event);
        }
        info!("chat loop stopped");
    }

    fn handle(&self, event: ChatEvent) {
        debug!("chat event: {event:?}");
        match event {
            ChatEvent::VmStopped { reply } => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    let result = announce_stopped(&ctx).await;
                    if let Err(err) = &result {
                        error!("couldn't post stop notification: {err}");
                    }
                    // the webhook may have given up already
                    let _ = reply.send(result);
                });
            }
            ChatEvent::Command { name } => {
                self.spawn_dispatch(name, false, self.ctx.clone());
            }
            ChatEvent::Button { custom_id, message } => {
                self.spawn_dispatch(custom_id, true, self.ctx.clone().with_source(message));
            }
        }
    }

    // commands can take a while (starting waits for the IP), so each one gets
    // its own task
    fn spawn_dispatch(&self, name: String, button: bool, ctx: CommandContext) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let result = if button {
                registry.dispatch_button(&name, &ctx).await
            } else {
                registry.dispatch_command(&name, &ctx).await
            };
            if let Err(err) = result {
                warn!("{name} failed: {err}");
            }
        });
    }
}

async fn announce_stopped(ctx: &CommandContext) -> Result<(), ChatError> {
    let message = Message::text(
        "The Minecraft server has stopped.\nTo play again, start it with the button below.",
    )
    .with_button(start_button(false));
    let handle = ctx.chat.send_message(ctx.channel_id, &message).await?;
    info!("posted stop notification ({})", handle.message_id);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Records what would have been posted.
    #[derive(Default)]
    pub struct FakeChat {
        pub sent: Mutex<Vec<(u64, Message)>>,
        pub edits: Mutex<Vec<(MessageHandle, Message)>>,
        pub registered: Mutex<Vec<CommandSpec>>,
        pub fail: bool,
    }

    impl FakeChat {
        /// Contents of everything sent or edited, in order.
        pub fn transcript(&self) -> Vec<String> {
            let mut lines = self
                .sent
                .lock()
                .iter()
                .map(|(_, m)| m.content.clone())
                .collect::<Vec<_>>();
            lines.extend(self.edits.lock().iter().map(|(_, m)| m.content.clone()));
            lines
        }
    }

    #[async_trait]
    impl ChatApi for FakeChat {
        async fn send_message(
            &self,
            channel_id: u64,
            message: &Message,
        ) -> Result<MessageHandle, ChatError> {
            if self.fail {
                return Err(ChatError::Api {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "down".to_string(),
                });
            }
            let mut sent = self.sent.lock();
            sent.push((channel_id, message.clone()));
            Ok(MessageHandle {
                channel_id,
                message_id: sent.len().to_string(),
            })
        }

        async fn edit_message(
            &self,
            handle: &MessageHandle,
            message: &Message,
        ) -> Result<(), ChatError> {
            self.edits.lock().push((handle.clone(), message.clone()));
            Ok(())
        }

        async fn register_commands(&self, commands: &[CommandSpec]) -> Result<(), ChatError> {
            self.registered.lock().extend_from_slice(commands);
            Ok(())
        }
    }

    fn context(chat: Arc<FakeChat>) -> CommandContext {
        use crate::controller::tests::{FakeCompute, test_config};

        CommandContext::new(
            chat,
            Arc::new(FakeCompute::default()),
            Arc::new(test_config()),
            Arc::new(tokio::sync::Mutex::new(())),
            99,
        )
    }

    #[tokio::test]
    async fn test_loop_registers_commands_and_relays() {
        let chat = Arc::new(FakeChat::default());
        let (handle, chat_loop) = chat_loop(4, CommandRegistry::standard(), context(chat.clone()));
        tokio::spawn(chat_loop.run());

        handle.relay_vm_stopped(RELAY_TIMEOUT).await.unwrap();

        assert_eq!(chat.registered.lock().len(), 4);
        let sent = chat.sent.lock();
        assert_eq!(sent[0].1.button, Some(start_button(false)));
    }

    #[tokio::test]
    async fn test_relay_reports_chat_failure() {
        let chat = Arc::new(FakeChat {
            fail: true,
            ..Default::default()
        });
        let (handle, chat_loop) = chat_loop(4, CommandRegistry::standard(), context(chat));
        tokio::spawn(chat_loop.run());

        let err = handle.relay_vm_stopped(RELAY_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ChatError::Api { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_relay_times_out() {
        let chat = Arc::new(FakeChat::default());
        // never run, so nothing answers
        let (handle, _chat_loop) = chat_loop(4, CommandRegistry::standard(), context(chat));

        let timeout = Duration::from_millis(50);
        let err = handle.relay_vm_stopped(timeout).await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout(t) if t == timeout), "{err:?}");
    }

    #[tokio::test]
    async fn test_try_send_when_full() {
        let chat = Arc::new(FakeChat::default());
        let (handle, _chat_loop) = chat_loop(1, CommandRegistry::standard(), context(chat));

        handle
            .try_send(ChatEvent::Command {
                name: "help".to_string(),
            })
            .unwrap();
        let rejected = handle.try_send(ChatEvent::Command {
            name: "mc_status".to_string(),
        });
        assert!(matches!(rejected, Err(ChatEvent::Command { name }) if name == "mc_status"));
    }
}
