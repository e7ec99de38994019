//! Slash command handlers and the table they're dispatched from.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    ChatApi, ChatError, CommandSpec, Message, MessageHandle, START_BUTTON_ID, start_button,
};
use crate::{
    compute::{ComputeApi, InstanceInfo, InstanceRef, InstanceStatus},
    config::Config,
    controller::snapshot_disk,
};

/// Everything a handler needs. Cloned for every invocation.
#[derive(Clone)]
pub struct CommandContext {
    pub chat: Arc<dyn ChatApi>,
    pub compute: Arc<dyn ComputeApi>,
    pub config: Arc<Config>,
    /// Held while starting, stopping or snapshotting the VM.
    pub control_lock: Arc<Mutex<()>>,
    pub channel_id: u64,
    /// For button presses, the message the button was on. Replies edit it
    /// instead of sending a new one, which also disables the button.
    pub source: Option<MessageHandle>,
}

impl CommandContext {
    pub fn new(
        chat: Arc<dyn ChatApi>,
        compute: Arc<dyn ComputeApi>,
        config: Arc<Config>,
        control_lock: Arc<Mutex<()>>,
        channel_id: u64,
    ) -> Self {
        Self {
            chat,
            compute,
            config,
            control_lock,
            channel_id,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Option<MessageHandle>) -> Self {
        self.source = source;
        self
    }

    /// First phase of a reply. Returns a handle that [`Self::update`] can
    /// edit later.
    pub async fn reply(&self, message: Message) -> Result<MessageHandle, ChatError> {
        match &self.source {
            Some(source) => {
                let message = message.with_button(start_button(true));
                self.chat.edit_message(source, &message).await?;
                Ok(source.clone())
            }
            None => self.chat.send_message(self.channel_id, &message).await,
        }
    }

    /// Second phase of a reply.
    pub async fn update(&self, handle: &MessageHandle, message: Message) -> Result<(), ChatError> {
        let message = match &self.source {
            Some(source) if source == handle => message.with_button(start_button(true)),
            _ => message,
        };
        self.chat.edit_message(handle, &message).await
    }

    fn instance(&self) -> Result<InstanceRef, ChatError> {
        Ok(self.config.instance()?)
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn handle(&self, ctx: &CommandContext, registry: &CommandRegistry)
    -> Result<(), ChatError>;
}

/// Maps command names and button ids to handlers.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Arc<dyn CommandHandler>>,
    buttons: BTreeMap<&'static str, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// The registry with every command this bot has.
    pub fn standard() -> Self {
        let start: Arc<dyn CommandHandler> = Arc::new(StartCommand);

        let mut registry = Self::default();
        registry.register(Arc::new(StatusCommand));
        registry.register(start.clone());
        registry.register(Arc::new(BackupCommand));
        registry.register(Arc::new(HelpCommand));
        registry.register_button(START_BUTTON_ID, start);
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.commands.insert(handler.name(), handler);
    }

    pub fn register_button(&mut self, custom_id: &'static str, handler: Arc<dyn CommandHandler>) {
        self.buttons.insert(custom_id, handler);
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.commands
            .values()
            .map(|h| CommandSpec {
                name: h.name().to_string(),
                description: h.description().to_string(),
            })
            .collect()
    }

    /// Run the handler for a slash command.
    pub async fn dispatch_command(
        &self,
        name: &str,
        ctx: &CommandContext,
    ) -> Result<(), ChatError> {
        self.dispatch(&self.commands, "command", name, ctx).await
    }

    /// Run the handler for a button press. `ctx.source` may be unset if the
    /// gateway didn't say which message the button was on.
    pub async fn dispatch_button(
        &self,
        custom_id: &str,
        ctx: &CommandContext,
    ) -> Result<(), ChatError> {
        self.dispatch(&self.buttons, "button", custom_id, ctx).await
    }

    async fn dispatch(
        &self,
        table: &BTreeMap<&'static str, Arc<dyn CommandHandler>>,
        kind: &str,
        name: &str,
        ctx: &CommandContext,
    ) -> Result<(), ChatError> {
        let Some(handler) = table.get(name) else {
            warn!("unknown {kind} {name:?}");
            ctx.reply(Message::text(format!("Unknown {kind} `{name}`.")))
                .await?;
            return Ok(());
        };
        info!("running {kind} {name}");
        handler.handle(ctx, self).await
    }
}

const STATUS_ERROR: &str = "Couldn't get the server status. Check the logs.";

/// Get the instance or tell the user why we couldn't.
async fn instance_info(
    ctx: &CommandContext,
    on_error: &str,
) -> Result<Option<(InstanceRef, InstanceInfo)>, ChatError> {
    let instance = match ctx.instance() {
        Ok(instance) => instance,
        Err(err) => {
            error!("{err}");
            ctx.reply(Message::text(format!("Configuration error: {err}")))
                .await?;
            return Ok(None);
        }
    };
    match ctx.compute.get_instance(&instance).await {
        Ok(info) => Ok(Some((instance, info))),
        Err(err) => {
            error!("couldn't get instance {instance}: {err}");
            ctx.reply(Message::text(on_error)).await?;
            Ok(None)
        }
    }
}

pub struct StatusCommand;

#[async_trait]
impl CommandHandler for StatusCommand {
    fn name(&self) -> &'static str {
        "mc_status"
    }
    fn description(&self) -> &'static str {
        "Show the current state of the Minecraft server."
    }

    async fn handle(
        &self,
        ctx: &CommandContext,
        _registry: &CommandRegistry,
    ) -> Result<(), ChatError> {
        let Some((instance, info)) = instance_info(ctx, STATUS_ERROR).await? else {
            return Ok(());
        };
        let mut content = format!("Minecraft server ({}) status: `{}`", instance.name, info.status);
        if let Some(ip) = info.external_ip {
            content.push_str(&format!("\nIP address: `{ip}`"));
        }
        ctx.reply(Message::text(content)).await?;
        Ok(())
    }
}

pub struct StartCommand;

#[async_trait]
impl CommandHandler for StartCommand {
    fn name(&self) -> &'static str {
        "mc_start"
    }
    fn description(&self) -> &'static str {
        "Start the Minecraft server."
    }

    async fn handle(
        &self,
        ctx: &CommandContext,
        _registry: &CommandRegistry,
    ) -> Result<(), ChatError> {
        let _guard = ctx.control_lock.lock().await;

        let Some((instance, info)) = instance_info(ctx, STATUS_ERROR).await? else {
            return Ok(());
        };

        match info.status {
            InstanceStatus::Running => {
                let ip = info
                    .external_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                ctx.reply(Message::text(format!(
                    "The server is already running. IP address: `{ip}`"
                )))
                .await?;
            }
            InstanceStatus::Terminated => {
                let handle = ctx
                    .reply(Message::text(
                        "Starting the server... this can take a few minutes.",
                    ))
                    .await?;

                if let Err(err) = ctx.compute.start_instance(&instance).await {
                    error!("couldn't start {instance}: {err}");
                    ctx.update(
                        &handle,
                        Message::text("Failed to start the server. Check the logs."),
                    )
                    .await?;
                    return Ok(());
                }
                info!("started {instance}");

                // the external IP is only assigned once the VM is up
                tokio::time::sleep(Duration::from_secs(ctx.config.start_ip_wait_secs)).await;
                let ip = match ctx.compute.get_instance(&instance).await {
                    Ok(info) => info.external_ip,
                    Err(err) => {
                        warn!("couldn't get the IP after starting: {err}");
                        None
                    }
                };
                let content = match ip {
                    Some(ip) => format!("The server is up! IP address:\n```{ip}```"),
                    None => "The server is starting, but its IP address isn't available yet. \
                             Check again with `/mc_status` in a bit."
                        .to_string(),
                };
                ctx.update(&handle, Message::text(content)).await?;
            }
            other => {
                ctx.reply(Message::text(format!(
                    "The server is currently `{other}` and can't be started."
                )))
                .await?;
            }
        }
        Ok(())
    }
}

pub struct BackupCommand;

#[async_trait]
impl CommandHandler for BackupCommand {
    fn name(&self) -> &'static str {
        "mc_backup"
    }
    fn description(&self) -> &'static str {
        "Back up the Minecraft server by snapshotting its disk."
    }

    async fn handle(
        &self,
        ctx: &CommandContext,
        _registry: &CommandRegistry,
    ) -> Result<(), ChatError> {
        let _guard = ctx.control_lock.lock().await;

        let Some((instance, info)) = instance_info(
            ctx,
            "Couldn't get the server status, so no backup was made.",
        )
        .await?
        else {
            return Ok(());
        };

        // snapshots of a running disk are allowed, just not mid-transition
        if !matches!(
            info.status,
            InstanceStatus::Running | InstanceStatus::Terminated
        ) {
            ctx.reply(Message::text(format!(
                "The server is currently `{}`, backups can't be made in this state.",
                info.status
            )))
            .await?;
            return Ok(());
        }

        let Some(disk) = info.boot_disk else {
            ctx.reply(Message::text(
                "Couldn't find the server's boot disk, so no backup was made.",
            ))
            .await?;
            return Ok(());
        };

        let handle = ctx
            .reply(Message::text(format!("Creating a snapshot of `{disk}`...")))
            .await?;

        let content = match snapshot_disk(
            ctx.compute.as_ref(),
            &instance,
            &disk,
            &ctx.config.snapshot_prefix,
            "from the mc_backup command",
        )
        .await
        {
            Ok(name) => format!(
                "Snapshot started.\nName: `{name}`\nIt can take a few minutes to finish."
            ),
            Err(err) => {
                error!("couldn't snapshot {disk}: {err}");
                format!("Snapshot failed.\nError: `{err}`")
            }
        };
        ctx.update(&handle, Message::text(content)).await?;
        Ok(())
    }
}

pub struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    fn name(&self) -> &'static str {
        "help"
    }
    fn description(&self) -> &'static str {
        "List the available commands."
    }

    async fn handle(
        &self,
        ctx: &CommandContext,
        registry: &CommandRegistry,
    ) -> Result<(), ChatError> {
        let mut content = "**Commands**".to_string();
        for command in registry.specs() {
            content.push_str(&format!("\n**/{}**: {}", command.name, command.description));
        }
        ctx.reply(Message::text(content)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::{
        chat::tests::FakeChat,
        controller::tests::{FakeCompute, test_config},
    };

    fn context(chat: &Arc<FakeChat>, compute: &Arc<FakeCompute>) -> CommandContext {
        CommandContext::new(
            chat.clone(),
            compute.clone(),
            Arc::new(test_config()),
            Arc::new(Mutex::new(())),
            99,
        )
    }

    fn stopped() -> FakeCompute {
        let compute = FakeCompute::running(None);
        compute.info.lock().as_mut().unwrap().status = InstanceStatus::Terminated;
        compute
    }

    #[tokio::test]
    async fn test_status() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::running(Some(IpAddr::V4(Ipv4Addr::new(
            203, 0, 113, 1,
        )))));
        CommandRegistry::standard()
            .dispatch_command("mc_status", &context(&chat, &compute))
            .await
            .unwrap();

        assert_eq!(
            chat.transcript(),
            ["Minecraft server (minecraft-server) status: `RUNNING`\nIP address: `203.0.113.1`"]
        );
        assert_eq!(chat.sent.lock()[0].0, 99);
    }

    #[tokio::test]
    async fn test_status_api_error() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::default());
        CommandRegistry::standard()
            .dispatch_command("mc_status", &context(&chat, &compute))
            .await
            .unwrap();
        assert_eq!(chat.transcript(), [STATUS_ERROR]);
    }

    #[tokio::test]
    async fn test_start_when_stopped() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(stopped());
        CommandRegistry::standard()
            .dispatch_command("mc_start", &context(&chat, &compute))
            .await
            .unwrap();

        assert_eq!(compute.calls(), ["get", "start", "get"]);
        assert_eq!(
            chat.transcript(),
            [
                "Starting the server... this can take a few minutes.",
                "The server is up! IP address:\n```203.0.113.7```"
            ]
        );
        // the update edits the acknowledgement
        let sent_handle = MessageHandle {
            channel_id: 99,
            message_id: "1".to_string(),
        };
        assert_eq!(chat.edits.lock()[0].0, sent_handle);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute {
            fail_start: true,
            ..stopped()
        });
        CommandRegistry::standard()
            .dispatch_command("mc_start", &context(&chat, &compute))
            .await
            .unwrap();
        assert_eq!(
            chat.transcript().last().unwrap(),
            "Failed to start the server. Check the logs."
        );
    }

    #[tokio::test]
    async fn test_start_when_running() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::running(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))));
        CommandRegistry::standard()
            .dispatch_command("mc_start", &context(&chat, &compute))
            .await
            .unwrap();
        assert_eq!(
            chat.transcript(),
            ["The server is already running. IP address: `127.0.0.1`"]
        );
        assert_eq!(compute.calls(), ["get"]);
    }

    #[tokio::test]
    async fn test_start_in_other_state() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::running(None));
        compute.info.lock().as_mut().unwrap().status = InstanceStatus::Stopping;
        CommandRegistry::standard()
            .dispatch_command("mc_start", &context(&chat, &compute))
            .await
            .unwrap();
        assert_eq!(
            chat.transcript(),
            ["The server is currently `STOPPING` and can't be started."]
        );
    }

    #[tokio::test]
    async fn test_button_edits_its_message() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(stopped());
        let source = MessageHandle {
            channel_id: 99,
            message_id: "555".to_string(),
        };
        let ctx = context(&chat, &compute).with_source(Some(source.clone()));
        CommandRegistry::standard()
            .dispatch_button(START_BUTTON_ID, &ctx)
            .await
            .unwrap();

        assert!(chat.sent.lock().is_empty());
        let edits = chat.edits.lock();
        assert_eq!(edits.len(), 2);
        for (handle, message) in edits.iter() {
            assert_eq!(*handle, source);
            assert_eq!(message.button, Some(start_button(true)));
        }
    }

    #[tokio::test]
    async fn test_button_without_message_starts_server() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(stopped());
        CommandRegistry::standard()
            .dispatch_button(START_BUTTON_ID, &context(&chat, &compute))
            .await
            .unwrap();

        assert_eq!(compute.calls(), ["get", "start", "get"]);
        assert_eq!(
            chat.transcript(),
            [
                "Starting the server... this can take a few minutes.",
                "The server is up! IP address:\n```203.0.113.7```"
            ]
        );
    }

    #[tokio::test]
    async fn test_command_name_isnt_a_button() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(stopped());
        CommandRegistry::standard()
            .dispatch_button("mc_start", &context(&chat, &compute))
            .await
            .unwrap();

        assert!(compute.calls().is_empty());
        assert_eq!(chat.transcript(), ["Unknown button `mc_start`."]);
    }

    #[tokio::test]
    async fn test_backup() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::running(None));
        CommandRegistry::standard()
            .dispatch_command("mc_backup", &context(&chat, &compute))
            .await
            .unwrap();

        let calls = compute.calls();
        assert!(calls[1].starts_with("snapshot boot mc-"), "{calls:?}");
        let transcript = chat.transcript();
        assert_eq!(transcript[0], "Creating a snapshot of `boot`...");
        assert!(transcript[1].starts_with("Snapshot started.\nName: `mc-"));
    }

    #[tokio::test]
    async fn test_backup_failure_is_reported() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute {
            fail_snapshot: true,
            ..FakeCompute::running(None)
        });
        CommandRegistry::standard()
            .dispatch_command("mc_backup", &context(&chat, &compute))
            .await
            .unwrap();
        assert!(chat.transcript()[1].starts_with("Snapshot failed."));
    }

    #[tokio::test]
    async fn test_backup_refused_mid_transition() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::running(None));
        compute.info.lock().as_mut().unwrap().status = InstanceStatus::Provisioning;
        CommandRegistry::standard()
            .dispatch_command("mc_backup", &context(&chat, &compute))
            .await
            .unwrap();
        assert_eq!(compute.calls(), ["get"]);
        assert_eq!(
            chat.transcript(),
            ["The server is currently `PROVISIONING`, backups can't be made in this state."]
        );
    }

    #[tokio::test]
    async fn test_help_lists_commands() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::default());
        CommandRegistry::standard()
            .dispatch_command("help", &context(&chat, &compute))
            .await
            .unwrap();

        let help = &chat.transcript()[0];
        for name in ["/help", "/mc_backup", "/mc_start", "/mc_status"] {
            assert!(help.contains(name), "{help}");
        }
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let chat = Arc::new(FakeChat::default());
        let compute = Arc::new(FakeCompute::default());
        CommandRegistry::standard()
            .dispatch_command("mc_explode", &context(&chat, &compute))
            .await
            .unwrap();
        assert_eq!(chat.transcript(), ["Unknown command `mc_explode`."]);
        assert!(compute.calls().is_empty());
    }
}
