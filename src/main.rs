use std::{env, sync::Arc};

use dotenv::dotenv;
use eyre::{WrapErr, bail, eyre};
use mcidle::{
    chat::{ChatHandle, CommandContext, CommandRegistry, DiscordClient, chat_loop},
    compute::{ComputeApi, GceClient},
    config::{Config, ConfigError},
    controller::{IdleShutdown, Report},
    notify::WebhookNotifier,
    query::{self, QueryTarget, UdpQuery},
    server::{AppState, router},
    sweeper::RetentionSweeper,
    tracing::init_tracing,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How many chat events can be waiting before new ones are turned away.
const CHAT_QUEUE_CAPACITY: usize = 32;

const USAGE: &str = "usage: mcidle [serve|check|sweep|query <host> [port]]";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    let args = env::args().collect::<Box<[String]>>();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");

    let config_file = env::var("MCIDLE_CONFIG").unwrap_or("config.toml".to_string());
    let config = Config::load(&config_file).wrap_err_with(|| format!("loading {config_file}"))?;
    let config = Arc::new(config);

    init_tracing(&config);
    info!("Logging initialized");

    let http = reqwest::Client::new();

    match command {
        "serve" => serve(config, http).await,
        "check" => {
            let compute = compute_client(&config, http.clone());
            finish(idle_shutdown(&config, http, compute).check().await)
        }
        "sweep" => {
            let compute = compute_client(&config, http);
            finish(RetentionSweeper::new(compute, config).sweep().await)
        }
        "query" => {
            let host = args.get(2).ok_or_else(|| eyre!(USAGE))?;
            let port = match args.get(3) {
                Some(port) => port.parse().wrap_err_with(|| format!("invalid port {port:?}"))?,
                None => query::DEFAULT_PORT,
            };
            let target = QueryTarget::new(host.as_str())
                .with_port(port)
                .with_timeout(config.query_timeout());
            let count = query::query_player_count(&target).await?;
            println!("{count}");
            Ok(())
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn finish(report: Report) -> eyre::Result<()> {
    if !report.success {
        bail!("{report}");
    }
    println!("{report}");
    Ok(())
}

fn compute_client(config: &Config, http: reqwest::Client) -> Arc<dyn ComputeApi> {
    let base_url = config.compute_base_url.as_deref();
    match &config.access_token {
        Some(token) => Arc::new(GceClient::with_access_token(http, base_url, token.clone())),
        None => Arc::new(GceClient::with_metadata_server(http, base_url)),
    }
}

fn idle_shutdown(
    config: &Arc<Config>,
    http: reqwest::Client,
    compute: Arc<dyn ComputeApi>,
) -> IdleShutdown {
    let notifier = WebhookNotifier::new(
        http,
        config.notification_webhook_url.clone(),
        config.webhook_secret.clone(),
    );
    IdleShutdown::new(compute, Arc::new(UdpQuery), Arc::new(notifier), config.clone())
}

async fn serve(config: Arc<Config>, http: reqwest::Client) -> eyre::Result<()> {
    let compute = compute_client(&config, http.clone());
    let control_lock = Arc::new(Mutex::new(()));

    let chat = match start_chat(&config, http.clone(), compute.clone(), control_lock.clone()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Discord is disabled: {err}");
            None
        }
    };

    let state = AppState {
        controller: Arc::new(idle_shutdown(&config, http, compute.clone())),
        sweeper: Arc::new(RetentionSweeper::new(compute, config.clone())),
        chat,
        config: config.clone(),
        control_lock,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen_addr))?;
    info!("listening on {}", config.listen_addr);
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Spawn the chat loop. Fails if the bot token or channel isn't configured.
fn start_chat(
    config: &Arc<Config>,
    http: reqwest::Client,
    compute: Arc<dyn ComputeApi>,
    control_lock: Arc<Mutex<()>>,
) -> Result<ChatHandle, ConfigError> {
    let token = config.discord_bot_token()?;
    let channel_id = config.discord_channel_id()?;

    let discord = DiscordClient::new(
        http,
        config.discord.api_base_url.as_deref(),
        token.to_string(),
        config.discord.application_id,
    );
    let ctx = CommandContext::new(
        Arc::new(discord),
        compute,
        config.clone(),
        control_lock,
        channel_id,
    );
    let (handle, chat_loop) = chat_loop(CHAT_QUEUE_CAPACITY, CommandRegistry::standard(), ctx);
    tokio::spawn(chat_loop.run());
    info!("chat loop started for channel {channel_id}");

    Ok(handle)
}
