//! The HTTP endpoints that schedulers, the idle check's webhook and the chat
//! gateway call.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    chat::{ChatEvent, ChatHandle, MessageHandle, RELAY_TIMEOUT},
    config::Config,
    controller::{IdleShutdown, Report},
    notify::WEBHOOK_SECRET_HEADER,
    sweeper::RetentionSweeper,
};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<IdleShutdown>,
    pub sweeper: Arc<RetentionSweeper>,
    /// `None` when the Discord side isn't configured.
    pub chat: Option<ChatHandle>,
    pub config: Arc<Config>,
    pub control_lock: Arc<Mutex<()>>,
}

/// What the chat gateway forwards to `/interactions`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Interaction {
    Command {
        name: String,
    },
    Button {
        custom_id: String,
        #[serde(default)]
        channel_id: Option<u64>,
        #[serde(default)]
        message_id: Option<String>,
    },
}

impl From<Interaction> for ChatEvent {
    fn from(interaction: Interaction) -> Self {
        match interaction {
            Interaction::Command { name } => ChatEvent::Command { name },
            Interaction::Button {
                custom_id,
                channel_id,
                message_id,
            } => ChatEvent::Button {
                custom_id,
                message: channel_id.zip(message_id).map(|(channel_id, message_id)| {
                    MessageHandle {
                        channel_id,
                        message_id,
                    }
                }),
            },
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/check", post(check))
        .route("/sweep", post(sweep))
        .route("/webhook/vm-stopped", post(vm_stopped))
        .route("/interactions", post(interactions))
        .with_state(state)
}

impl IntoResponse for Report {
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, self.message).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn check(State(state): State<AppState>) -> Report {
    let _guard = state.control_lock.lock().await;
    info!("running idle check");
    state.controller.check().await
}

async fn sweep(State(state): State<AppState>) -> Report {
    let _guard = state.control_lock.lock().await;
    info!("running snapshot cleanup");
    state.sweeper.sweep().await
}

async fn vm_stopped(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state.config, &headers) {
        warn!("rejected vm-stopped webhook with a bad secret");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let Some(chat) = &state.chat else {
        error!("got a vm-stopped webhook but the chat isn't configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Chat notifications aren't configured.",
        )
            .into_response();
    };

    match chat.relay_vm_stopped(RELAY_TIMEOUT).await {
        Ok(()) => (StatusCode::OK, "Webhook processed and notification sent.").into_response(),
        Err(err) => {
            error!("couldn't relay vm-stopped notification: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to send notification: {err}"),
            )
                .into_response()
        }
    }
}

async fn interactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(interaction): Json<Interaction>,
) -> Response {
    if !authorized(&state.config, &headers) {
        warn!("rejected interaction with a bad secret");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let Some(chat) = &state.chat else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Chat isn't configured.").into_response();
    };

    match chat.try_send(interaction.into()) {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(event) => {
            warn!("chat queue is full or closed, dropping {event:?}");
            (StatusCode::SERVICE_UNAVAILABLE, "Busy, try again later.").into_response()
        }
    }
}

fn authorized(config: &Config, headers: &HeaderMap) -> bool {
    let Some(secret) = &config.webhook_secret else {
        return true;
    };
    headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == secret)
}
