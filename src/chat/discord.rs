//! Just enough of the Discord REST API to post and edit messages and register
//! slash commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Button, ChatApi, ChatError, CommandSpec, Message, MessageHandle};

pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

// component and command type ids from the Discord docs
const ACTION_ROW: u8 = 1;
const BUTTON: u8 = 2;
const BUTTON_STYLE_SUCCESS: u8 = 3;
const CHAT_INPUT_COMMAND: u8 = 1;

pub struct DiscordClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    application_id: Option<u64>,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    content: &'a str,
    components: Vec<ActionRow<'a>>,
}

#[derive(Serialize)]
struct ActionRow<'a> {
    #[serde(rename = "type")]
    kind: u8,
    components: Vec<ButtonComponent<'a>>,
}

#[derive(Serialize)]
struct ButtonComponent<'a> {
    #[serde(rename = "type")]
    kind: u8,
    style: u8,
    label: &'a str,
    custom_id: &'a str,
    disabled: bool,
}

#[derive(Serialize)]
struct CommandBody<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Deserialize)]
struct CreatedMessage {
    id: String,
}

impl<'a> MessageBody<'a> {
    fn new(message: &'a Message) -> Self {
        // always sending the components means an edit without a button
        // removes the old one
        let components = message
            .button
            .iter()
            .map(|button: &Button| ActionRow {
                kind: ACTION_ROW,
                components: vec![ButtonComponent {
                    kind: BUTTON,
                    style: BUTTON_STYLE_SUCCESS,
                    label: &button.label,
                    custom_id: &button.custom_id,
                    disabled: button.disabled,
                }],
            })
            .collect();
        Self {
            content: &message.content,
            components,
        }
    }
}

impl DiscordClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Option<&str>,
        token: String,
        application_id: Option<u64>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            token,
            application_id,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ChatError> {
        let response = request
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::Api { status, body })
    }
}

#[async_trait]
impl ChatApi for DiscordClient {
    async fn send_message(
        &self,
        channel_id: u64,
        message: &Message,
    ) -> Result<MessageHandle, ChatError> {
        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let created: CreatedMessage = self
            .send(self.http.post(url).json(&MessageBody::new(message)))
            .await?
            .json()
            .await?;
        debug!("sent message {} to channel {channel_id}", created.id);
        Ok(MessageHandle {
            channel_id,
            message_id: created.id,
        })
    }

    async fn edit_message(
        &self,
        handle: &MessageHandle,
        message: &Message,
    ) -> Result<(), ChatError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, handle.channel_id, handle.message_id
        );
        self.send(self.http.patch(url).json(&MessageBody::new(message)))
            .await?;
        debug!("edited message {}", handle.message_id);
        Ok(())
    }

    async fn register_commands(&self, commands: &[CommandSpec]) -> Result<(), ChatError> {
        let Some(application_id) = self.application_id else {
            warn!("discord.application_id isn't set, not registering slash commands");
            return Ok(());
        };

        let body = commands
            .iter()
            .map(|c| CommandBody {
                name: &c.name,
                description: &c.description,
                kind: CHAT_INPUT_COMMAND,
            })
            .collect::<Vec<_>>();
        let url = format!("{}/applications/{application_id}/commands", self.base_url);
        // PUT replaces the whole set, so removed commands disappear too
        self.send(self.http.put(url).json(&body)).await?;
        info!("registered {} slash commands", commands.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path},
    };

    use super::*;
    use crate::chat::start_button;

    fn client(server: &MockServer, application_id: Option<u64>) -> DiscordClient {
        DiscordClient::new(
            reqwest::Client::new(),
            Some(&server.uri()),
            "bot-token".to_string(),
            application_id,
        )
    }

    #[tokio::test]
    async fn test_send_message_with_button() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/42/messages"))
            .and(header("Authorization", "Bot bot-token"))
            .and(body_json(json!({
                "content": "stopped",
                "components": [{
                    "type": 1,
                    "components": [{
                        "type": 2,
                        "style": 3,
                        "label": "Start Minecraft server",
                        "custom_id": "start_minecraft_server_button",
                        "disabled": false
                    }]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "1001" })))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::text("stopped").with_button(start_button(false));
        let handle = client(&server, None).send_message(42, &message).await.unwrap();
        assert_eq!(
            handle,
            MessageHandle {
                channel_id: 42,
                message_id: "1001".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_edit_message() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/42/messages/1001"))
            .and(body_json(json!({ "content": "edited", "components": [] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "1001" })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = MessageHandle {
            channel_id: 42,
            message_id: "1001".to_string(),
        };
        client(&server, None)
            .edit_message(&handle, &Message::text("edited"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Missing Access"))
            .mount(&server)
            .await;

        let err = client(&server, None)
            .send_message(42, &Message::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Api { status, ref body }
                if status == reqwest::StatusCode::FORBIDDEN && body == "Missing Access"
        ));
    }

    #[tokio::test]
    async fn test_register_commands() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/applications/7/commands"))
            .and(body_json(json!([
                { "name": "mc_status", "description": "Status.", "type": 1 }
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let commands = [CommandSpec {
            name: "mc_status".to_string(),
            description: "Status.".to_string(),
        }];
        client(&server, Some(7))
            .register_commands(&commands)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_without_application_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        client(&server, None).register_commands(&[]).await.unwrap();
    }
}
