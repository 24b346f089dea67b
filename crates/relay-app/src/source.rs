//! HTTP adapters for the ticketing backend: history fetch, attachment
//! download and ticket creation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use relay_config::SourceConfigToml;
use relay_core::{
    Actor, AttachmentRef, AttachmentSource, CoreError, CreatedTicket, Environment, EventPayload,
    HistoryEvent, HistoryKind, NewTicketRequest, TicketCreator, TicketHistorySource, TicketId,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const USER_AGENT: &str = "ticket-relay/0.1";
const ERROR_BODY_LIMIT: usize = 400;

#[derive(Clone)]
struct SourceClient {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
}

impl fmt::Debug for SourceClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SourceClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SourceClient {
    fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self, CoreError> {
        let base_url = Url::parse(base_url.trim()).map_err(|error| {
            CoreError::Configuration(format!("invalid source base url '{base_url}': {error}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CoreError::Configuration(format!(
                "source base url '{base_url}' cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!("failed to build HTTP client: {error}"))
            })?;
        let api_token = Some(api_token.trim().to_owned()).filter(|token| !token.is_empty());

        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    /// Expands `{ticket_id}` and `{name}` per path segment, so substituted
    /// values are percent-encoded and can never add segments.
    fn url_for(&self, template: &str, ticket_id: &TicketId, name: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for segment in template.split('/').filter(|segment| !segment.is_empty()) {
                let mut expanded = segment.replace("{ticket_id}", ticket_id.as_str());
                if let Some(name) = name {
                    expanded = expanded.replace("{name}", name);
                }
                segments.push(&expanded);
            }
        }
        url
    }

    async fn get(&self, url: Url, environment: &Environment) -> Result<reqwest::Response, CoreError> {
        let mut request = self
            .client
            .get(url.clone())
            .query(&[("environment", environment.as_str())]);
        if let Some(token) = self.api_token.as_deref() {
            request = request.bearer_auth(token);
        }

        request.send().await.map_err(|error| {
            CoreError::DependencyUnavailable(format!("request to {url} failed: {error}"))
        })
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
    ) -> Result<reqwest::Response, CoreError> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(token) = self.api_token.as_deref() {
            request = request.bearer_auth(token);
        }

        request.send().await.map_err(|error| {
            CoreError::DependencyUnavailable(format!("request to {url} failed: {error}"))
        })
    }
}

async fn failure_from(response: reqwest::Response) -> CoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    CoreError::DependencyUnavailable(format!("ticket backend returned {status}: {body}"))
}

/// Reads a ticket's full audit trail over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHistorySource {
    client: SourceClient,
    history_path: String,
}

impl HttpHistorySource {
    pub fn from_config(config: &SourceConfigToml, timeout: Duration) -> Result<Self, CoreError> {
        Ok(Self {
            client: SourceClient::new(&config.base_url, &config.api_token, timeout)?,
            history_path: config.history_path.clone(),
        })
    }
}

#[async_trait]
impl TicketHistorySource for HttpHistorySource {
    async fn fetch(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
    ) -> Result<Vec<HistoryEvent>, CoreError> {
        let url = self.client.url_for(&self.history_path, ticket_id, None);
        let response = self.client.get(url, environment).await?;
        if !response.status().is_success() {
            return Err(failure_from(response).await);
        }

        let body = response.text().await.map_err(|error| {
            CoreError::DependencyUnavailable(format!("failed to read history response: {error}"))
        })?;
        let events = parse_history(&body)?;
        debug!(ticket_id = %ticket_id, events = events.len(), "fetched ticket history");
        Ok(events)
    }
}

/// Downloads attachment content over HTTP. A 404 means the attachment is
/// gone, which is not an error.
#[derive(Debug, Clone)]
pub struct HttpAttachmentSource {
    client: SourceClient,
    attachment_path: String,
}

impl HttpAttachmentSource {
    pub fn from_config(config: &SourceConfigToml, timeout: Duration) -> Result<Self, CoreError> {
        Ok(Self {
            client: SourceClient::new(&config.base_url, &config.api_token, timeout)?,
            attachment_path: config.attachment_path.clone(),
        })
    }
}

#[async_trait]
impl AttachmentSource for HttpAttachmentSource {
    async fn fetch(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
        name: &str,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let url = self
            .client
            .url_for(&self.attachment_path, ticket_id, Some(name));
        let response = self.client.get(url, environment).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(failure_from(response).await);
        }

        let bytes = response.bytes().await.map_err(|error| {
            CoreError::DependencyUnavailable(format!("failed to read attachment '{name}': {error}"))
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Opens tickets for inbound messages over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTicketCreator {
    client: SourceClient,
    create_path: String,
    environment: Environment,
}

impl HttpTicketCreator {
    pub fn from_config(
        config: &SourceConfigToml,
        environment: Environment,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            client: SourceClient::new(&config.base_url, &config.api_token, timeout)?,
            create_path: config.create_path.clone(),
            environment,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCreateRequest<'a> {
    sender_email: &'a str,
    subject: &'a str,
    body: &'a str,
    environment: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCreateResponse {
    #[serde(alias = "id")]
    ticket_id: serde_json::Value,
    #[serde(default)]
    environment: Option<String>,
}

#[async_trait]
impl TicketCreator for HttpTicketCreator {
    async fn create_ticket(&self, request: NewTicketRequest) -> Result<CreatedTicket, CoreError> {
        let url = self
            .client
            .url_for(&self.create_path, &TicketId::new(""), None);
        let wire = WireCreateRequest {
            sender_email: &request.sender_email,
            subject: &request.subject,
            body: &request.body,
            environment: self.environment.as_str(),
        };
        let response = self.client.post_json(url, &wire).await?;
        if !response.status().is_success() {
            return Err(failure_from(response).await);
        }

        let body = response.text().await.map_err(|error| {
            CoreError::DependencyUnavailable(format!("failed to read create response: {error}"))
        })?;
        parse_created(&body, &self.environment)
    }
}

fn parse_created(body: &str, fallback: &Environment) -> Result<CreatedTicket, CoreError> {
    let response: WireCreateResponse = serde_json::from_str(body).map_err(|error| {
        CoreError::DependencyUnavailable(format!("failed to decode create response: {error}"))
    })?;
    let ticket_id = scalar_text(response.ticket_id)
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            CoreError::DependencyUnavailable("create response carried no ticket id".to_owned())
        })?;
    let environment = non_blank(response.environment)
        .map(Environment::new)
        .unwrap_or_else(|| fallback.clone());

    Ok(CreatedTicket {
        ticket_id: TicketId::new(ticket_id),
        environment,
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Items(Vec<WireHistoryItem>),
    Wrapped { items: Vec<WireHistoryItem> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHistoryItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    user: Option<WireUser>,
    #[serde(default)]
    state: Option<WireState>,
    #[serde(default)]
    target_state: Option<WireState>,
    #[serde(default)]
    observation_description: Option<String>,
    #[serde(default)]
    attachment_description: Option<String>,
    #[serde(default)]
    attachment_id: Option<serde_json::Value>,
    #[serde(default)]
    attachment_version: Option<u32>,
    #[serde(default)]
    chosen_assignees: Vec<WireAssignee>,
    #[serde(default)]
    movement_sequence: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireState {
    #[serde(default)]
    state_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAssignee {
    #[serde(default)]
    name: Option<String>,
}

fn parse_history(body: &str) -> Result<Vec<HistoryEvent>, CoreError> {
    let response: HistoryResponse = serde_json::from_str(body).map_err(|error| {
        CoreError::DependencyUnavailable(format!("failed to decode history response: {error}"))
    })?;
    let items = match response {
        HistoryResponse::Items(items) | HistoryResponse::Wrapped { items } => items,
    };

    Ok(items.into_iter().filter_map(into_event).collect())
}

fn scalar_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn into_event(item: WireHistoryItem) -> Option<HistoryEvent> {
    let kind = match item.kind.trim().to_ascii_uppercase().as_str() {
        "MOVEMENT" => HistoryKind::Transition,
        "OBSERVATION" => HistoryKind::Comment,
        "ATTACHMENT" => HistoryKind::Attachment,
        other => {
            warn!(kind = other, "skipping history entry of unknown type");
            return None;
        }
    };

    let actor = item
        .user
        .map(|user| Actor {
            name: non_blank(user.name).unwrap_or_default(),
            code: user.code.and_then(scalar_text),
        })
        .unwrap_or_default();

    let attachment = match kind {
        HistoryKind::Attachment => non_blank(item.attachment_description).map(|name| AttachmentRef {
            name,
            id: item.attachment_id.and_then(scalar_text),
            version: item.attachment_version,
        }),
        _ => None,
    };

    let payload = EventPayload {
        state_name: item.state.and_then(|state| non_blank(state.state_name)),
        target_state: item.target_state.and_then(|state| non_blank(state.state_name)),
        comment: non_blank(item.observation_description),
        assignees: item
            .chosen_assignees
            .into_iter()
            .filter_map(|assignee| non_blank(assignee.name))
            .collect(),
        movement_sequence: item.movement_sequence,
        attachment,
    };

    Some(HistoryEvent {
        kind,
        timestamp: item.date.unwrap_or_default(),
        actor,
        payload,
    })
}
