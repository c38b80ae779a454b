use super::provider::{CalendarProvider, ProviderError};
use crate::error::CoreError;
use crate::models::EventPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
}

impl<'a> From<&'a EventPayload> for EventBody<'a> {
    fn from(payload: &'a EventPayload) -> Self {
        Self {
            title: &payload.title,
            description: payload.description.as_deref(),
            starts_at: payload.starts_at,
            ends_at: payload.ends_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedEvent {
    id: String,
}

/// REST calendar provider.
///
/// Events live under `{base_url}/calendars/{calendar_id}/events`. Requests
/// carry a bearer token when configured and the intent's idempotency key in
/// the `Idempotency-Key` header.
#[derive(Debug, Clone)]
pub struct HttpCalendarProvider {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpCalendarProvider {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, CoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CoreError::InvalidInput(format!("Invalid calendar base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CoreError::InvalidInput(format!("Calendar base URL '{}' cannot hold paths", base_url)));
        }

        let client = Client::builder()
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::InvalidInput(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url, token })
    }

    fn events_url(&self, calendar_id: &str, event_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["calendars", calendar_id, "events"]);
            if let Some(event_id) = event_id {
                segments.push(event_id);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url, key: Uuid) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, key.to_string());
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(err.to_string())
    }
}

/// Maps a non-success HTTP status onto the provider error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        404 | 410 => ProviderError::Gone(body),
        401 | 403 => ProviderError::Unauthorized(body),
        408 => ProviderError::Timeout,
        429 => ProviderError::RateLimited,
        code @ 500..=599 => ProviderError::Server(code),
        code => ProviderError::Rejected(format!("HTTP {}: {}", code, body)),
    }
}

#[async_trait]
impl CalendarProvider for HttpCalendarProvider {
    async fn create_event(&self, idempotency_key: Uuid, payload: &EventPayload) -> Result<String, ProviderError> {
        let url = self.events_url(&payload.calendar_id, None);
        debug!(%url, key = %idempotency_key, "Creating calendar event");

        let response = self
            .send(self.request(Method::POST, url, idempotency_key).json(&EventBody::from(payload)))
            .await?;
        let created: CreatedEvent = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("Unreadable create response: {}", e)))?;
        Ok(created.id)
    }

    async fn update_event(
        &self,
        idempotency_key: Uuid,
        external_event_id: &str,
        payload: &EventPayload,
    ) -> Result<(), ProviderError> {
        let url = self.events_url(&payload.calendar_id, Some(external_event_id));
        debug!(%url, key = %idempotency_key, "Updating calendar event");

        self.send(self.request(Method::PATCH, url, idempotency_key).json(&EventBody::from(payload)))
            .await?;
        Ok(())
    }

    async fn cancel_event(
        &self,
        idempotency_key: Uuid,
        external_event_id: &str,
        calendar_id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.events_url(calendar_id, Some(external_event_id));
        debug!(%url, key = %idempotency_key, "Cancelling calendar event");

        self.send(self.request(Method::DELETE, url, idempotency_key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> EventPayload {
        let start = Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap();
        EventPayload {
            calendar_id: "team-ops".to_string(),
            title: "Standup".to_string(),
            description: Some("Daily sync".to_string()),
            starts_at: start,
            ends_at: start + Duration::minutes(30),
        }
    }

    #[rstest]
    #[case(404, "Gone")]
    #[case(410, "Gone")]
    #[case(401, "Unauthorized")]
    #[case(403, "Unauthorized")]
    #[case(429, "RateLimited")]
    #[case(503, "Server")]
    #[case(422, "Rejected")]
    fn test_classify_status(#[case] code: u16, #[case] expected: &str) {
        let error = classify_status(StatusCode::from_u16(code).unwrap(), String::new());
        let name = format!("{:?}", error);
        assert!(name.starts_with(expected), "{} mapped to {}", code, name);
    }

    #[tokio::test]
    async fn test_create_sends_key_and_token() {
        let server = MockServer::start().await;
        let key = Uuid::now_v7();

        Mock::given(method("POST"))
            .and(path("/v1/calendars/team-ops/events"))
            .and(header("Idempotency-Key", key.to_string().as_str()))
            .and(header("Authorization", "Bearer secret"))
            .and(body_partial_json(json!({ "title": "Standup" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "evt-42" })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpCalendarProvider::new(&format!("{}/v1", server.uri()), Some("secret".into())).unwrap();
        let id = provider.create_event(key, &payload()).await.unwrap();

        assert_eq!(id, "evt-42");
    }

    #[tokio::test]
    async fn test_update_maps_server_error_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/calendars/team-ops/events/evt-1"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let provider = HttpCalendarProvider::new(&server.uri(), None).unwrap();
        let error = provider.update_event(Uuid::now_v7(), "evt-1", &payload()).await.unwrap_err();

        assert_eq!(error, ProviderError::Server(502));
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_cancel_of_missing_event_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/team-ops/events/evt-1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such event"))
            .mount(&server)
            .await;

        let provider = HttpCalendarProvider::new(&server.uri(), None).unwrap();
        let error = provider.cancel_event(Uuid::now_v7(), "evt-1", "team-ops").await.unwrap_err();

        assert_eq!(error, ProviderError::Gone("no such event".to_string()));
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(HttpCalendarProvider::new("not a url", None).is_err());
        assert!(HttpCalendarProvider::new("mailto:ops@example.com", None).is_err());
    }
}
