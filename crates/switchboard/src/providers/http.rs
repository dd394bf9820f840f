use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use super::base::{AuthStyle, ByteStream, ProviderRequest};
use super::utils::{classify_error_message, extract_error_message};
use crate::errors::{ProviderError, ProviderErrorKind};

/// Shared HTTP plumbing for every adapter. Turns transport failures and
/// non-success statuses into classified `ProviderError`s.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::fatal("http", e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn post(
        &self,
        provider: &str,
        host: &str,
        request: &ProviderRequest,
        auth: &AuthStyle,
        secret: Option<&str>,
    ) -> Result<Response, ProviderError> {
        let url = format!(
            "{}/{}",
            host.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );

        let mut builder = self.client.post(&url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match (auth, secret) {
            (AuthStyle::Bearer, Some(secret)) => {
                builder.header("Authorization", format!("Bearer {}", secret))
            }
            (AuthStyle::Header(name), Some(secret)) => builder.header(name, secret),
            _ => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(provider, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(provider, %status, "provider request failed");
        Err(classify_status(provider, status, retry_after, &body))
    }
}

/// Map an HTTP status and body onto the shared error taxonomy.
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or_else(|| format!("{}: {}", status, body));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::auth(provider, message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::rate_limit(provider, message, retry_after),
        StatusCode::REQUEST_TIMEOUT => ProviderError::transient(provider, message),
        status if status.is_server_error() => ProviderError::transient(provider, message),
        _ => match classify_error_message(body) {
            Some(ProviderErrorKind::ContentPolicy) => ProviderError::content_policy(provider, message),
            Some(ProviderErrorKind::RateLimit) => {
                ProviderError::rate_limit(provider, message, retry_after)
            }
            _ => ProviderError::fatal(provider, message),
        },
    }
}

fn classify_reqwest_error(provider: &str, error: &reqwest::Error) -> ProviderError {
    if error.is_builder() {
        ProviderError::fatal(provider, error.to_string())
    } else {
        ProviderError::transient(provider, error.to_string())
    }
}

/// Retry-After in delta-seconds form; HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Expose a response body as a byte stream with transport errors classified.
pub fn byte_stream(provider: &str, response: Response) -> ByteStream {
    let provider = provider.to_string();
    response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| ProviderError::transient(&provider, e.to_string())))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ProviderRequest {
        ProviderRequest {
            path: "/v1/chat/completions".to_string(),
            headers: vec![("x-extra".to_string(), "1".to_string())],
            body: json!({"model": "gpt-4o"}),
            stream: false,
        }
    }

    #[test]
    fn test_classify_status() {
        let cases = [
            (StatusCode::UNAUTHORIZED, "", ProviderErrorKind::Auth),
            (StatusCode::FORBIDDEN, "", ProviderErrorKind::Auth),
            (StatusCode::TOO_MANY_REQUESTS, "", ProviderErrorKind::RateLimit),
            (StatusCode::REQUEST_TIMEOUT, "", ProviderErrorKind::Transient),
            (StatusCode::BAD_GATEWAY, "", ProviderErrorKind::Transient),
            (StatusCode::NOT_FOUND, "", ProviderErrorKind::Fatal),
            (
                StatusCode::BAD_REQUEST,
                r#"{"error": {"code": "content_policy_violation", "message": "refused"}}"#,
                ProviderErrorKind::ContentPolicy,
            ),
            (
                StatusCode::BAD_REQUEST,
                r#"{"error": {"message": "bad field"}}"#,
                ProviderErrorKind::Fatal,
            ),
        ];

        for (status, body, kind) in cases {
            assert_eq!(
                classify_status("openai", status, None, body).kind,
                kind,
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_classify_status_extracts_message() {
        let error = classify_status(
            "openai",
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error": {"message": "bad field"}}"#,
        );
        assert_eq!(error.message, "bad field");
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("-1"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_post_attaches_auth_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(header("x-extra", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::default();
        let response = transport
            .post("openai", &server.uri(), &request(), &AuthStyle::Bearer, Some("sk-test"))
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_post_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_json(json!({"error": {"message": "too many requests"}})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::default();
        let error = transport
            .post("openai", &server.uri(), &request(), &AuthStyle::Bearer, Some("k"))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ProviderErrorKind::RateLimit);
        assert_eq!(error.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(error.message, "too many requests");
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let transport = HttpTransport::default();
        let error = transport
            .post("openai", "http://127.0.0.1:1", &request(), &AuthStyle::None, None)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ProviderErrorKind::Transient);
    }
}
