use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::captcha::{CaptchaError, CaptchaSolver, RuCaptcha};
use crate::config::VkConfig;
use crate::constants::{
    RATE_LIMIT_JITTER, VK_ERROR_CAPTCHA_NEEDED, VK_ERROR_TOO_MANY_REQUESTS,
    VK_PLAYLIST_URL_PREFIX,
};

#[derive(Error, Debug)]
pub enum VkError {
    #[error("VK request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("VK API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("VK rate limit persisted after {0} retries")]
    RateLimited(u32),
    #[error("VK asked for a captcha again after it was solved")]
    CaptchaUnsolved,
    #[error("VK requested a captcha and no solver is configured")]
    NoCaptchaSolver,
    #[error("Captcha solving failed: {0}")]
    Captcha(#[from] CaptchaError),
    #[error("Invalid VK response for {context}: {reason}")]
    InvalidResponse { context: String, reason: String },
    #[error("Invalid playlist URL: {0}")]
    InvalidPlaylistUrl(String),
}

impl VkError {
    pub fn invalid(context: &str, reason: impl Into<String>) -> Self {
        VkError::InvalidResponse {
            context: context.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: Option<Value>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
    captcha_sid: Option<Value>,
    captcha_img: Option<String>,
}

/// What a single VK call came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Success(Value),
    RateLimited,
    CaptchaRequired { sid: String, img: String },
    Failed { code: i64, message: String },
}

impl ApiOutcome {
    fn classify(method: &str, envelope: Envelope) -> Result<Self, VkError> {
        match (envelope.response, envelope.error) {
            (_, Some(error)) => Ok(match error.error_code {
                VK_ERROR_TOO_MANY_REQUESTS => ApiOutcome::RateLimited,
                VK_ERROR_CAPTCHA_NEEDED => {
                    let sid = match error.captcha_sid {
                        Some(Value::String(sid)) => sid,
                        Some(Value::Number(sid)) => sid.to_string(),
                        _ => return Err(VkError::invalid(method, "captcha without sid")),
                    };
                    let img = error
                        .captcha_img
                        .ok_or_else(|| VkError::invalid(method, "captcha without image"))?;
                    ApiOutcome::CaptchaRequired { sid, img }
                }
                code => ApiOutcome::Failed {
                    code,
                    message: error.error_msg,
                },
            }),
            (Some(response), None) => Ok(ApiOutcome::Success(response)),
            (None, None) => Err(VkError::invalid(method, "neither response nor error")),
        }
    }
}

/// Uniform random delay within `(lo, hi)` seconds.
pub fn jitter((lo, hi): (f64, f64)) -> Duration {
    if hi <= lo {
        return Duration::from_secs_f64(lo.max(0.0));
    }
    Duration::from_secs_f64(lo + (hi - lo) * rand::random::<f64>())
}

pub fn http_client(proxy: Option<&str>, timeout: Duration) -> Result<Client, VkError> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(format!("http://{proxy}"))?);
    }
    Ok(builder.build()?)
}

/// Token-scoped VK API client. Every method call goes through [`VkClient::call`],
/// which absorbs rate limits and a single captcha challenge.
#[derive(Clone)]
pub struct VkClient {
    client: Client,
    base_url: String,
    token: String,
    api_version: String,
    solver: Option<Arc<dyn CaptchaSolver>>,
    rate_limit_retries: u32,
    rate_limit_jitter: (f64, f64),
}

impl VkClient {
    pub fn new(config: &VkConfig, token: impl Into<String>) -> Result<Self, VkError> {
        let client = http_client(config.proxy.as_deref(), config.http_timeout)?;
        let solver = config.rucaptcha_key.as_ref().map(|key| {
            Arc::new(RuCaptcha::new(
                client.clone(),
                &config.rucaptcha_base_url,
                key.clone(),
            )) as Arc<dyn CaptchaSolver>
        });

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: token.into(),
            api_version: config.api_version.clone(),
            solver,
            rate_limit_retries: config.rate_limit_retries,
            rate_limit_jitter: RATE_LIMIT_JITTER,
        })
    }

    #[cfg(test)]
    pub fn with_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    #[cfg(test)]
    pub fn with_rate_limit_jitter(mut self, jitter: (f64, f64)) -> Self {
        self.rate_limit_jitter = jitter;
        self
    }

    async fn send(
        &self,
        method: &str,
        params: &[(&str, String)],
        captcha: Option<&(String, String)>,
    ) -> Result<ApiOutcome, VkError> {
        let mut form: Vec<(&str, &str)> = Vec::with_capacity(params.len() + 4);
        form.push(("access_token", self.token.as_str()));
        form.push(("v", self.api_version.as_str()));
        form.extend(params.iter().map(|(k, v)| (*k, v.as_str())));
        if let Some((sid, key)) = captcha {
            form.push(("captcha_sid", sid.as_str()));
            form.push(("captcha_key", key.as_str()));
        }

        let envelope: Envelope = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        ApiOutcome::classify(method, envelope)
    }

    pub async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, VkError> {
        let mut rate_limited = 0u32;
        let mut captcha: Option<(String, String)> = None;

        loop {
            match self.send(method, params, captcha.as_ref()).await? {
                ApiOutcome::Success(value) => return Ok(value),
                ApiOutcome::RateLimited => {
                    if rate_limited >= self.rate_limit_retries {
                        return Err(VkError::RateLimited(rate_limited));
                    }
                    rate_limited += 1;
                    tracing::debug!(method, attempt = rate_limited, "VK rate limit, retrying");
                    tokio::time::sleep(jitter(self.rate_limit_jitter)).await;
                }
                ApiOutcome::CaptchaRequired { sid, img } => {
                    if captcha.is_some() {
                        return Err(VkError::CaptchaUnsolved);
                    }
                    let solver = self.solver.as_ref().ok_or(VkError::NoCaptchaSolver)?;
                    tracing::warn!(method, "VK requested a captcha");
                    let key = solver.solve(&img).await?;
                    captcha = Some((sid, key));
                }
                ApiOutcome::Failed { code, message } => {
                    return Err(VkError::Api { code, message });
                }
            }
        }
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, VkError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| VkError::invalid(method, e.to_string()))
    }
}

/// Owner, id and optional access key of a playlist link such as
/// `https://vk.com/music/album/-2000123_456_abcdef`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRef {
    pub owner_id: i64,
    pub playlist_id: i64,
    pub access_key: Option<String>,
}

impl PlaylistRef {
    pub fn parse(playlist_url: &str) -> Result<Self, VkError> {
        let invalid = || VkError::InvalidPlaylistUrl(playlist_url.to_string());

        let url = Url::parse(playlist_url).map_err(|_| invalid())?;
        let last = url
            .path_segments()
            .and_then(|segments| segments.last())
            .ok_or_else(invalid)?;

        let mut parts = last.split('_');
        let owner_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let playlist_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let access_key = parts.next().filter(|k| !k.is_empty()).map(str::to_string);

        Ok(Self {
            owner_id,
            playlist_id,
            access_key,
        })
    }

    /// Link without the access key, the form used to key playlist stats.
    pub fn canonical_url(&self) -> String {
        playlist_url(self.owner_id, self.playlist_id)
    }

    /// `{owner}_{id}[_{key}]`, as used in `audio_playlist` attachments.
    pub fn attachment_id(&self) -> String {
        match &self.access_key {
            Some(key) => format!("{}_{}_{}", self.owner_id, self.playlist_id, key),
            None => format!("{}_{}", self.owner_id, self.playlist_id),
        }
    }
}

pub fn playlist_url(owner_id: i64, playlist_id: i64) -> String {
    format!("{VK_PLAYLIST_URL_PREFIX}{owner_id}_{playlist_id}")
}

/// Reads an integer that VK sometimes sends as a string.
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::constants::{RUCAPTCHA_BASE_URL, VK_API_VERSION};

    pub fn config(base_url: &str) -> VkConfig {
        VkConfig {
            base_url: base_url.to_string(),
            api_version: VK_API_VERSION.to_string(),
            proxy: None,
            rucaptcha_key: None,
            rucaptcha_base_url: RUCAPTCHA_BASE_URL.to_string(),
            rate_limit_retries: 3,
            http_timeout: Duration::from_secs(5),
        }
    }

    /// Client against a mock server, without rate-limit sleeps.
    pub fn client(base_url: &str) -> VkClient {
        VkClient::new(&config(base_url), "token")
            .unwrap()
            .with_rate_limit_jitter((0.0, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedSolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CaptchaSolver for FixedSolver {
        async fn solve(&self, _image_url: &str) -> Result<String, CaptchaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("solved".to_string())
        }
    }

    fn rate_limited() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "error": {"error_code": 6, "error_msg": "Too many requests per second"}
        }))
    }

    fn captcha() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "error": {
                "error_code": 14,
                "error_msg": "Captcha needed",
                "captcha_sid": 12345,
                "captcha_img": "https://api.vk.com/captcha.php?sid=12345"
            }
        }))
    }

    #[tokio::test]
    async fn retries_through_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users.get"))
            .respond_with(rate_limited())
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users.get"))
            .and(body_string_contains("access_token=token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": [{"id": 1}]})))
            .mount(&server)
            .await;

        let value = testing::client(&server.uri())
            .call("users.get", &[])
            .await
            .unwrap();
        assert_eq!(value, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn rate_limit_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users.get"))
            .respond_with(rate_limited())
            .expect(4)
            .mount(&server)
            .await;

        let result = testing::client(&server.uri()).call("users.get", &[]).await;
        assert!(matches!(result, Err(VkError::RateLimited(3))));
    }

    #[tokio::test]
    async fn solves_captcha_once_and_resends_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wall.postAdsStealth"))
            .and(body_string_contains("captcha_key=solved"))
            .and(body_string_contains("message=hello"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"response": {"post_id": 7}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/wall.postAdsStealth"))
            .respond_with(captcha())
            .mount(&server)
            .await;

        let solver = Arc::new(FixedSolver {
            calls: AtomicUsize::new(0),
        });
        let client = testing::client(&server.uri()).with_solver(solver.clone());
        let value = client
            .call("wall.postAdsStealth", &[("message", "hello".to_string())])
            .await
            .unwrap();

        assert_eq!(value["post_id"], 7);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_captcha_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groups.create"))
            .respond_with(captcha())
            .expect(2)
            .mount(&server)
            .await;

        let solver = Arc::new(FixedSolver {
            calls: AtomicUsize::new(0),
        });
        let client = testing::client(&server.uri()).with_solver(solver.clone());
        let result = client.call("groups.create", &[]).await;

        assert!(matches!(result, Err(VkError::CaptchaUnsolved)));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn captcha_without_solver_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groups.create"))
            .respond_with(captcha())
            .expect(1)
            .mount(&server)
            .await;

        let result = testing::client(&server.uri()).call("groups.create", &[]).await;
        assert!(matches!(result, Err(VkError::NoCaptchaSolver)));
    }

    #[tokio::test]
    async fn other_errors_surface_code_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ads.getAds"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": {"error_code": 100, "error_msg": "One of the parameters specified was missing or invalid"}
            })))
            .mount(&server)
            .await;

        let result = testing::client(&server.uri()).call("ads.getAds", &[]).await;
        match result {
            Err(VkError::Api { code, message }) => {
                assert_eq!(code, 100);
                assert!(message.starts_with("One of the parameters"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn parses_playlist_urls() {
        let with_key = PlaylistRef::parse("https://vk.com/music/album/-2000123_456_abcdef").unwrap();
        assert_eq!(with_key.owner_id, -2000123);
        assert_eq!(with_key.playlist_id, 456);
        assert_eq!(with_key.access_key.as_deref(), Some("abcdef"));
        assert_eq!(with_key.canonical_url(), "https://vk.com/music/album/-2000123_456");
        assert_eq!(with_key.attachment_id(), "-2000123_456_abcdef");

        let plain = PlaylistRef::parse("https://vk.com/music/album/-20_7").unwrap();
        assert_eq!(plain.access_key, None);

        assert!(PlaylistRef::parse("https://vk.com/music/album/").is_err());
        assert!(PlaylistRef::parse("not a url").is_err());
    }

    #[test]
    fn lenient_numbers_accept_strings() {
        assert_eq!(lenient_f64(&json!("12.50")), Some(12.5));
        assert_eq!(lenient_f64(&json!(3)), Some(3.0));
        assert_eq!(lenient_i64(&json!("42")), Some(42));
        assert_eq!(lenient_i64(&json!(null)), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..50 {
            let d = jitter((0.4, 0.6)).as_secs_f64();
            assert!((0.4..=0.6).contains(&d));
        }
        assert_eq!(jitter((0.0, 0.0)), Duration::ZERO);
    }
}
