use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::constants::{CAPTCHA_MAX_POLLS, CAPTCHA_POLL_SECS};

const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Error, Debug)]
pub enum CaptchaError {
    #[error("Captcha request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Captcha service rejected the task: {0}")]
    Rejected(String),
    #[error("Captcha not solved after {0} polls")]
    Timeout(u32),
}

/// Resolves an image challenge into the text the platform expects back.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image_url: &str) -> Result<String, CaptchaError>;
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    status: i64,
    request: String,
}

/// Client of the RuCaptcha two-phase API: submit the image, then poll for
/// the answer.
pub struct RuCaptcha {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl RuCaptcha {
    pub fn new(client: Client, base_url: &str, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_secs(CAPTCHA_POLL_SECS),
            max_polls: CAPTCHA_MAX_POLLS,
        }
    }

    #[cfg(test)]
    pub fn with_polling(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls;
        self
    }

    async fn submit(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let body = base64::engine::general_purpose::STANDARD.encode(image);
        let reply: ServiceReply = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", "base64"),
                ("body", body.as_str()),
                ("json", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.status != 1 {
            return Err(CaptchaError::Rejected(reply.request));
        }
        Ok(reply.request)
    }

    async fn poll(&self, task_id: &str) -> Result<String, CaptchaError> {
        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let reply: ServiceReply = self
                .client
                .get(format!("{}/res.php", self.base_url))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id),
                    ("json", "1"),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match reply.status {
                1 => return Ok(reply.request),
                _ if reply.request == NOT_READY => continue,
                _ => return Err(CaptchaError::Rejected(reply.request)),
            }
        }
        Err(CaptchaError::Timeout(self.max_polls))
    }
}

#[async_trait]
impl CaptchaSolver for RuCaptcha {
    async fn solve(&self, image_url: &str) -> Result<String, CaptchaError> {
        let image = self
            .client
            .get(image_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let task_id = self.submit(&image).await?;
        tracing::info!(task_id = %task_id, "captcha submitted");
        let answer = self.poll(&task_id).await?;
        tracing::info!(task_id = %task_id, "captcha solved");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_image(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/captcha.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(server)
            .await;
    }

    fn solver(server: &MockServer, max_polls: u32) -> RuCaptcha {
        RuCaptcha::new(Client::new(), &server.uri(), "key".to_string())
            .with_polling(Duration::ZERO, max_polls)
    }

    #[tokio::test]
    async fn solves_after_not_ready() {
        let server = MockServer::start().await;
        mount_image(&server).await;

        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "77"})),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("id", "77"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("id", "77"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "x7k2"})),
            )
            .mount(&server)
            .await;

        let answer = solver(&server, 5)
            .solve(&format!("{}/captcha.jpg", server.uri()))
            .await
            .unwrap();
        assert_eq!(answer, "x7k2");
    }

    #[tokio::test]
    async fn rejected_submission_is_an_error() {
        let server = MockServer::start().await;
        mount_image(&server).await;

        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "ERROR_ZERO_BALANCE"})),
            )
            .mount(&server)
            .await;

        let result = solver(&server, 5)
            .solve(&format!("{}/captcha.jpg", server.uri()))
            .await;
        assert!(matches!(result, Err(CaptchaError::Rejected(ref msg)) if msg == "ERROR_ZERO_BALANCE"));
    }

    #[tokio::test]
    async fn gives_up_after_max_polls() {
        let server = MockServer::start().await;
        mount_image(&server).await;

        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "5"})),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/res.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let result = solver(&server, 3)
            .solve(&format!("{}/captcha.jpg", server.uri()))
            .await;
        assert!(matches!(result, Err(CaptchaError::Timeout(3))));
    }
}
