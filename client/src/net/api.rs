//! REST fallback for broadcasts and demo triggers.
//!
//! Natively: `reqwest`. In the browser: `gloo-net`.
//!
//! ERROR HANDLING
//! ==============
//! Every call returns `true` only for a 2xx response. Network failures and
//! non-success statuses are logged and reported as `false`; nothing here
//! depends on or changes the broker session.

#![allow(clippy::unused_async)]

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use serde::Serialize;
use url::Url;

use super::types::{LiveDataRequest, NotificationRequest};

const NOTIFICATION_PATH: [&str; 3] = ["api", "broadcast", "notification"];
const LIVE_DATA_PATH: [&str; 3] = ["api", "broadcast", "data"];
const DEMO_CHAT_PATH: [&str; 3] = ["api", "demo", "chat"];
const DEMO_NOTIFICATION_PATH: [&str; 3] = ["api", "demo", "notification"];

/// HTTP client for the broker's REST endpoints.
#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: String,
    #[cfg(not(target_arch = "wasm32"))]
    http: reqwest::Client,
}

impl RestClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            #[cfg(not(target_arch = "wasm32"))]
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/broadcast/notification`
    pub async fn send_notification(&self, notification: &NotificationRequest) -> bool {
        self.post_json(&NOTIFICATION_PATH, notification).await
    }

    /// `POST /api/broadcast/data`
    pub async fn send_live_data(&self, data: &LiveDataRequest) -> bool {
        self.post_json(&LIVE_DATA_PATH, data).await
    }

    /// `GET /api/demo/chat/{message}`
    pub async fn test_demo(&self, message: &str) -> bool {
        self.get(&DEMO_CHAT_PATH, Some(message)).await
    }

    /// `GET /api/demo/notification/{message}`
    pub async fn test_demo_notification(&self, message: &str) -> bool {
        self.get(&DEMO_NOTIFICATION_PATH, Some(message)).await
    }

    fn endpoint(&self, path: &[&str], tail: Option<&str>) -> Option<Url> {
        match endpoint_url(&self.base_url, path, tail) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(base_url = %self.base_url, %err, "invalid api base url");
                None
            }
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    async fn post_json<T: Serialize + ?Sized>(&self, path: &[&str], body: &T) -> bool {
        let Some(url) = self.endpoint(path, None) else {
            return false;
        };
        let result = self.http.post(url.clone()).json(body).send().await;
        report(&url, result.map(|resp| resp.status().as_u16()).map_err(|err| err.to_string()))
    }

    #[cfg(not(target_arch = "wasm32"))]
    async fn get(&self, path: &[&str], tail: Option<&str>) -> bool {
        let Some(url) = self.endpoint(path, tail) else {
            return false;
        };
        let result = self.http.get(url.clone()).send().await;
        report(&url, result.map(|resp| resp.status().as_u16()).map_err(|err| err.to_string()))
    }

    #[cfg(target_arch = "wasm32")]
    async fn post_json<T: Serialize + ?Sized>(&self, path: &[&str], body: &T) -> bool {
        let Some(url) = self.endpoint(path, None) else {
            return false;
        };
        let request = match gloo_net::http::Request::post(url.as_str()).json(body) {
            Ok(request) => request,
            Err(err) => return report(&url, Err(err.to_string())),
        };
        let result = request.send().await;
        report(&url, result.map(|resp| resp.status()).map_err(|err| err.to_string()))
    }

    #[cfg(target_arch = "wasm32")]
    async fn get(&self, path: &[&str], tail: Option<&str>) -> bool {
        let Some(url) = self.endpoint(path, tail) else {
            return false;
        };
        let result = gloo_net::http::Request::get(url.as_str()).send().await;
        report(&url, result.map(|resp| resp.status()).map_err(|err| err.to_string()))
    }
}

/// Join `path` (and an optional percent-encoded `tail` segment) onto `base`.
fn endpoint_url(base: &str, path: &[&str], tail: Option<&str>) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
        segments.pop_if_empty();
        segments.extend(path);
        if let Some(tail) = tail {
            segments.push(tail);
        }
    }
    Ok(url)
}

fn report(url: &Url, outcome: Result<u16, String>) -> bool {
    match outcome {
        Ok(status) if (200..300).contains(&status) => true,
        Ok(status) => {
            tracing::warn!(%url, status, "api request rejected");
            false
        }
        Err(err) => {
            tracing::warn!(%url, %err, "api request failed");
            false
        }
    }
}
