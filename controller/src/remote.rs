use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{FireplaceError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
    pub bearer: Option<String>,
    pub json: Option<serde_json::Value>,
}

impl RemoteRequest {
    pub fn get(path: &'static str) -> Self {
        Self {
            method: Method::Get,
            path,
            query: Vec::new(),
            bearer: None,
            json: None,
        }
    }

    pub fn post(path: &'static str) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(path)
        }
    }

    pub fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    #[cfg(test)]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into `FireplaceError::Remote`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FireplaceError::Remote {
                status: self.status,
                body: self.body,
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Raw HTTP seam in front of the vendor API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("fireplace-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteApi for HttpTransport {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RemoteResponse { status, body })
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
        time::Duration,
    };

    use super::*;

    /// Replays canned responses per path and records every request it sees.
    #[derive(Default)]
    pub struct ScriptedTransport {
        queued: Mutex<HashMap<&'static str, VecDeque<RemoteResponse>>>,
        sticky: Mutex<HashMap<&'static str, RemoteResponse>>,
        requests: Mutex<Vec<RemoteRequest>>,
        latency: Mutex<HashMap<&'static str, Duration>>,
        panicking: Mutex<Vec<&'static str>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answers the next request to `path` once.
        pub fn push(&self, path: &'static str, status: u16, body: impl Into<String>) {
            self.queued
                .lock()
                .unwrap()
                .entry(path)
                .or_default()
                .push_back(RemoteResponse {
                    status,
                    body: body.into(),
                });
        }

        /// Answers every request to `path` that has no queued response.
        pub fn always(&self, path: &'static str, status: u16, body: impl Into<String>) {
            self.sticky.lock().unwrap().insert(
                path,
                RemoteResponse {
                    status,
                    body: body.into(),
                },
            );
        }

        /// Holds every response to `path` back for `latency`.
        pub fn slow(&self, path: &'static str, latency: Duration) {
            self.latency.lock().unwrap().insert(path, latency);
        }

        /// Makes every request to `path` panic in the caller's task.
        pub fn panic_on(&self, path: &'static str) {
            self.panicking.lock().unwrap().push(path);
        }

        pub fn requests(&self) -> Vec<RemoteRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn requests_to(&self, path: &str) -> Vec<RemoteRequest> {
            self.requests()
                .into_iter()
                .filter(|request| request.path == path)
                .collect()
        }

        pub fn count(&self, path: &str) -> usize {
            self.requests_to(path).len()
        }
    }

    #[async_trait]
    impl RemoteApi for ScriptedTransport {
        async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
            let path = request.path;
            self.requests.lock().unwrap().push(request);

            let latency = self.latency.lock().unwrap().get(path).copied();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let panicking = self.panicking.lock().unwrap().contains(&path);
            if panicking {
                panic!("scripted transport fault on {path}");
            }

            let queued = self
                .queued
                .lock()
                .unwrap()
                .get_mut(path)
                .and_then(VecDeque::pop_front);
            if let Some(response) = queued {
                return Ok(response);
            }

            Ok(self
                .sticky
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or(RemoteResponse {
                    status: 404,
                    body: r#"{"status":{"code":404,"message":"unscripted"}}"#.to_string(),
                }))
        }
    }
}
