use std::{
    sync::mpsc::{channel, Receiver, Sender},
    thread,
};

use anyhow::{anyhow, Context, Error};
use log::{debug, info, warn};
use reqwest::{blocking::Client, StatusCode};
use url::Url;

use hawser_api::config::Config;

const AUTH_REQUESTS: &str = "api/devices/v1/authentication/auth_requests";

/// Requests understood by the auth manager task.
enum AuthRequest {
    /// Hand back the cached token, if any.
    Get { reply: Sender<Option<String>> },
    /// Authenticate against the server and cache the fresh token.
    Fetch { reply: Sender<Result<String, Error>> },
    /// Register a listener notified with every refreshed token.
    Subscribe { listener: Sender<String> },
}

/// Client-side handle to the auth manager task. Cheap to clone; every call
/// is a typed request with a one-shot reply channel.
#[derive(Clone)]
pub struct AuthHandle {
    tx: Sender<AuthRequest>,
}

impl AuthHandle {
    pub fn get_token(&self) -> Result<Option<String>, Error> {
        let (reply, rx) = channel();
        self.tx
            .send(AuthRequest::Get { reply })
            .map_err(|_| anyhow!("auth manager is gone"))?;
        rx.recv().map_err(|_| anyhow!("auth manager is gone"))
    }

    pub fn fetch_token(&self) -> Result<String, Error> {
        let (reply, rx) = channel();
        self.tx
            .send(AuthRequest::Fetch { reply })
            .map_err(|_| anyhow!("auth manager is gone"))?;
        rx.recv().map_err(|_| anyhow!("auth manager is gone"))?
    }

    /// Tokens minted after this call are broadcast to the returned channel.
    pub fn subscribe(&self) -> Result<Receiver<String>, Error> {
        let (listener, rx) = channel();
        self.tx
            .send(AuthRequest::Subscribe { listener })
            .map_err(|_| anyhow!("auth manager is gone"))?;
        Ok(rx)
    }
}

/// Owns the token cache and talks to the authentication endpoint. Runs on
/// its own thread; all interaction goes through [`AuthHandle`].
pub struct AuthManager {
    rx: Receiver<AuthRequest>,
    http: Client,
    auth_url: Url,
    identity: serde_json::Value,
    tenant_token: Option<String>,
    token: Option<String>,
    listeners: Vec<Sender<String>>,
}

impl AuthManager {
    /// Spawns the manager task and returns the handle to reach it.
    pub fn spawn(config: &Config, device_type: &str) -> Result<AuthHandle, Error> {
        let manager = Self::new(config, device_type)?;
        let (tx, rx) = channel();
        let mut manager = AuthManager { rx, ..manager };
        thread::Builder::new()
            .name("auth-manager".into())
            .spawn(move || manager.run())
            .context("Failed to spawn auth manager")?;
        Ok(AuthHandle { tx })
    }

    fn new(config: &Config, device_type: &str) -> Result<Self, Error> {
        let (_, rx) = channel();
        Ok(Self {
            rx,
            http: Client::builder()
                .timeout(config.http_timeout())
                .build()
                .context("Failed to construct auth HTTP client")?,
            auth_url: config
                .server_url
                .join(AUTH_REQUESTS)
                .context("Failed to build authentication URL")?,
            identity: serde_json::json!({ "device_type": device_type }),
            tenant_token: config.tenant_token.clone(),
            token: None,
            listeners: Vec::new(),
        })
    }

    fn run(&mut self) {
        debug!("Auth manager running");
        while let Ok(request) = self.rx.recv() {
            match request {
                AuthRequest::Get { reply } => {
                    let _ = reply.send(self.token.clone());
                }
                AuthRequest::Fetch { reply } => {
                    let result = self.fetch();
                    if let Ok(token) = &result {
                        self.token = Some(token.clone());
                        self.broadcast(token);
                    }
                    let _ = reply.send(result);
                }
                AuthRequest::Subscribe { listener } => {
                    self.listeners.push(listener);
                }
            }
        }
        debug!("Auth manager stopping");
    }

    fn broadcast(&mut self, token: &str) {
        // Dead listeners drop out on their first failed delivery.
        self.listeners
            .retain(|listener| listener.send(token.to_string()).is_ok());
    }

    fn fetch(&self) -> Result<String, Error> {
        let body = serde_json::json!({
            "id_data": self.identity.to_string(),
            "tenant_token": self.tenant_token,
        });

        let response = self
            .http
            .post(self.auth_url.clone())
            .json(&body)
            .send()
            .context("Failed to send authentication request")?;

        match response.status() {
            status if status.is_success() => {
                let token = response
                    .text()
                    .context("Failed to read authentication response")?;
                if token.trim().is_empty() {
                    anyhow::bail!("Server returned an empty authentication token");
                }
                info!("Authorization token obtained");
                Ok(token.trim().to_string())
            }
            StatusCode::UNAUTHORIZED => {
                warn!("Authentication rejected by the server");
                anyhow::bail!("device is not accepted by the server")
            }
            status => anyhow::bail!("authentication failed with status {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn config_for(server: &mockito::ServerGuard) -> Config {
        serde_json::from_str(
            &serde_json::json!({
                "ServerUrl": server.url(),
                "TenantToken": "tenant-1",
                "HttpTimeoutSeconds": 5,
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_fetch_caches_and_broadcasts() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/devices/v1/authentication/auth_requests")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"tenant_token": "tenant-1"}"#.into(),
            ))
            .with_status(200)
            .with_body("jwt-token-1\n")
            .expect(1)
            .create();

        let handle = AuthManager::spawn(&config_for(&server), "test-device").unwrap();

        assert_eq!(handle.get_token().unwrap(), None);

        let refreshed = handle.subscribe().unwrap();
        let token = handle.fetch_token().unwrap();
        assert_eq!(token, "jwt-token-1");

        // The cached token is served without another round trip.
        assert_eq!(handle.get_token().unwrap().as_deref(), Some("jwt-token-1"));
        assert_eq!(
            refreshed.recv_timeout(Duration::from_secs(5)).unwrap(),
            "jwt-token-1"
        );
        mock.assert();
    }

    #[test]
    fn test_rejected_device() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/devices/v1/authentication/auth_requests")
            .with_status(401)
            .create();

        let handle = AuthManager::spawn(&config_for(&server), "test-device").unwrap();
        handle.fetch_token().unwrap_err();
        assert_eq!(handle.get_token().unwrap(), None);
    }
}
