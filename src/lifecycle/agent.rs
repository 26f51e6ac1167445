//! Transport to the agent sidecar: a direct http client when the operator runs inside the
//! cluster, a port-forwarding client otherwise.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, warn};

use super::proto::{ActionRequest, ActionResponse};
use crate::settings::PortForwardMode;

pub const ACTION_PATH: &str = "/v1.0/action";

/// Extra time granted on top of the action's own timeout before the http call is abandoned
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Failure to get an action to the agent or its answer back
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("pod {0} has no namespace")]
    MissingNamespace(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("port-forward failed: {0}")]
    PortForward(#[from] kube::Error),

    #[error("port {port} of pod {pod} is not forwarded")]
    PortNotForwarded { pod: String, port: u16 },

    #[error("forwarded connection failed: {0}")]
    Connection(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("failed to encode action request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed action response: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unexpected http status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run an action; errors are transport failures, remote errors come back in the response
    async fn action(&self, req: &ActionRequest) -> Result<ActionResponse, AgentError>;
}

#[async_trait]
pub trait AgentClientFactory: Send + Sync {
    /// A client talking to the agent of `pod`, listening on `host:port`
    async fn client(
        &self,
        pod: &Pod,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn AgentClient>, AgentError>;
}

/// Picks the transport the way the operator is deployed
pub struct DefaultAgentClientFactory {
    kube: Client,
    http: reqwest::Client,
    port_forward: bool,
}

impl DefaultAgentClientFactory {
    pub fn new(kube: Client, mode: PortForwardMode) -> Self {
        let port_forward = match mode {
            PortForwardMode::Always => true,
            PortForwardMode::Never => false,
            // pod ips are not routable from outside the cluster
            PortForwardMode::Auto => kube::Config::incluster().is_err(),
        };
        debug!(port_forward, "agent transport selected");
        Self {
            kube,
            http: reqwest::Client::new(),
            port_forward,
        }
    }
}

#[async_trait]
impl AgentClientFactory for DefaultAgentClientFactory {
    async fn client(
        &self,
        pod: &Pod,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn AgentClient>, AgentError> {
        if self.port_forward {
            let namespace = pod
                .namespace()
                .ok_or_else(|| AgentError::MissingNamespace(pod.name_any()))?;
            return Ok(Box::new(PortForwardClient {
                pods: Api::namespaced(self.kube.clone(), &namespace),
                pod: pod.name_any(),
                port,
            }));
        }
        Ok(Box::new(HttpClient {
            http: self.http.clone(),
            url: format!("http://{host}:{port}{ACTION_PATH}"),
        }))
    }
}

fn decode(status: StatusCode, body: &[u8]) -> Result<ActionResponse, AgentError> {
    match serde_json::from_slice::<ActionResponse>(body) {
        Ok(rsp) if status.is_success() || !rsp.error.is_empty() => Ok(rsp),
        Ok(_) => Err(AgentError::Status {
            status,
            body: String::new(),
        }),
        Err(e) if status.is_success() => Err(AgentError::Malformed(e)),
        Err(_) => Err(AgentError::Status {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }),
    }
}

fn call_timeout(req: &ActionRequest) -> Option<Duration> {
    req.timeout_seconds
        .filter(|t| *t > 0)
        .map(|t| Duration::from_secs(t as u64) + TIMEOUT_GRACE)
}

struct HttpClient {
    http: reqwest::Client,
    url: String,
}

#[async_trait]
impl AgentClient for HttpClient {
    async fn action(&self, req: &ActionRequest) -> Result<ActionResponse, AgentError> {
        let mut request = self.http.post(&self.url).json(req);
        if let Some(timeout) = call_timeout(req) {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        decode(status, &body)
    }
}

struct PortForwardClient {
    pods: Api<Pod>,
    pod: String,
    port: u16,
}

#[async_trait]
impl AgentClient for PortForwardClient {
    async fn action(&self, req: &ActionRequest) -> Result<ActionResponse, AgentError> {
        let mut forwarder = self.pods.portforward(&self.pod, &[self.port]).await?;
        let stream = forwarder
            .take_stream(self.port)
            .ok_or_else(|| AgentError::PortNotForwarded {
                pod: self.pod.clone(),
                port: self.port,
            })?;

        let (mut sender, connection) = hyper::client::conn::handshake(stream).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("port-forward connection error: {e}");
            }
        });

        let body = serde_json::to_vec(req).map_err(AgentError::Encode)?;
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(ACTION_PATH)
            .header(http::header::HOST, "127.0.0.1")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(hyper::Body::from(body))?;

        let exchange = async {
            let response = sender.send_request(request).await?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            decode(status, &body)
        };
        let result = match call_timeout(req) {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| Err(AgentError::Timeout(timeout))),
            None => exchange.await,
        };

        driver.abort();
        forwarder.abort();
        result
    }
}
