use std::future::IntoFuture as _;

use kubeblocks_operator::{
    operator::{Operator, State},
    settings::Settings,
    telemetry,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    // Grab needed env
    let settings = Settings::from_env()?;

    // Initialize Kubernetes controller state
    let state = State::default();
    let operator = Operator::new(state.clone());

    // Start web server
    let listener = TcpListener::bind(settings.http_addr).await?;
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));

    // Run both the http server and the controllers, throwing a panic if either finish early
    tokio::select! {
        c = operator.run(settings) => {
            panic!("controllers exited early: {:?}", c.err())
        },
        s = server.into_future() => {
            panic!("server exited early: {:?}", s.err())
        }
    };
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use kubeblocks_operator::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metrics, &mut buffer) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes());
        }

        (StatusCode::OK, buffer)
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
