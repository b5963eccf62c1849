use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, FromRef};
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::net::TcpListener;

use crate::api::controllers;
use crate::api::state::*;

pub struct ApiEndpointBuilder {
    healthcheck_route: Option<String>,
}

impl Default for ApiEndpointBuilder {
    fn default() -> Self {
        Self {
            healthcheck_route: Some("/".to_owned()),
        }
    }
}

impl ApiEndpointBuilder {
    pub async fn bind(self, state: ApiState) -> Result<ApiEndpoint> {
        let listener = state.bind_socket().await?;
        Ok(ApiEndpoint {
            listener,
            router: self.build(state),
        })
    }

    /// Routes with middleware and state applied.
    pub fn build(self, state: ApiState) -> axum::Router {
        use tower::ServiceBuilder;
        use tower_http::cors::CorsLayer;
        use tower_http::timeout::TimeoutLayer;

        let mut router = axum::Router::new();
        if let Some(route) = self.healthcheck_route {
            router = router.route(&route, get(health_check));
        }
        let router = router
            .nest("/auth", auth_router())
            .nest("/user", user_router());

        // The per-request deadline fires first and answers with a JSON error.
        let timeout = state.config().request_timeout + REQUEST_TIMEOUT_GRACE;

        let service = ServiceBuilder::new()
            .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
            .layer(CorsLayer::permissive())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                timeout,
            ));

        #[cfg(feature = "compression")]
        let service = service.layer(tower_http::compression::CompressionLayer::new().gzip(true));

        router.layer(service).with_state(state)
    }
}

pub struct ApiEndpoint {
    listener: TcpListener,
    router: axum::Router,
}

impl ApiEndpoint {
    pub fn builder() -> ApiEndpointBuilder {
        ApiEndpointBuilder::default()
    }

    /// Serves until `shutdown` resolves, then waits for in-flight requests.
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

fn auth_router<S>() -> axum::Router<S>
where
    ApiState: FromRef<S>,
    S: Clone + Send + Sync + 'static,
{
    axum::Router::new()
        .route("/register", post(controllers::auth::register))
        .route("/login", post(controllers::auth::login))
        .route("/refresh", post(controllers::auth::refresh))
        .route("/logout", post(controllers::auth::logout))
        .route("/google/login", get(controllers::auth::google_login))
        .route("/google/callback", get(controllers::auth::google_callback))
}

fn user_router<S>() -> axum::Router<S>
where
    ApiState: FromRef<S>,
    S: Clone + Send + Sync + 'static,
{
    axum::Router::new()
        .route("/me", get(controllers::user::me))
        .route("/admin/ping", get(controllers::user::admin_ping))
}

async fn health_check() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

const MAX_REQUEST_SIZE: usize = 2 << 17; // 256kb
const REQUEST_TIMEOUT_GRACE: Duration = Duration::from_secs(1);
