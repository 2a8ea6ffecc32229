use anyhow::Context;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;
use warp::Filter;
use warp::http::StatusCode;

use crate::config::ProbeConfig;
use crate::metrics::observe_outcome;
use crate::prober::{CancelSignal, Connect, Prober, Resolve};

const DEFAULT_DOMAIN: &str = "google.com";

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelnetQuery {
    #[serde(default = "default_query_type")]
    pub query_type: String,
    #[serde(default = "default_port")]
    pub port: i64,
}

fn default_query_type() -> String {
    "A".to_string()
}

fn default_port() -> i64 {
    443
}

/// Everything a request handler needs. Cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    resolver: Arc<dyn Resolve>,
    connector: Arc<dyn Connect>,
    config: Arc<RwLock<ProbeConfig>>,
    cancel: CancelSignal,
}

impl AppState {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        connector: Arc<dyn Connect>,
        config: Arc<RwLock<ProbeConfig>>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            resolver,
            connector,
            config,
            cancel,
        }
    }
}

/// Binds before anything is spawned so a taken port fails startup.
pub async fn bind_listener(addr: SocketAddr, what: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {} on {}", what, addr))
}

pub async fn serve(listener: TcpListener, state: AppState) {
    warp::serve(routes(state)).incoming(listener).run().await;
}

/// GET /api/telnet/{domain}?queryType=A&port=443, domain optional.
pub fn routes(state: AppState) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());
    let with_domain = warp::path!("api" / "telnet" / String);
    let default_domain = warp::path!("api" / "telnet").map(|| DEFAULT_DOMAIN.to_string());

    warp::get()
        .and(with_domain.or(default_domain).unify())
        .and(warp::query::<TelnetQuery>())
        .and(with_state)
        .and_then(handle_telnet)
}

async fn handle_telnet(domain: String, query: TelnetQuery, state: AppState) -> Result<impl warp::Reply, Infallible> {
    let (status, body) = telnet(&domain, &query, &state).await;
    Ok(warp::reply::with_status(body, status))
}

pub async fn telnet(domain: &str, query: &TelnetQuery, state: &AppState) -> (StatusCode, String) {
    // read per request so reloaded attempt budgets apply to the next probe
    let settings = state.config.read().await.probe_settings();
    let prober = Prober::new(state.resolver.clone(), state.connector.clone(), settings);

    let start = Instant::now();
    match prober.check(domain, &query.query_type, query.port, &state.cancel).await {
        Ok(outcome) => {
            observe_outcome(&outcome, start.elapsed().as_secs_f64() * 1000.0);
            (StatusCode::OK, outcome.to_string())
        }
        Err(cancelled) => (StatusCode::SERVICE_UNAVAILABLE, cancelled.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::CancelHandle;
    use crate::prober::tests::{FakeConnector, FakeResolver};
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn state(
        resolver: Arc<FakeResolver>,
        connector: Arc<FakeConnector>,
        config: ProbeConfig,
        cancel: CancelSignal,
    ) -> AppState {
        AppState::new(resolver, connector, Arc::new(RwLock::new(config)), cancel)
    }

    #[tokio::test]
    async fn busy_port_is_a_startup_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind_listener(addr, "probe api").await.unwrap_err();
        assert!(err.to_string().contains("probe api"), "{}", err);
        assert!(bind_listener("127.0.0.1:0".parse().unwrap(), "probe api").await.is_ok());
    }

    #[test]
    fn query_defaults_match_the_api() {
        let query: TelnetQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(
            query,
            TelnetQuery {
                query_type: "A".into(),
                port: 443
            }
        );

        let query: TelnetQuery = serde_json::from_str(r#"{"queryType": "MX", "port": 25}"#).unwrap();
        assert_eq!(query.query_type, "MX");
        assert_eq!(query.port, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_probe_is_ok() {
        let state = state(
            FakeResolver::with_a(Ipv4Addr::new(93, 184, 216, 34)),
            FakeConnector::ready_after(0),
            ProbeConfig::default(),
            CancelSignal::never(),
        );
        let query = TelnetQuery {
            query_type: "A".into(),
            port: 443,
        };

        let (status, body) = telnet("example.com", &query, &state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "Connecting to example.com...opened a connection to the host on port 443: connected"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn configured_budget_drives_the_timeout() {
        let connector = FakeConnector::never_ready();
        let config = ProbeConfig {
            max_attempts: 3,
            poll_interval_ms: 2000,
            ..ProbeConfig::default()
        };
        let state = state(
            FakeResolver::with_a(Ipv4Addr::new(93, 184, 216, 34)),
            connector.clone(),
            config,
            CancelSignal::never(),
        );
        let query = TelnetQuery {
            query_type: "A".into(),
            port: 9,
        };

        let (status, body) = telnet("example.com", &query, &state).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("port 9: timed out after 6 seconds"), "{}", body);
        assert_eq!(connector.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_hide_the_reason() {
        let state = state(
            FakeResolver::answering(Err("SERVFAIL".into())),
            FakeConnector::ready_after(0),
            ProbeConfig::default(),
            CancelSignal::never(),
        );
        let query = TelnetQuery {
            query_type: "A".into(),
            port: 443,
        };

        let (status, body) = telnet("broken.example", &query, &state).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("connection failed"));
        assert!(!body.contains("SERVFAIL"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_probes() {
        let handle = CancelHandle::new();
        let state = state(
            FakeResolver::with_a(Ipv4Addr::new(93, 184, 216, 34)),
            FakeConnector::never_ready(),
            ProbeConfig::default(),
            handle.signal(),
        );

        let task = tokio::spawn(async move {
            let query = TelnetQuery {
                query_type: "A".into(),
                port: 443,
            };
            telnet("example.com", &query, &state).await
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.cancel();

        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "probe cancelled");
    }
}
