//! The connectivity probe: resolve, validate, connect, poll, classify.
//!
//! A probe owns exactly one DNS query and one socket. Every failure except
//! cancellation is folded into [`ProbeOutcome::Failed`], so callers always get
//! a message to show; cancellation surfaces separately as [`Cancelled`].

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use trust_dns_resolver::proto::rr::RecordType;

use crate::util::{first_ipv4, parse_record_type};

pub mod cancel;
pub mod dns;
pub mod tcp_connect;

pub use cancel::{CancelHandle, CancelSignal};
pub use dns::{Resolve, TrustDnsResolver};
pub use tcp_connect::{Connect, NonBlockingConnector, PendingConnection};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unrecognized DNS query type: {0}")]
    InvalidQueryType(String),

    #[error("port {0} is outside 1-65535")]
    InvalidPort(i64),

    #[error("DNS query for {domain} failed: {reason}")]
    ResolutionFailed { domain: String, reason: String },

    #[error("{domain} did not resolve to a usable IPv4 address")]
    InvalidResolvedAddress { domain: String },

    #[error("tcp connect to {addr} failed: {source}")]
    ConnectionError {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("probe cancelled")]
    Cancelled,
}

/// The probe was cancelled at one of its suspension points.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("probe cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub domain: String,
    pub record_type: RecordType,
    pub port: u16,
}

impl ProbeRequest {
    /// Validates caller input. Nothing touches the network before this succeeds.
    pub fn parse(domain: &str, query_type: &str, port: i64) -> Result<Self, ProbeError> {
        let record_type = parse_record_type(query_type)?;
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ProbeError::InvalidPort(port))?;
        Ok(Self {
            domain: domain.to_string(),
            record_type,
            port,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProbeSettings {
    /// Worst-case time spent polling, excluding DNS and connect initiation.
    pub fn bound(&self) -> Duration {
        self.poll_interval * self.max_attempts
    }
}

/// `port` is the port as the caller asked for it, which may be out of range on `Failed`.
#[derive(Debug)]
pub enum ProbeOutcome {
    Connected {
        domain: String,
        port: i64,
    },
    TimedOut {
        domain: String,
        port: i64,
        attempts: u32,
        bound: Duration,
    },
    Failed {
        domain: String,
        port: i64,
        reason: ProbeError,
    },
}

impl ProbeOutcome {
    /// Metric label for the outcome category.
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Connected { .. } => "connected",
            ProbeOutcome::TimedOut { .. } => "timed_out",
            ProbeOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Connected { domain, port } => write!(
                f,
                "Connecting to {}...opened a connection to the host on port {}: connected",
                domain, port
            ),
            ProbeOutcome::TimedOut { domain, port, bound, .. } => write!(
                f,
                "Connecting to {}...could not open a connection to the host on port {}: timed out after {} seconds",
                domain,
                port,
                // f64 Display prints whole seconds without a fraction
                bound.as_secs_f64()
            ),
            ProbeOutcome::Failed { domain, port, .. } => write!(
                f,
                "Connecting to {}...could not open a connection to the host on port {}: connection failed",
                domain, port
            ),
        }
    }
}

pub struct Prober {
    resolver: Arc<dyn Resolve>,
    connector: Arc<dyn Connect>,
    settings: ProbeSettings,
}

impl Prober {
    pub fn new(resolver: Arc<dyn Resolve>, connector: Arc<dyn Connect>, settings: ProbeSettings) -> Self {
        Self {
            resolver,
            connector,
            settings,
        }
    }

    /// Runs one probe. Never fails except by cancellation.
    pub async fn check(
        &self,
        domain: &str,
        query_type: &str,
        port: i64,
        cancel: &CancelSignal,
    ) -> Result<ProbeOutcome, Cancelled> {
        let result = match ProbeRequest::parse(domain, query_type, port) {
            Ok(request) => self.run(&request, cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                if let ProbeOutcome::TimedOut { attempts, .. } = &outcome {
                    info!(domain, port, attempts, "probe timed out");
                } else {
                    info!(domain, port, outcome = outcome.label(), "probe finished");
                }
                Ok(outcome)
            }
            Err(ProbeError::Cancelled) => {
                info!(domain, port, "probe cancelled");
                Err(Cancelled)
            }
            Err(reason) => {
                warn!(domain, port, error = %reason, "probe failed");
                Ok(ProbeOutcome::Failed {
                    domain: domain.to_string(),
                    port,
                    reason,
                })
            }
        }
    }

    async fn run(&self, request: &ProbeRequest, cancel: &CancelSignal) -> Result<ProbeOutcome, ProbeError> {
        let answers = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            answers = self.resolver.query(&request.domain, request.record_type) => answers?,
        };
        let ip = first_ipv4(&request.domain, &answers)?;

        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let mut conn = self.connector.initiate(SocketAddrV4::new(ip, request.port))?;

        for attempt in 0..self.settings.max_attempts {
            if conn.is_connected()? {
                return Ok(ProbeOutcome::Connected {
                    domain: request.domain.clone(),
                    port: request.port.into(),
                });
            }

            warn!(domain = %request.domain, port = request.port, attempt, "waiting for connection");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        Ok(ProbeOutcome::TimedOut {
            domain: request.domain.clone(),
            port: request.port.into(),
            attempts: self.settings.max_attempts,
            bound: self.settings.bound(),
        })
    }
}
