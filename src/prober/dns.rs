use async_trait::async_trait;
use std::time::Duration;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::proto::rr::{RData, RecordType};

use super::ProbeError;

/// Answers a single DNS query. One call per probe, never retried by the caller.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn query(&self, domain: &str, record_type: RecordType) -> Result<Vec<RData>, ProbeError>;
}

pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    /// `upstream` is one of "google", "cloudflare" or "quad9".
    pub fn new(upstream: &str, timeout: Duration) -> anyhow::Result<Self> {
        let config = match upstream {
            "google" => ResolverConfig::google(),
            "cloudflare" => ResolverConfig::cloudflare(),
            "quad9" => ResolverConfig::quad9(),
            other => return Err(anyhow::anyhow!("Unknown DNS upstream: {}", other)),
        };

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, resolver_opts(timeout)),
        })
    }
}

/// One query to one nameserver, no retries, no cached answers.
fn resolver_opts(timeout: Duration) -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 0;
    opts.num_concurrent_reqs = 1;
    opts.try_tcp_on_error = false;
    opts.cache_size = 0;
    opts.use_hosts_file = false;
    opts
}

#[async_trait]
impl Resolve for TrustDnsResolver {
    async fn query(&self, domain: &str, record_type: RecordType) -> Result<Vec<RData>, ProbeError> {
        let lookup = self
            .resolver
            .lookup(domain, record_type)
            .await
            .map_err(|e| ProbeError::ResolutionFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(domain, %record_type, answers = lookup.iter().count(), "dns query answered");
        Ok(lookup.iter().cloned().collect())
    }
}
