//! Request scoping and call deadlines.
//!
//! `RequestContext` is built once per request by the tenant resolver and
//! handed to every downstream handler; handlers never re-derive tenant
//! identity. `CallContext` carries the deadline and cancellation signal
//! through every external call.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::tenant::TenantTier;

/// How the request authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    SessionToken,
    ApiCredential,
    SlugOnly,
}

/// Tenant-scoped view of one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: String,
    pub tenant_slug: String,
    pub tier: TenantTier,
    pub principal_id: Option<String>,
    /// Frozen permission snapshot for the life of the request.
    pub permissions: Arc<Vec<String>>,
    pub source_addr: Option<IpAddr>,
    pub correlation_id: String,
    pub auth_method: AuthMethod,
}

impl RequestContext {
    pub fn is_credential_auth(&self) -> bool {
        self.auth_method == AuthMethod::ApiCredential
    }

    pub fn source_network(&self) -> Option<String> {
        self.source_addr.map(|a| a.to_string())
    }
}

/// Deadline + cancellation context threaded through external calls.
///
/// Child contexts share the parent's cancellation token, so cancelling a
/// session cancels all of its in-flight provider calls.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Child with a tighter deadline; never extends the parent's.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a future against this context's deadline and cancellation.
    /// Partial results from a timed-out or cancelled call are discarded.
    pub async fn run<F, T>(&self, provider: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let unavailable = |message: &str| Error::ProviderUnavailable {
            provider: provider.to_string(),
            message: message.to_string(),
        };

        match self.remaining() {
            Some(remaining) if remaining.is_zero() => {
                return Err(unavailable("deadline already expired"))
            }
            Some(remaining) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(unavailable("cancelled")),
                    out = tokio::time::timeout(remaining, fut) => match out {
                        Ok(res) => res,
                        Err(_) => Err(unavailable("deadline exceeded")),
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(unavailable("cancelled")),
                    res = fut => res,
                }
            }
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
