//! Cross-tick mutual exclusion.
//!
//! Two overlapping ticks could both decide to scale. A caller must hold a
//! [`Lease`] before running a tick; the tick refuses to start on an
//! expired one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallResult;

/// Proof that `holder` owns the tick lease until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    /// Construct a granted lease. Only lease providers should call this.
    pub fn granted(holder: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            expires_at,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Grants and releases the single tick lease.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Returns `None` while another holder owns an unexpired lease.
    async fn acquire(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CallResult<Option<Lease>>;

    async fn release(&self, lease: &Lease) -> CallResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expires_at_deadline() {
        let now = Utc::now();
        let lease = Lease::granted("tick-1", now + chrono::Duration::seconds(10));
        assert!(lease.is_valid_at(now));
        assert!(!lease.is_valid_at(now + chrono::Duration::seconds(10)));
        assert_eq!(lease.holder(), "tick-1");
    }
}
