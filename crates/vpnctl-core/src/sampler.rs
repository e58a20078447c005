//! Stats Sampler
//!
//! Asks the running tunnel for its transfer counters. The reply is
//! `"<upload>,<download>"`; anything else is dropped.

use crate::platform::TunnelConnection;
use crate::state::StatsSample;
use std::time::Duration;
use tracing::debug;

/// Control message understood by the packet tunnel
pub const STATS_REQUEST: &[u8] = b"stats";

/// One-shot stats requests with a bounded wait
#[derive(Debug, Clone)]
pub struct StatsSampler {
    timeout: Duration,
}

impl StatsSampler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Request one sample. Never fails: every problem reads as `None`.
    pub async fn sample(&self, connection: &dyn TunnelConnection) -> Option<StatsSample> {
        let reply = match tokio::time::timeout(self.timeout, connection.send_message(STATS_REQUEST)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!("Stats request rejected: {}", e);
                return None;
            }
            Err(_) => {
                debug!("Stats request timed out after {:?}", self.timeout);
                return None;
            }
        };

        let sample = std::str::from_utf8(&reply).ok().and_then(parse_stats_reply);
        if sample.is_none() {
            debug!(len = reply.len(), "Dropping malformed stats reply");
        }
        sample
    }
}

/// Parse `"<upload>,<download>"`
pub fn parse_stats_reply(reply: &str) -> Option<StatsSample> {
    let mut fields = reply.trim().split(',');
    let upload = fields.next()?.parse().ok()?;
    let download = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(StatsSample::new(upload, download))
}
