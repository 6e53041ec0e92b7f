//! Distributed lane/broker trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::lane::{DispatchToken, Lane};

#[async_trait]
pub trait LaneBroker: Send + Sync {
    async fn enqueue(&self, lane: Lane, token: DispatchToken) -> Result<()>;

    /// Next token of `lane`, or None when the lane is empty or saturated.
    async fn dequeue(&self, lane: Lane) -> Result<Option<DispatchToken>>;

    /// Best-effort abandonment of an attempt. Returns whether the broker still knew the token.
    async fn revoke(&self, token: &DispatchToken) -> bool;

    /// Release the slot held by a dequeued token.
    async fn ack(&self, token: &DispatchToken);

    /// Whether `revoke` was called for this attempt.
    async fn is_revoked(&self, token: &DispatchToken) -> bool;
}
