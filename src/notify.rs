//! Notification port
//!
//! Outbound user messages are fire-and-forget from the engines' point of
//! view; delivery, retries and rendering belong to the presentation side
//! of the port.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::core_types::UserId;

/// Well-known notification kinds emitted by the core.
pub mod kinds {
    pub const ORDER_COMPLETED: &str = "order_completed";
    pub const ORDER_FAILED: &str = "order_failed";
    pub const P2P_TAKEN: &str = "p2p_taken";
    pub const P2P_PAYMENT_SENT: &str = "p2p_payment_sent";
    pub const P2P_COMPLETED: &str = "p2p_completed";
    pub const P2P_CANCELLED: &str = "p2p_cancelled";
    pub const P2P_DISPUTE: &str = "p2p_dispute";
    pub const P2P_MESSAGE: &str = "p2p_message";
    pub const FEE_DAY: &str = "fee_day";
}

#[async_trait]
pub trait NotificationPort: Send + Sync {
    /// Deliver best-effort; implementations swallow their own failures.
    async fn notify(&self, user: UserId, kind: &str, payload: Value);
}

/// Default port: structured log lines only. The chat frontend plugs its own
/// implementation in at composition time.
pub struct LogNotifier;

#[async_trait]
impl NotificationPort for LogNotifier {
    async fn notify(&self, user: UserId, kind: &str, payload: Value) {
        info!(user, kind, %payload, "notification");
    }
}
