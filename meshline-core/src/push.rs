//! Push-notification hook (spec.md §1: "augmented with optional push
//! notifications so offline peers can be woken"). The service-worker
//! life cycle and delivery plumbing are explicitly out of scope (spec.md §1);
//! this crate only needs a seam to call when a `dial` targets a peer with no
//! live saga yet, so a host application can plug in its own wake mechanism.

use async_trait::async_trait;

/// Notifies a peer that a connection attempt is pending, so an offline
/// client can be woken by its platform's push service. The default
/// implementation is a no-op; hosts that want wake-on-dial provide their own.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_dial(&self, peer_public_key_base64: &str);
}

/// Does nothing. Used when no push plumbing is configured.
pub struct NoopPushNotifier;

#[async_trait]
impl PushNotifier for NoopPushNotifier {
    async fn notify_dial(&self, _peer_public_key_base64: &str) {}
}
