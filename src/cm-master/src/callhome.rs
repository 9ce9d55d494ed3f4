//! Telemetry opt-out (§6 `callhome_*`). Transport is out of scope (§1); this
//! crate only carries the switch, its cadence, and a trait a production
//! build would implement against a real telemetry sink.

use async_trait::async_trait;

/// A periodic collector of anonymized deployment telemetry. The default
/// implementation does nothing: it exists so `MasterService` always has
/// something to call on the configured interval, regardless of whether a
/// real sink is wired in.
#[async_trait]
pub trait CallHomeCollector: Send + Sync {
    async fn collect_and_send(&self);
}

#[derive(Default)]
pub struct NoopCallHomeCollector;

#[async_trait]
impl CallHomeCollector for NoopCallHomeCollector {
    async fn collect_and_send(&self) {}
}
