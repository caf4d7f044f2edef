// Delivery adapters
//
// - ts:  per-client pull loop over the shared chunk buffer
// - hls: manifest and segment files served straight from disk

pub mod hls;
pub mod ts;

pub use hls::{HlsDelivery, HlsManifest};
pub use ts::{TsDelivery, TsStream};

/// Runs its cleanup when dropped, whichever way the owning task ends.
///
/// Held for the lifetime of a TS viewer connection so the session is
/// always deregistered: normal end, error or an abrupt disconnect.
pub struct SessionGuard(Option<Box<dyn FnOnce() + Send>>);

impl SessionGuard {
    pub(crate) fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_drop)))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}
