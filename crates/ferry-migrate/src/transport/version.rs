//! Process-lifetime cache for the negotiated target API version.

use parking_lot::RwLock;

/// Holds the negotiated version until explicitly cleared. No TTL.
#[derive(Debug, Default)]
pub struct ApiVersionCache {
    negotiated: RwLock<Option<String>>,
}

impl ApiVersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.negotiated.read().clone()
    }

    pub fn set(&self, version: impl Into<String>) {
        *self.negotiated.write() = Some(version.into());
    }

    pub fn clear(&self) {
        *self.negotiated.write() = None;
    }
}
