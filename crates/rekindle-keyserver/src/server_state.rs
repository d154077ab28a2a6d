use std::sync::Arc;

use rekindle_keys::KeyService;

/// Central state for the key server daemon.
pub struct ServerState {
    /// Key lifecycle operations over the server's key database.
    pub keys: Arc<KeyService>,
    /// Unix timestamp when the server started.
    pub started_at: u64,
}
