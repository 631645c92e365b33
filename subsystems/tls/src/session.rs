//! TLS session cache.
//!
//! Resumed sessions skip the key exchange and reuse the cached master
//! secret. The cache is keyed by server name, which doubles as the root
//! of trust under a single-validator configuration.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

/// A cached session
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Vec<u8>,
    pub master_secret: Vec<u8>,
    pub suite_id: u16,
}

static CACHE: Mutex<Option<HashMap<String, Session>>> = Mutex::new(None);

/// Look up a cached session for a server
pub fn lookup(server_name: &str) -> Option<Session> {
    CACHE.lock().as_ref()?.get(server_name).cloned()
}

/// Record a successfully established session
pub fn store(server_name: &str, session: Session) {
    if session.session_id.is_empty() {
        return;
    }
    CACHE
        .lock()
        .get_or_insert_with(HashMap::new)
        .insert(server_name.to_string(), session);
}

/// Drop a session (after a failed resumption)
pub fn forget(server_name: &str) {
    if let Some(cache) = CACHE.lock().as_mut() {
        cache.remove(server_name);
    }
}
