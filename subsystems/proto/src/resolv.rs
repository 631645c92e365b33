//! Name resolution framework.
//!
//! Resolvers are tried in registration order: the numeric resolver answers
//! IP-literal names immediately, the DNS resolver answers everything else
//! asynchronously. Consumers poll the returned [`NameResolution`] from
//! their own state machines.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::net::{IpAddr, SocketAddr};

use spin::Mutex;

use cinder_kernel::error::{Error, Result};

/// An in-flight (or completed) name resolution
pub struct NameResolution {
    name: String,
    port: u16,
    result: Mutex<Option<Result<SocketAddr>>>,
}

impl NameResolution {
    pub fn new(name: &str, port: u16) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            port,
            result: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Record the outcome (first writer wins)
    pub fn complete(&self, rc: Result<IpAddr>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(rc.map(|ip| SocketAddr::new(ip, self.port)));
        }
    }

    /// Outcome, once resolution has finished
    pub fn result(&self) -> Option<Result<SocketAddr>> {
        *self.result.lock()
    }
}

impl core::fmt::Debug for NameResolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NameResolution")
            .field("name", &self.name)
            .field("done", &self.result.lock().is_some())
            .finish()
    }
}

/// Resolve a host name or address literal
///
/// Returns a [`NameResolution`] that completes immediately for literals
/// and asynchronously (via the DNS resolver) otherwise.
pub fn resolve(name: &str, port: u16) -> Result<Arc<NameResolution>> {
    let resolution = NameResolution::new(name, port);

    // Numeric resolver first
    if let Ok(addr) = name.parse::<IpAddr>() {
        resolution.complete(Ok(addr));
        return Ok(resolution);
    }
    if name.is_empty() {
        return Err(Error::InvalidArgument);
    }

    crate::dns::lookup(name, resolution.clone())?;
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_names_resolve_immediately() {
        let res = resolve("192.0.2.7", 80).unwrap();
        assert_eq!(
            res.result(),
            Some(Ok("192.0.2.7:80".parse().unwrap()))
        );
        let res = resolve("fe80::1", 443).unwrap();
        assert_eq!(res.result().unwrap().unwrap().port(), 443);
    }

    #[test]
    fn first_completion_wins() {
        let res = NameResolution::new("host", 80);
        res.complete(Err(Error::TimedOut));
        res.complete(Ok(IpAddr::V4(core::net::Ipv4Addr::LOCALHOST)));
        assert_eq!(res.result(), Some(Err(Error::TimedOut)));
    }
}
