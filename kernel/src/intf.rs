//! # Interfaces
//!
//! Typed bidirectional plug points between objects. An [`Intf`] endpoint
//! holds a reference to the destination object it is plugged to; two
//! endpoints are plugged as a pair with [`plug_pair`], so each side can
//! invoke operations on the other through its trait vtable.
//!
//! Shutdown cascades: [`Intf::shutdown`] takes the destination exactly once
//! and invokes its `close` operation, which typically shuts down the
//! destination's own interfaces in turn. Short cycles in the object graph
//! (TCP holds its application, the application holds TCP) terminate because
//! the second leg finds the endpoint already unplugged and becomes a no-op.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::Result;
use crate::iobuf::IoBuffer;

/// Per-delivery metadata
#[derive(Debug, Clone, Default)]
pub struct XferMeta {
    /// Explicit offset of this data within the overall stream
    pub offset: Option<u64>,
    /// Source socket address (datagram receivers)
    pub src: Option<core::net::SocketAddr>,
    /// Destination socket address (datagram receivers)
    pub dest: Option<core::net::SocketAddr>,
}

/// Operations a data-transfer destination implements
///
/// Missing implementations take the typed defaults: an object that does not
/// meter its input advertises an unlimited window.
pub trait XferTarget: Send + Sync {
    /// Deliver a buffer. Ownership of the buffer passes to the callee.
    fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()>;

    /// Flow-control window: how many bytes the object is willing to accept
    fn window(&self) -> usize {
        usize::MAX
    }

    /// The interface is being closed with the given reason
    fn close(&self, rc: Result<()>);
}

/// A data-transfer interface endpoint
pub struct Intf {
    dest: Mutex<Option<Arc<dyn XferTarget>>>,
}

impl Intf {
    /// Create an unplugged endpoint
    pub const fn new() -> Self {
        Self {
            dest: Mutex::new(None),
        }
    }

    /// Plug this endpoint into a destination object
    pub fn plug(&self, dest: Arc<dyn XferTarget>) {
        *self.dest.lock() = Some(dest);
    }

    /// Current destination, if plugged
    pub fn dest(&self) -> Option<Arc<dyn XferTarget>> {
        self.dest.lock().clone()
    }

    /// True if plugged to a destination
    pub fn is_plugged(&self) -> bool {
        self.dest.lock().is_some()
    }

    /// Unplug without notifying the destination
    pub fn unplug(&self) {
        self.dest.lock().take();
    }

    /// Deliver a buffer to the destination
    ///
    /// An unplugged endpoint is the null interface: it swallows the buffer
    /// and reports success.
    pub fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()> {
        match self.dest() {
            Some(dest) => dest.deliver(iobuf, meta),
            None => Ok(()),
        }
    }

    /// Flow-control window of the destination (zero when unplugged)
    pub fn window(&self) -> usize {
        match self.dest() {
            Some(dest) => dest.window(),
            None => 0,
        }
    }

    /// Shut the interface down, cascading `close` to the destination
    ///
    /// Idempotent: the destination is taken before `close` runs, so a
    /// re-entrant shutdown along a cyclic graph terminates.
    pub fn shutdown(&self, rc: Result<()>) {
        if let Some(dest) = self.dest.lock().take() {
            dest.close(rc);
        }
    }
}

impl Default for Intf {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Intf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Intf")
            .field("plugged", &self.is_plugged())
            .finish()
    }
}

/// Plug two objects together through their endpoints
///
/// After this call `a_intf` dispatches to `b` and `b_intf` dispatches to
/// `a`; each object holds one strong reference to its peer for the lifetime
/// of the connection.
pub fn plug_pair(
    a_intf: &Intf,
    a: Arc<dyn XferTarget>,
    b_intf: &Intf,
    b: Arc<dyn XferTarget>,
) {
    a_intf.plug(b);
    b_intf.plug(a);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Sink {
        delivered: AtomicUsize,
        closes: AtomicUsize,
        intf: Intf,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                intf: Intf::new(),
            })
        }
    }

    impl XferTarget for Sink {
        fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
            self.delivered.fetch_add(iobuf.len(), Ordering::Relaxed);
            Ok(())
        }

        fn close(&self, rc: Result<()>) {
            self.closes.fetch_add(1, Ordering::Relaxed);
            // Cascade: close our own interface in turn
            self.intf.shutdown(rc);
        }
    }

    #[test]
    fn null_interface_swallows() {
        let intf = Intf::new();
        let iob = IoBuffer::from_slice(b"data");
        assert!(intf.deliver(iob, &XferMeta::default()).is_ok());
        assert_eq!(intf.window(), 0);
    }

    #[test]
    fn delivery_reaches_destination() {
        let a = Sink::new();
        let b = Sink::new();
        plug_pair(&a.intf, a.clone(), &b.intf, b.clone());
        a.intf
            .deliver(IoBuffer::from_slice(b"abcd"), &XferMeta::default())
            .unwrap();
        assert_eq!(b.delivered.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn shutdown_cascades_once_around_cycle() {
        let a = Sink::new();
        let b = Sink::new();
        plug_pair(&a.intf, a.clone(), &b.intf, b.clone());

        a.intf.shutdown(Err(crate::Error::Cancelled));

        // b was closed; b's cascade found a's endpoint already unplugged on
        // the way back, so each side closed exactly once
        assert_eq!(b.closes.load(Ordering::Relaxed), 1);
        assert_eq!(a.closes.load(Ordering::Relaxed), 1);
        assert!(!a.intf.is_plugged());
        assert!(!b.intf.is_plugged());
    }

    #[test]
    fn references_unwind_on_shutdown() {
        let a = Sink::new();
        let b = Sink::new();
        plug_pair(&a.intf, a.clone(), &b.intf, b.clone());
        assert_eq!(Arc::strong_count(&b), 2);
        a.intf.shutdown(Ok(()));
        assert_eq!(Arc::strong_count(&b), 1);
        assert_eq!(Arc::strong_count(&a), 1);
    }
}
