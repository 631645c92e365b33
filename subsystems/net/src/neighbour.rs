//! # Neighbour Cache
//!
//! One cache maps `(device, network protocol, network address)` to a link
//! address, shared by ARP and NDP. A transmission to an unresolved
//! neighbour is queued on the entry while the discovery protocol solicits
//! with exponential backoff; resolution flushes the queue in FIFO order,
//! and the retry ceiling drops it with a timeout.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use spin::Mutex;

use cinder_kernel::discard::{register_discarder, CacheDiscarder};
use cinder_kernel::error::Result;
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process::{self, Process};
use cinder_kernel::retry::RetryTimer;
use cinder_kernel::ticks::{currticks, TICKS_PER_SEC};

use crate::netdev::{self, MacAddr, NetDevice};

/// Minimum solicitation interval (125 ms)
pub const MIN_TIMEOUT: u64 = TICKS_PER_SEC / 8;

/// Maximum solicitation interval
pub const MAX_TIMEOUT: u64 = 3 * TICKS_PER_SEC;

/// Cache capacity
pub const CACHE_SIZE: usize = 32;

/// A neighbour discovery protocol (ARP or NDP)
pub trait NeighbourDiscovery: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transmit one solicitation for `net_addr` on `dev`
    fn solicit(&self, dev: &Arc<NetDevice>, net_addr: &[u8]) -> Result<()>;
}

struct Entry {
    dev_index: usize,
    net_proto: u16,
    net_addr: Vec<u8>,
    ll_addr: Option<MacAddr>,
    timer: RetryTimer,
    queue: VecDeque<IoBuffer>,
    discovery: Arc<dyn NeighbourDiscovery>,
    created: u64,
}

static CACHE: Mutex<ArrayVec<Entry, CACHE_SIZE>> = Mutex::new(ArrayVec::new_const());

fn matches(entry: &Entry, dev: &NetDevice, net_proto: u16, net_addr: &[u8]) -> bool {
    entry.dev_index == dev.index()
        && entry.net_proto == net_proto
        && entry.net_addr == net_addr
}

/// Evict one entry to make room
///
/// Prefers the oldest resolved entry with nothing queued; failing that the
/// oldest entry outright, whose queued packets are dropped.
fn evict(cache: &mut ArrayVec<Entry, CACHE_SIZE>) {
    let preferred = cache
        .iter()
        .enumerate()
        .filter(|(_, e)| e.ll_addr.is_some() && e.queue.is_empty())
        .min_by_key(|(_, e)| e.created)
        .map(|(i, _)| i);
    let victim = preferred.or_else(|| {
        cache
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.created)
            .map(|(i, _)| i)
    });
    if let Some(index) = victim {
        let entry = cache.remove(index);
        if !entry.queue.is_empty() {
            log::debug!(
                "neighbour cache evicting pending entry with {} queued packets",
                entry.queue.len()
            );
        }
        // Queued buffers drop here with the NoBufs semantics: the eviction
        // is the caller-visible outcome
        drop(entry);
    }
}

/// Transmit via the neighbour cache
///
/// Returns immediately (having transmitted) when the neighbour is
/// resolved; otherwise the buffer joins the entry's deferred queue and, if
/// the entry is new, the discovery protocol begins soliciting.
pub fn tx(
    iobuf: IoBuffer,
    dev: &Arc<NetDevice>,
    net_proto: u16,
    net_addr: &[u8],
    discovery: Arc<dyn NeighbourDiscovery>,
) -> Result<()> {
    let mut cache = CACHE.lock();
    if let Some(entry) = cache
        .iter_mut()
        .find(|e| matches(e, dev, net_proto, net_addr))
    {
        return match entry.ll_addr {
            Some(ll_addr) => {
                drop(cache);
                netdev::net_tx(iobuf, dev, net_proto, ll_addr)
            }
            None => {
                entry.queue.push_back(iobuf);
                Ok(())
            }
        };
    }

    if cache.len() >= CACHE_SIZE {
        evict(&mut cache);
    }

    let mut timer = RetryTimer::new(MIN_TIMEOUT, MAX_TIMEOUT);
    timer.start();
    let mut queue = VecDeque::new();
    queue.push_back(iobuf);
    let _ = cache.try_push(Entry {
        dev_index: dev.index(),
        net_proto,
        net_addr: net_addr.to_vec(),
        ll_addr: None,
        timer,
        queue,
        discovery: discovery.clone(),
        created: currticks(),
    });
    drop(cache);

    log::debug!("{} soliciting via {}", dev.name(), discovery.name());
    discovery.solicit(dev, net_addr)
}

/// Record a resolution and flush the deferred queue in FIFO order
///
/// Per-packet transmit errors are logged and do not affect the rest of the
/// queue.
pub fn update(dev: &Arc<NetDevice>, net_proto: u16, net_addr: &[u8], ll_addr: MacAddr) {
    let mut cache = CACHE.lock();
    let Some(entry) = cache
        .iter_mut()
        .find(|e| matches(e, dev, net_proto, net_addr))
    else {
        return;
    };
    entry.ll_addr = Some(ll_addr);
    entry.timer.stop();
    let queue = core::mem::take(&mut entry.queue);
    drop(cache);

    for iobuf in queue {
        if let Err(err) = netdev::net_tx(iobuf, dev, net_proto, ll_addr) {
            log::debug!("{} deferred tx failed: {}", dev.name(), err);
        }
    }
}

/// Insert a resolved entry directly (static mappings)
pub fn insert_resolved(dev: &Arc<NetDevice>, net_proto: u16, net_addr: &[u8], ll_addr: MacAddr) {
    let mut cache = CACHE.lock();
    if let Some(entry) = cache
        .iter_mut()
        .find(|e| matches(e, dev, net_proto, net_addr))
    {
        entry.ll_addr = Some(ll_addr);
        entry.timer.stop();
        return;
    }
    if cache.len() >= CACHE_SIZE {
        evict(&mut cache);
    }
    let _ = cache.try_push(Entry {
        dev_index: dev.index(),
        net_proto,
        net_addr: net_addr.to_vec(),
        ll_addr: Some(ll_addr),
        timer: RetryTimer::new(MIN_TIMEOUT, MAX_TIMEOUT),
        queue: VecDeque::new(),
        discovery: Arc::new(NullDiscovery),
        created: currticks(),
    });
}

struct NullDiscovery;

impl NeighbourDiscovery for NullDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    fn solicit(&self, _dev: &Arc<NetDevice>, _net_addr: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Look up a resolved neighbour without transmitting
pub fn lookup(dev: &NetDevice, net_proto: u16, net_addr: &[u8]) -> Option<MacAddr> {
    CACHE
        .lock()
        .iter()
        .find(|e| matches(e, dev, net_proto, net_addr))
        .and_then(|e| e.ll_addr)
}

/// Drop all entries for a device (device closed)
pub fn flush(dev: &NetDevice) {
    CACHE.lock().retain(|e| e.dev_index != dev.index());
}

/// Number of cached entries
pub fn len() -> usize {
    CACHE.lock().len()
}

/// Drop everything (tests)
pub fn clear() {
    CACHE.lock().clear();
}

/// Timer pass: resolicit pending entries, expire those past the ceiling
fn step_timers() {
    let mut solicitations: Vec<(usize, Vec<u8>, Arc<dyn NeighbourDiscovery>)> = Vec::new();
    {
        let mut cache = CACHE.lock();
        cache.retain(|entry| {
            match entry.timer.expired() {
                None => true,
                Some(false) => {
                    entry.timer.start();
                    solicitations.push((
                        entry.dev_index,
                        entry.net_addr.clone(),
                        entry.discovery.clone(),
                    ));
                    true
                }
                Some(true) => {
                    log::debug!(
                        "neighbour entry timed out with {} queued packets",
                        entry.queue.len()
                    );
                    false
                }
            }
        });
    }
    for (dev_index, net_addr, discovery) in solicitations {
        if let Some(dev) = netdev::find_netdev_by_index(dev_index) {
            let _ = discovery.solicit(&dev, &net_addr);
        }
    }
}

struct NeighbourProcess;

impl Process for NeighbourProcess {
    fn name(&self) -> &str {
        "neighbour"
    }

    fn step(&self) {
        step_timers();
    }
}

struct NeighbourDiscarder;

impl CacheDiscarder for NeighbourDiscarder {
    fn discard(&self) -> bool {
        let mut cache = CACHE.lock();
        let victim = cache
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ll_addr.is_some() && e.queue.is_empty())
            .min_by_key(|(_, e)| e.created)
            .map(|(i, _)| i);
        match victim {
            Some(index) => {
                cache.remove(index);
                true
            }
            None => false,
        }
    }
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        process::register_process(Arc::new(NeighbourProcess));
        register_discarder(Arc::new(NeighbourDiscarder));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::ETH_P_IP;
    use crate::netdev::MockDevice;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDiscovery {
        solicits: AtomicUsize,
    }

    impl NeighbourDiscovery for CountingDiscovery {
        fn name(&self) -> &'static str {
            "test"
        }

        fn solicit(&self, _dev: &Arc<NetDevice>, _net_addr: &[u8]) -> Result<()> {
            self.solicits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn deferred_queue_flushes_in_order() {
        let _guard = crate::TEST_MUTEX.lock();
        clear();
        let (mock, dev) = MockDevice::create();
        dev.open().unwrap();
        let discovery = Arc::new(CountingDiscovery {
            solicits: AtomicUsize::new(0),
        });

        let target = [10, 0, 2, 2];
        tx(IoBuffer::from_slice(b"first"), &dev, ETH_P_IP, &target, discovery.clone()).unwrap();
        tx(IoBuffer::from_slice(b"second"), &dev, ETH_P_IP, &target, discovery.clone()).unwrap();
        // Nothing on the wire yet; one solicitation sent
        assert!(mock.pop_sent().is_none());
        assert_eq!(discovery.solicits.load(Ordering::Relaxed), 1);

        update(&dev, ETH_P_IP, &target, MacAddr([2; 6]));
        let first = mock.pop_sent().unwrap();
        let second = mock.pop_sent().unwrap();
        assert!(first.ends_with(b"first"));
        assert!(second.ends_with(b"second"));

        // Resolved entries transmit immediately
        tx(IoBuffer::from_slice(b"third"), &dev, ETH_P_IP, &target, discovery).unwrap();
        assert!(mock.pop_sent().unwrap().ends_with(b"third"));

        crate::netdev::NetDevice::unregister(&dev);
        clear();
    }

    #[test]
    fn cache_full_evicts_oldest_pending() {
        let _guard = crate::TEST_MUTEX.lock();
        clear();
        let (_mock, dev) = MockDevice::create();
        dev.open().unwrap();
        let discovery = Arc::new(CountingDiscovery {
            solicits: AtomicUsize::new(0),
        });

        for i in 0..CACHE_SIZE {
            let addr = [10, 0, (i >> 8) as u8, i as u8];
            cinder_kernel::ticks::advance(1);
            tx(IoBuffer::from_slice(b"q"), &dev, ETH_P_IP, &addr, discovery.clone()).unwrap();
        }
        assert_eq!(len(), CACHE_SIZE);

        // One more transmission evicts the oldest (all pending), not the
        // newest
        let overflow = [10, 9, 9, 9];
        tx(IoBuffer::from_slice(b"q"), &dev, ETH_P_IP, &overflow, discovery).unwrap();
        assert_eq!(len(), CACHE_SIZE);
        assert!(lookup(&dev, ETH_P_IP, &overflow).is_none());
        // The first entry is gone
        let cache_has_first = CACHE
            .lock()
            .iter()
            .any(|e| e.net_addr == [10, 0, 0, 0]);
        assert!(!cache_has_first);

        crate::netdev::NetDevice::unregister(&dev);
        clear();
    }
}
