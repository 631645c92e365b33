//! # Network Devices
//!
//! The boundary between link drivers (which move frames) and the protocol
//! stack (which understands them). Only [`IoBuffer`]s cross this boundary.
//! Drivers implement [`NetDeviceOps`]; the stack owns the TX/RX queues,
//! link state, statistics and the per-device settings block.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process::{self, Process};
use cinder_settings::{register_settings, unregister_settings, SettingsBlock};

use crate::ethernet::{self, LinkProtocol};

/// A link-layer MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl core::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

bitflags! {
    /// Device state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetDevFlags: u8 {
        /// Device has been opened
        const OPEN = 0x01;
        /// Interrupts are enabled
        const IRQ = 0x02;
    }
}

/// Operations a link driver implements
pub trait NetDeviceOps: Send + Sync {
    /// Bring the hardware up
    fn open(&self, dev: &NetDevice) -> Result<()>;

    /// Shut the hardware down
    fn close(&self, dev: &NetDevice);

    /// Start transmitting one frame; completion is reported through
    /// [`NetDevice::tx_complete`]
    fn transmit(&self, dev: &NetDevice, iobuf: &IoBuffer) -> Result<()>;

    /// Poll for received frames (enqueued via [`NetDevice::rx_enqueue`])
    /// and transmit completions
    fn poll(&self, dev: &NetDevice);

    /// Enable or disable the device interrupt
    fn irq(&self, _dev: &NetDevice, _enable: bool) {}
}

/// Per-device statistics for one direction
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDevDirStats {
    pub good: u64,
    pub bad: u64,
    /// Most recent error, if any
    pub last_error: Option<Error>,
}

impl NetDevDirStats {
    fn record(&mut self, rc: Result<()>) {
        match rc {
            Ok(()) => self.good += 1,
            Err(err) => {
                self.bad += 1;
                self.last_error = Some(err);
            }
        }
    }
}

/// A network device
pub struct NetDevice {
    name: String,
    ops: Box<dyn NetDeviceOps>,
    link: &'static dyn LinkProtocol,
    /// Permanent hardware address
    hw_addr: MacAddr,
    /// Current link-layer address (may be overridden)
    ll_addr: Mutex<MacAddr>,
    mtu: usize,
    flags: Mutex<NetDevFlags>,
    /// `Ok` when the link is up; the error code otherwise
    link_rc: Mutex<Result<()>>,
    tx_queue: Mutex<VecDeque<IoBuffer>>,
    rx_queue: Mutex<VecDeque<IoBuffer>>,
    tx_stats: Mutex<NetDevDirStats>,
    rx_stats: Mutex<NetDevDirStats>,
    settings: Arc<SettingsBlock>,
    index: usize,
}

static NET_DEVICES: RwLock<Vec<Arc<NetDevice>>> = RwLock::new(Vec::new());
static NEXT_INDEX: Mutex<usize> = Mutex::new(0);

impl NetDevice {
    /// Allocate and register a device driven by `ops`
    pub fn register(ops: Box<dyn NetDeviceOps>, hw_addr: MacAddr, mtu: usize) -> Arc<NetDevice> {
        let index = {
            let mut next = NEXT_INDEX.lock();
            let index = *next;
            *next += 1;
            index
        };
        let name = format!("net{index}");
        let settings = SettingsBlock::new(&name, 10 + index as i32);
        register_settings(settings.clone(), None);
        let dev = Arc::new(NetDevice {
            name: name.clone(),
            ops,
            link: ethernet::ethernet(),
            hw_addr,
            ll_addr: Mutex::new(hw_addr),
            mtu,
            flags: Mutex::new(NetDevFlags::empty()),
            link_rc: Mutex::new(Err(Error::InProgress)),
            tx_queue: Mutex::new(VecDeque::new()),
            rx_queue: Mutex::new(VecDeque::new()),
            tx_stats: Mutex::new(NetDevDirStats::default()),
            rx_stats: Mutex::new(NetDevDirStats::default()),
            settings,
            index,
        });
        NET_DEVICES.write().push(dev.clone());
        log::info!("{} registered ({})", name, hw_addr);
        dev
    }

    /// Unregister: close, flush queues, detach settings
    pub fn unregister(dev: &Arc<NetDevice>) {
        dev.close();
        let _ = unregister_settings(&dev.settings);
        NET_DEVICES.write().retain(|d| !Arc::ptr_eq(d, dev));
        log::info!("{} unregistered", dev.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn link_protocol(&self) -> &'static dyn LinkProtocol {
        self.link
    }

    pub fn hw_addr(&self) -> MacAddr {
        self.hw_addr
    }

    pub fn ll_addr(&self) -> MacAddr {
        *self.ll_addr.lock()
    }

    pub fn set_ll_addr(&self, addr: MacAddr) {
        *self.ll_addr.lock() = addr;
    }

    /// Per-device settings block (DHCP lease storage)
    pub fn settings(&self) -> &Arc<SettingsBlock> {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.flags.lock().contains(NetDevFlags::OPEN)
    }

    /// Link state: `Ok` if up, the blocking error otherwise
    pub fn link_rc(&self) -> Result<()> {
        *self.link_rc.lock()
    }

    pub fn link_up(&self) {
        *self.link_rc.lock() = Ok(());
    }

    pub fn link_down(&self, rc: Error) {
        *self.link_rc.lock() = Err(rc);
    }

    /// Open the device
    pub fn open(&self) -> Result<()> {
        {
            let mut flags = self.flags.lock();
            if flags.contains(NetDevFlags::OPEN) {
                return Ok(());
            }
            flags.insert(NetDevFlags::OPEN);
        }
        if let Err(err) = self.ops.open(self) {
            self.flags.lock().remove(NetDevFlags::OPEN);
            return Err(err);
        }
        log::info!("{} opened", self.name);
        Ok(())
    }

    /// Close the device and flush both queues
    pub fn close(&self) {
        {
            let mut flags = self.flags.lock();
            if !flags.contains(NetDevFlags::OPEN) {
                return;
            }
            flags.remove(NetDevFlags::OPEN);
        }
        self.ops.close(self);
        self.tx_queue.lock().clear();
        self.rx_queue.lock().clear();
        log::info!("{} closed", self.name);
    }

    /// Enqueue a fully-framed buffer for transmission and drain the queue
    pub fn tx(&self, iobuf: IoBuffer) -> Result<()> {
        if !self.is_open() {
            self.tx_stats.lock().record(Err(Error::NetUnreachable));
            return Err(Error::NetUnreachable);
        }
        self.tx_queue.lock().push_back(iobuf);
        self.tx_drain();
        Ok(())
    }

    /// Hand queued frames to the driver until it pushes back
    ///
    /// A driver that cannot accept a frame right now returns
    /// [`Error::WouldBlock`]; the frame stays queued and the next poll
    /// retries. Any other verdict completes the frame.
    pub fn tx_drain(&self) {
        loop {
            let Some(head) = self.tx_queue.lock().pop_front() else {
                return;
            };
            match self.ops.transmit(self, &head) {
                Ok(()) => self.tx_stats.lock().record(Ok(())),
                Err(Error::WouldBlock) => {
                    self.tx_queue.lock().push_front(head);
                    return;
                }
                Err(err) => {
                    log::debug!("{} transmit error: {err}", self.name);
                    self.tx_stats.lock().record(Err(err));
                }
            }
        }
    }

    /// Driver callback reporting an asynchronous completion status
    pub fn tx_complete(&self, rc: Result<()>) {
        if let Err(err) = rc {
            self.tx_stats.lock().record(Err(err));
        }
    }

    /// Driver callback: a received frame arrived
    pub fn rx_enqueue(&self, iobuf: IoBuffer) {
        self.rx_stats.lock().record(Ok(()));
        self.rx_queue.lock().push_back(iobuf);
    }

    /// Driver callback: a frame was received with an error
    pub fn rx_err(&self, rc: Error) {
        self.rx_stats.lock().record(Err(rc));
    }

    /// Dequeue one received frame
    pub fn rx_dequeue(&self) -> Option<IoBuffer> {
        self.rx_queue.lock().pop_front()
    }

    /// Poll the driver and retry deferred transmissions
    pub fn poll(&self) {
        if self.is_open() {
            self.ops.poll(self);
            self.tx_drain();
        }
    }

    pub fn tx_stats(&self) -> NetDevDirStats {
        *self.tx_stats.lock()
    }

    pub fn rx_stats(&self) -> NetDevDirStats {
        *self.rx_stats.lock()
    }
}

impl core::fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetDevice")
            .field("name", &self.name)
            .field("ll_addr", &self.ll_addr().to_string())
            .finish()
    }
}

/// All registered devices
pub fn net_devices() -> Vec<Arc<NetDevice>> {
    NET_DEVICES.read().clone()
}

/// Find a device by name
pub fn find_netdev(name: &str) -> Option<Arc<NetDevice>> {
    NET_DEVICES.read().iter().find(|d| d.name == name).cloned()
}

/// Find a device by registration index
pub fn find_netdev_by_index(index: usize) -> Option<Arc<NetDevice>> {
    NET_DEVICES.read().iter().find(|d| d.index == index).cloned()
}

// ============================================================================
// Network-protocol registry and the TX/RX pivot points
// ============================================================================

/// A registered network-layer protocol, keyed by ethertype
#[derive(Clone, Copy)]
pub struct NetProtocol {
    pub name: &'static str,
    /// Ethertype in host order
    pub net_proto: u16,
    pub rx: fn(iobuf: IoBuffer, dev: &Arc<NetDevice>, ll_dest: MacAddr, ll_source: MacAddr) -> Result<()>,
}

static NET_PROTOCOLS: RwLock<Vec<NetProtocol>> = RwLock::new(Vec::new());

/// Register a network-layer protocol
pub fn register_net_protocol(protocol: NetProtocol) {
    let mut protocols = NET_PROTOCOLS.write();
    if protocols.iter().any(|p| p.net_proto == protocol.net_proto) {
        return;
    }
    protocols.push(protocol);
}

/// Transmit a network-layer packet
///
/// Polls the device to reclaim completions, pushes the link header and
/// hands the frame to the device queue.
pub fn net_tx(
    mut iobuf: IoBuffer,
    dev: &Arc<NetDevice>,
    net_proto: u16,
    ll_dest: MacAddr,
) -> Result<()> {
    dev.poll();
    dev.link.push(&mut iobuf, ll_dest, dev.ll_addr(), net_proto)?;
    dev.tx(iobuf)
}

/// Process one received frame: strip the link header and dispatch on the
/// network protocol
pub fn net_rx(mut iobuf: IoBuffer, dev: &Arc<NetDevice>) -> Result<()> {
    let header = dev.link.pull(&mut iobuf)?;
    let protocols = NET_PROTOCOLS.read().clone();
    for protocol in protocols {
        if protocol.net_proto == header.net_proto {
            return (protocol.rx)(iobuf, dev, header.dest, header.source);
        }
    }
    log::debug!("{} unknown ethertype {:#06x}", dev.name(), header.net_proto);
    Ok(())
}

/// The permanent net-poll process: drivers first, then one RX buffer per
/// device per pass
struct NetPoll;

impl Process for NetPoll {
    fn name(&self) -> &str {
        "net"
    }

    fn step(&self) {
        for dev in net_devices() {
            dev.poll();
            if let Some(iobuf) = dev.rx_dequeue() {
                if let Err(err) = net_rx(iobuf, &dev) {
                    log::debug!("{} rx error: {}", dev.name(), err);
                }
            }
        }
    }
}

static INIT: spin::Once<()> = spin::Once::new();

/// Register the permanent net-poll process
pub fn init() {
    INIT.call_once(|| {
        process::register_process(Arc::new(NetPoll));
    });
}

// ============================================================================
// Test driver
// ============================================================================

/// A software loopback driver for tests: transmitted frames complete
/// immediately and can be captured or reflected into the RX queue
#[derive(Default)]
pub struct MockDevice {
    /// Captured outbound frames
    pub sent: Mutex<VecDeque<Vec<u8>>>,
}

impl MockDevice {
    pub fn create() -> (Arc<MockDevice>, Arc<NetDevice>) {
        Self::create_with_mac(MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]))
    }

    pub fn create_with_mac(mac: MacAddr) -> (Arc<MockDevice>, Arc<NetDevice>) {
        let mock = Arc::new(MockDevice::default());
        let dev = NetDevice::register(Box::new(MockOps(mock.clone())), mac, 1500);
        (mock, dev)
    }

    /// Pop the oldest captured frame
    pub fn pop_sent(&self) -> Option<Vec<u8>> {
        self.sent.lock().pop_front()
    }
}

struct MockOps(Arc<MockDevice>);

impl NetDeviceOps for MockOps {
    fn open(&self, _dev: &NetDevice) -> Result<()> {
        Ok(())
    }

    fn close(&self, _dev: &NetDevice) {}

    fn transmit(&self, _dev: &NetDevice, iobuf: &IoBuffer) -> Result<()> {
        self.0.sent.lock().push_back(iobuf.as_ref().to_vec());
        Ok(())
    }

    fn poll(&self, _dev: &NetDevice) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_and_tx() {
        let (mock, dev) = MockDevice::create();
        assert!(!dev.is_open());
        assert_eq!(dev.tx(IoBuffer::from_slice(b"x")).err(), Some(Error::NetUnreachable));

        dev.open().unwrap();
        dev.link_up();
        dev.tx(IoBuffer::from_slice(b"frame")).unwrap();
        assert_eq!(mock.pop_sent().unwrap(), b"frame");
        assert_eq!(dev.tx_stats().good, 1);
        assert_eq!(dev.tx_stats().bad, 1);

        NetDevice::unregister(&dev);
        assert!(find_netdev(dev.name()).is_none());
    }

    #[test]
    fn rx_queue_round_trip() {
        let (_mock, dev) = MockDevice::create();
        dev.rx_enqueue(IoBuffer::from_slice(b"incoming"));
        let iob = dev.rx_dequeue().unwrap();
        assert_eq!(iob.as_ref(), b"incoming");
        assert!(dev.rx_dequeue().is_none());
        NetDevice::unregister(&dev);
    }
}
