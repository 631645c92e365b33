//! End-to-end boot flow: DHCP over the real wire codec against a
//! scripted server, then a `chain` through the URI opener framework into
//! the script interpreter.

use std::string::String;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use spin::Mutex;

use cinder_image::fetch_uri;
use cinder_kernel::console::{set_console, Console};
use cinder_kernel::error::Result;
use cinder_kernel::intf::{XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::job::MonoJob;
use cinder_kernel::open::{register_opener, UriOpener};
use cinder_kernel::uri::Uri;
use cinder_net::netdev::{MacAddr, MockDevice};
use cinder_proto::dhcp::DhcpSession;
use cinder_settings::{tag, DhcpOptions};
use cinder_shell::{execute_line, shell_init};

struct Capture(Mutex<String>);

impl Console for Capture {
    fn put(&self, byte: u8) {
        self.0.lock().push(byte as char);
    }

    fn get(&self) -> Option<u8> {
        None
    }
}

/// Opener standing in for the HTTP stack: delivers a canned body
static FETCHES: AtomicUsize = AtomicUsize::new(0);

fn open_canned(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    FETCHES.fetch_add(1, Ordering::Relaxed);
    assert_eq!(uri.host.as_deref(), Some("boot.example.com"));
    let body: &[u8] = b"#!ipxe\necho hi\n";
    receiver
        .deliver(IoBuffer::from_slice(body), &XferMeta::default())
        .unwrap();
    receiver.close(Ok(()));
    struct Null;
    impl XferTarget for Null {
        fn deliver(&self, _iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
            Ok(())
        }
        fn close(&self, _rc: Result<()>) {}
    }
    Ok(Arc::new(Null))
}

const BOOTP_HLEN: usize = 236;
const DHCP_MAGIC: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

fn build_reply(msg_type: u8, xid: u32, mac: [u8; 6], extra: &[(tag::Tag, &[u8])]) -> Vec<u8> {
    let mut out = vec![0u8; BOOTP_HLEN];
    out[0] = 2;
    out[1] = 1;
    out[2] = 6;
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    out[16..20].copy_from_slice(&[10, 0, 2, 15]);
    out[28..34].copy_from_slice(&mac);
    out.extend_from_slice(&DHCP_MAGIC);
    let mut options = DhcpOptions::new();
    options.store(tag::MESSAGE_TYPE, Some(&[msg_type])).unwrap();
    for (t, value) in extra {
        options.store(*t, Some(value)).unwrap();
    }
    out.extend_from_slice(options.as_bytes());
    out.push(255);
    out
}

#[test]
fn dhcp_then_chain() {
    shell_init();
    register_opener(UriOpener {
        scheme: "canned",
        open: open_canned,
    });
    let console = Arc::new(Capture(Mutex::new(String::new())));
    set_console(console.clone());

    let mac = MacAddr([0x52, 0x54, 0x00, 0xe2, 0xe0, 0x01]);
    let (mock, dev) = MockDevice::create_with_mac(mac);
    dev.open().unwrap();
    dev.link_up();

    // Kick off DHCP asynchronously and play the server side from the
    // frames the client actually emits
    let job = MonoJob::new();
    let session = DhcpSession::start(&dev, job.clone()).unwrap();

    // Exactly one DISCOVER
    let discover = mock.pop_sent().expect("DISCOVER on the wire");
    let payload = &discover[42..];
    assert_eq!(payload[0], 1, "BOOTREQUEST");
    let xid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    assert!(mock.pop_sent().is_none(), "only one DISCOVER before the offer");

    let server_options: &[(tag::Tag, &[u8])] = &[
        (tag::SERVER_ID, &[10, 0, 2, 2]),
        (tag::SUBNET_MASK, &[255, 255, 255, 0]),
        (tag::ROUTERS, &[10, 0, 2, 2]),
        (tag::DNS_SERVERS, &[10, 0, 2, 3]),
        (tag::BOOTFILE_NAME, b"canned://boot.example.com/ipxe"),
    ];
    let offer = build_reply(2, xid, mac.0, server_options);
    session
        .deliver(IoBuffer::from_slice(&offer), &XferMeta::default())
        .unwrap();

    // ProxyDHCP linger passes, then exactly one REQUEST
    cinder_kernel::ticks::advance(2 * cinder_kernel::ticks::TICKS_PER_SEC);
    cinder_kernel::process::step_all();
    let request = mock.pop_sent().expect("REQUEST on the wire");
    let request_options = DhcpOptions::from_bytes(&request[42 + BOOTP_HLEN + 4..]);
    assert_eq!(request_options.fetch(tag::MESSAGE_TYPE).unwrap(), [3]);
    assert_eq!(
        request_options.fetch(tag::REQUESTED_ADDR).unwrap(),
        [10, 0, 2, 15]
    );

    let ack = build_reply(5, xid, mac.0, server_options);
    session
        .deliver(IoBuffer::from_slice(&ack), &XferMeta::default())
        .unwrap();
    assert_eq!(job.result(), Some(Ok(())));

    // The lease landed in settings
    assert_eq!(
        dev.settings().fetch_typed(
            &cinder_settings::types::find_setting("ip").unwrap()
        ).as_deref(),
        Some("10.0.2.15")
    );
    let filename = dev.settings().fetch_string(tag::BOOTFILE_NAME).unwrap();

    // chain ${filename}: fetch + probe as a script + run it
    let status = execute_line(&format!("chain {filename}"));
    assert_eq!(status, 0, "chain succeeded");
    assert_eq!(FETCHES.load(Ordering::Relaxed), 1);
    assert!(console.0.lock().contains("hi\n"), "script ran and echoed");

    cinder_net::ipv4::clear_routes();
    cinder_net::netdev::NetDevice::unregister(&dev);
}

#[test]
fn fetch_registers_image() {
    shell_init();
    register_opener(UriOpener {
        scheme: "canned2",
        open: |_uri, receiver| {
            receiver
                .deliver(IoBuffer::from_slice(b"payload"), &XferMeta::default())
                .unwrap();
            receiver.close(Ok(()));
            struct Null;
            impl XferTarget for Null {
                fn deliver(&self, _iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
                    Ok(())
                }
                fn close(&self, _rc: Result<()>) {}
            }
            Ok(Arc::new(Null))
        },
    });
    let image = fetch_uri(&Uri::parse("canned2://h/some-file"), None).unwrap();
    assert_eq!(image.name(), "some-file");
    assert_eq!(image.len(), 7);
    assert!(cinder_image::find_image("some-file").is_some());
}
