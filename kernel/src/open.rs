//! URI opener registry.
//!
//! Application protocols register an opener per URI scheme. Opening a URI
//! creates the protocol connection, plugs its data interface into the
//! caller's receiver, and hands back the connection's upstream endpoint so
//! the caller can deliver request data or cancel.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{Error, Result};
use crate::intf::XferTarget;
use crate::uri::Uri;

/// Opener function: build a connection for `uri` delivering into `receiver`
pub type OpenFn = fn(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>>;

/// A registered URI opener
#[derive(Clone, Copy)]
pub struct UriOpener {
    /// URI scheme this opener serves ("http", "tftp", ...)
    pub scheme: &'static str,
    pub open: OpenFn,
}

static OPENERS: RwLock<Vec<UriOpener>> = RwLock::new(Vec::new());

/// Register an opener for a scheme
pub fn register_opener(opener: UriOpener) {
    log::debug!("URI opener for {} registered", opener.scheme);
    OPENERS.write().push(opener);
}

/// Find the opener for a scheme
pub fn find_opener(scheme: &str) -> Option<UriOpener> {
    OPENERS
        .read()
        .iter()
        .find(|o| o.scheme.eq_ignore_ascii_case(scheme))
        .copied()
}

/// Open a URI, plugging the resulting data source into `receiver`
///
/// Unknown schemes fail with [`Error::NotSupported`] at resolve time.
pub fn open_uri(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    let scheme = uri.scheme.as_deref().ok_or(Error::InvalidArgument)?;
    let opener = find_opener(scheme).ok_or(Error::NotSupported)?;
    log::debug!("opening {}", uri);
    (opener.open)(uri, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intf::XferMeta;
    use crate::iobuf::IoBuffer;

    struct Null;

    impl XferTarget for Null {
        fn deliver(&self, _iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
            Ok(())
        }
        fn close(&self, _rc: Result<()>) {}
    }

    fn open_null(_uri: &Uri, _receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
        Ok(Arc::new(Null))
    }

    #[test]
    fn unknown_scheme_not_supported() {
        let uri = Uri::parse("nosuch://host/x");
        let rc = open_uri(&uri, Arc::new(Null));
        assert_eq!(rc.err(), Some(Error::NotSupported));
    }

    #[test]
    fn registered_scheme_opens() {
        register_opener(UriOpener {
            scheme: "nulltest",
            open: open_null,
        });
        let uri = Uri::parse("nulltest://host/x");
        assert!(open_uri(&uri, Arc::new(Null)).is_ok());
        // Scheme match is case-insensitive
        let uri = Uri::parse("NULLTEST://host/x");
        assert!(open_uri(&uri, Arc::new(Null)).is_ok());
    }
}
