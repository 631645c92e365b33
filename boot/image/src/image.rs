//! # Image Objects and Registry
//!
//! An image is a named blob of fetched data plus the type that probing
//! assigned to it. The registry holds every fetched image: secondary
//! images become Multiboot modules or initrds for whichever loader runs
//! first.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::job::MonoJob;
use cinder_kernel::open::open_uri;
use cinder_kernel::ticks::TICKS_PER_SEC;
use cinder_kernel::uri::Uri;

/// One prepared memory write of a boot plan
#[derive(Debug, Clone)]
pub struct Segment {
    /// Physical destination address
    pub dest: u64,
    /// Bytes to place there
    pub data: Vec<u8>,
    /// Total size to reserve (the tail beyond `data` is zeroed)
    pub memsz: u64,
}

/// The outcome of `exec`: everything the platform needs to transfer
/// control
#[derive(Debug, Clone, Default)]
pub struct BootPlan {
    /// Entry point address
    pub entry: u64,
    /// Memory image to commit before jumping
    pub segments: Vec<Segment>,
    /// Value for the boot-info register (Multiboot: 0x2BADB002 in EAX)
    pub register_a: Option<u32>,
    /// Address of the boot information structure (Multiboot: EBX)
    pub info_addr: Option<u64>,
}

/// A registered image format
pub struct ImageType {
    pub name: &'static str,
    /// Inspect the image data; `Ok` claims the image
    pub probe: fn(&Image) -> Result<()>,
    /// Build the boot plan
    pub exec: fn(&Image) -> Result<BootPlan>,
}

/// A fetched (or embedded) image
pub struct Image {
    name: String,
    pub uri: Option<Uri>,
    pub cmdline: Mutex<Option<String>>,
    data: Mutex<Vec<u8>>,
    image_type: Mutex<Option<&'static ImageType>>,
}

impl Image {
    pub fn new(name: &str, data: Vec<u8>) -> Arc<Image> {
        Arc::new(Image {
            name: name.to_string(),
            uri: None,
            cmdline: Mutex::new(None),
            data: Mutex::new(data),
            image_type: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the image data
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Run `f` over the image data without copying
    pub fn with_data<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.data.lock())
    }

    /// The probed type, if probing has happened
    pub fn image_type(&self) -> Option<&'static ImageType> {
        *self.image_type.lock()
    }

    /// Probe against the registered types; first match wins
    pub fn probe(&self) -> Result<&'static ImageType> {
        if let Some(found) = self.image_type() {
            return Ok(found);
        }
        let types = IMAGE_TYPES.read();
        for image_type in types.iter() {
            if (image_type.probe)(self).is_ok() {
                *self.image_type.lock() = Some(image_type);
                log::info!("{} is a {} image", self.name, image_type.name);
                return Ok(image_type);
            }
        }
        Err(Error::NoExec)
    }

    /// Probe (if needed) and build the boot plan
    pub fn exec(&self) -> Result<BootPlan> {
        let image_type = self.probe()?;
        shutdown_boot();
        (image_type.exec)(self)
    }
}

impl core::fmt::Debug for Image {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

static IMAGE_TYPES: RwLock<Vec<&'static ImageType>> = RwLock::new(Vec::new());
static IMAGES: RwLock<Vec<Arc<Image>>> = RwLock::new(Vec::new());

/// Register an image format
pub fn register_image_type(image_type: &'static ImageType) {
    IMAGE_TYPES.write().push(image_type);
}

/// Register a fetched image
pub fn register_image(image: Arc<Image>) {
    IMAGES.write().retain(|i| i.name != image.name);
    IMAGES.write().push(image);
}

/// Remove an image by name
pub fn unregister_image(name: &str) -> Result<()> {
    let mut images = IMAGES.write();
    let before = images.len();
    images.retain(|i| i.name != name);
    if images.len() == before {
        return Err(Error::NoSuchEntity);
    }
    Ok(())
}

/// Find an image by name
pub fn find_image(name: &str) -> Option<Arc<Image>> {
    IMAGES.read().iter().find(|i| i.name == name).cloned()
}

/// All registered images, registration order
pub fn images() -> Vec<Arc<Image>> {
    IMAGES.read().clone()
}

/// Close every net device and undo platform hooks before jumping
pub fn shutdown_boot() {
    for dev in cinder_net::netdev::net_devices() {
        dev.close();
    }
}

// ============================================================================
// Fetching
// ============================================================================

/// Sink streaming a download into an image's data
struct Download {
    image: Arc<Image>,
    job: Arc<MonoJob>,
}

impl XferTarget for Download {
    fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()> {
        let mut data = self.image.data.lock();
        match meta.offset {
            Some(offset) => {
                let offset = offset as usize;
                let end = offset + iobuf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset..end].copy_from_slice(iobuf.as_ref());
            }
            None => data.extend_from_slice(iobuf.as_ref()),
        }
        Ok(())
    }

    fn close(&self, rc: Result<()>) {
        cinder_kernel::job::JobTarget::close(&*self.job, rc);
    }
}

/// Name an image after the final path component of its URI
fn image_name(uri: &Uri) -> String {
    uri.path
        .as_deref()
        .and_then(|p| p.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("image")
        .to_string()
}

/// Fetch a URI into a registered image (blocking)
pub fn fetch_uri(uri: &Uri, deadline: Option<u64>) -> Result<Arc<Image>> {
    let image = Arc::new(Image {
        name: image_name(uri),
        uri: Some(uri.clone()),
        cmdline: Mutex::new(None),
        data: Mutex::new(Vec::new()),
        image_type: Mutex::new(None),
    });
    let job = MonoJob::new();
    let download = Arc::new(Download {
        image: image.clone(),
        job: job.clone(),
    });
    let upstream = open_uri(uri, download)?;
    let rc = job.wait(deadline.or(Some(300 * TICKS_PER_SEC)));
    if let Err(err) = rc {
        upstream.close(Err(Error::Cancelled));
        return Err(err);
    }
    register_image(image.clone());
    log::info!("fetched {} ({} bytes)", image.name(), image.len());
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    static NEVER: ImageType = ImageType {
        name: "never",
        probe: |_| Err(Error::NoExec),
        exec: |_| Err(Error::NoExec),
    };

    static MARKER: ImageType = ImageType {
        name: "marker",
        probe: |image| {
            image.with_data(|d| {
                if d.starts_with(b"MARK") {
                    Ok(())
                } else {
                    Err(Error::NoExec)
                }
            })
        },
        exec: |_| {
            Ok(BootPlan {
                entry: 0x1000,
                ..Default::default()
            })
        },
    };

    #[test]
    fn first_matching_probe_wins() {
        register_image_type(&NEVER);
        register_image_type(&MARKER);
        let image = Image::new("probe-test", b"MARKdata".to_vec());
        let found = image.probe().unwrap();
        assert_eq!(found.name, "marker");
        // Cached on second probe
        assert_eq!(image.probe().unwrap().name, "marker");
    }

    #[test]
    fn unprobeable_image_is_noexec() {
        let image = Image::new("garbage", b"\xde\xad".to_vec());
        assert_eq!(image.probe().err(), Some(Error::NoExec));
    }

    #[test]
    fn registry_replaces_same_name() {
        let a = Image::new("dup-test", b"a".to_vec());
        let b = Image::new("dup-test", b"bb".to_vec());
        register_image(a);
        register_image(b);
        assert_eq!(find_image("dup-test").unwrap().len(), 2);
        unregister_image("dup-test").unwrap();
        assert!(find_image("dup-test").is_none());
    }

    #[test]
    fn download_sink_handles_offsets() {
        let image = Image::new("dl", Vec::new());
        let download = Download {
            image: image.clone(),
            job: MonoJob::new(),
        };
        let meta = XferMeta {
            offset: Some(4),
            ..Default::default()
        };
        download
            .deliver(IoBuffer::from_slice(b"tail"), &meta)
            .unwrap();
        let meta = XferMeta {
            offset: Some(0),
            ..Default::default()
        };
        download
            .deliver(IoBuffer::from_slice(b"head"), &meta)
            .unwrap();
        assert_eq!(image.data(), b"headtail");
    }
}
