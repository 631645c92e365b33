//! # Settings Block Tree
//!
//! Settings blocks form a tree rooted at the global block. Lookup walks a
//! block's own storage first, then its children ordered by priority (lowest
//! number first) and registration order, so a tag present in several blocks
//! resolves to exactly one value.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Lazy, Mutex, RwLock};

use cinder_kernel::error::{Error, Result};

use crate::dhcpopts::DhcpOptions;
use crate::tag::Tag;
use crate::types::{Setting, SettingType};

/// A node in the settings tree
pub struct SettingsBlock {
    name: String,
    priority: i32,
    storage: Mutex<DhcpOptions>,
    children: RwLock<Vec<Arc<SettingsBlock>>>,
}

impl SettingsBlock {
    /// Create a detached block
    pub fn new(name: &str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            storage: Mutex::new(DhcpOptions::new()),
            children: RwLock::new(Vec::new()),
        })
    }

    /// Create a detached block prepopulated from a DHCP options image
    pub fn from_options(name: &str, priority: i32, options: DhcpOptions) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            storage: Mutex::new(options),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Store a raw value into this block (deleting on `None`)
    pub fn store(&self, tag: Tag, data: Option<&[u8]>) -> Result<()> {
        self.storage.lock().store(tag, data)
    }

    /// Fetch a raw value from this block or, failing that, its children
    pub fn fetch(&self, tag: Tag) -> Option<Vec<u8>> {
        if let Some(value) = self.storage.lock().fetch(tag) {
            return Some(value);
        }
        let mut children: Vec<Arc<SettingsBlock>> = self.children.read().clone();
        children.sort_by_key(|c| c.priority);
        children.iter().find_map(|child| child.fetch(tag))
    }

    /// Replace this block's entire storage
    pub fn replace(&self, options: DhcpOptions) {
        *self.storage.lock() = options;
    }

    /// Remove all values stored directly in this block
    pub fn clear(&self) {
        *self.storage.lock() = DhcpOptions::new();
    }

    /// Store a typed value parsed from text
    pub fn store_typed(&self, setting: &Setting, text: &str) -> Result<()> {
        let raw = setting.ty.parse(text)?;
        self.store(setting.tag, Some(&raw))
    }

    /// Fetch a value and format it according to the setting's type
    pub fn fetch_typed(&self, setting: &Setting) -> Option<String> {
        self.fetch(setting.tag).map(|raw| setting.ty.format(&raw))
    }

    /// Fetch a value as an IPv4 address
    pub fn fetch_ipv4(&self, tag: Tag) -> Option<core::net::Ipv4Addr> {
        match self.fetch(tag)?.as_slice() {
            [a, b, c, d, ..] => Some(core::net::Ipv4Addr::new(*a, *b, *c, *d)),
            _ => None,
        }
    }

    /// Fetch a value as a string
    pub fn fetch_string(&self, tag: Tag) -> Option<String> {
        self.fetch(tag)
            .map(|raw| SettingType::String.format(&raw))
    }

    /// Fetch a numeric value (big-endian, any stored width up to 8)
    pub fn fetch_uint(&self, tag: Tag) -> Option<u64> {
        let raw = self.fetch(tag)?;
        let mut value: u64 = 0;
        for &byte in raw.iter().take(8) {
            value = (value << 8) | u64::from(byte);
        }
        Some(value)
    }

    /// Find a direct or indirect child by name
    pub fn find_child(&self, name: &str) -> Option<Arc<SettingsBlock>> {
        let children = self.children.read();
        for child in children.iter() {
            if child.name == name {
                return Some(child.clone());
            }
            if let Some(found) = child.find_child(name) {
                return Some(found);
            }
        }
        None
    }
}

impl core::fmt::Debug for SettingsBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SettingsBlock")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

static ROOT: Lazy<Arc<SettingsBlock>> = Lazy::new(|| SettingsBlock::new("", 0));

/// The global root settings block
pub fn root_settings() -> Arc<SettingsBlock> {
    ROOT.clone()
}

/// Attach a block under a parent (the root if `None`)
pub fn register_settings(block: Arc<SettingsBlock>, parent: Option<&Arc<SettingsBlock>>) {
    let parent = parent.cloned().unwrap_or_else(root_settings);
    log::debug!("settings block {} registered", block.name());
    parent.children.write().push(block);
}

/// Detach a block from its parent
pub fn unregister_settings(block: &Arc<SettingsBlock>) -> Result<()> {
    fn remove(node: &Arc<SettingsBlock>, target: &Arc<SettingsBlock>) -> bool {
        let mut children = node.children.write();
        let before = children.len();
        children.retain(|c| !Arc::ptr_eq(c, target));
        if children.len() != before {
            return true;
        }
        drop(children);
        node.children
            .read()
            .iter()
            .any(|child| remove(child, target))
    }
    if remove(&root_settings(), block) {
        Ok(())
    } else {
        Err(Error::NoSuchEntity)
    }
}

/// Fetch a raw value by walking the whole tree from the root
pub fn fetch_setting(tag: Tag) -> Option<Vec<u8>> {
    root_settings().fetch(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag;

    #[test]
    fn lookup_walks_children_in_priority_order() {
        let parent = SettingsBlock::new("parent-prio", 0);
        let low = SettingsBlock::new("net0", 1);
        let high = SettingsBlock::new("proxy", 2);
        low.store(tag::BOOTFILE_NAME, Some(b"from-net0")).unwrap();
        high.store(tag::BOOTFILE_NAME, Some(b"from-proxy")).unwrap();
        register_settings(high.clone(), Some(&parent));
        register_settings(low.clone(), Some(&parent));
        // Lowest priority number wins regardless of registration order
        assert_eq!(parent.fetch(tag::BOOTFILE_NAME).unwrap(), b"from-net0");
    }

    #[test]
    fn own_storage_shadows_children() {
        let parent = SettingsBlock::new("parent-shadow", 0);
        let child = SettingsBlock::new("child", 1);
        child.store(tag::HOST_NAME, Some(b"child")).unwrap();
        register_settings(child, Some(&parent));
        parent.store(tag::HOST_NAME, Some(b"parent")).unwrap();
        assert_eq!(parent.fetch(tag::HOST_NAME).unwrap(), b"parent");
    }

    #[test]
    fn unregister_detaches() {
        let root = root_settings();
        let block = SettingsBlock::new("transient", 9);
        block.store(tag::ROOT_PATH, Some(b"/x")).unwrap();
        register_settings(block.clone(), None);
        assert_eq!(root.fetch(tag::ROOT_PATH).unwrap(), b"/x");
        unregister_settings(&block).unwrap();
        assert_eq!(root.fetch(tag::ROOT_PATH), None);
        assert_eq!(
            unregister_settings(&block).err(),
            Some(cinder_kernel::Error::NoSuchEntity)
        );
    }

    #[test]
    fn typed_store_fetch() {
        let block = SettingsBlock::new("typed", 0);
        let setting = crate::types::find_setting("gateway").unwrap();
        block.store_typed(&setting, "10.0.2.2").unwrap();
        assert_eq!(block.fetch_typed(&setting).unwrap(), "10.0.2.2");
        assert_eq!(
            block.fetch_ipv4(tag::ROUTERS).unwrap(),
            core::net::Ipv4Addr::new(10, 0, 2, 2)
        );
    }
}
