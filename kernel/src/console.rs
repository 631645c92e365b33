//! Byte-oriented console hook.
//!
//! The platform layer installs an implementation; the shell reads keystrokes
//! and writes output through it. A system with no console installed simply
//! discards output.

use alloc::sync::Arc;

use spin::RwLock;

/// A raw byte console
pub trait Console: Send + Sync {
    /// Write one byte of output
    fn put(&self, byte: u8);

    /// Fetch one byte of input, if available
    fn get(&self) -> Option<u8>;
}

static CONSOLE: RwLock<Option<Arc<dyn Console>>> = RwLock::new(None);

/// Install the platform console
pub fn set_console(console: Arc<dyn Console>) {
    *CONSOLE.write() = Some(console);
}

/// Write a string to the console
pub fn console_write(s: &str) {
    if let Some(console) = CONSOLE.read().as_ref() {
        for byte in s.bytes() {
            console.put(byte);
        }
    }
}

/// Write a string followed by a newline
pub fn console_writeln(s: &str) {
    console_write(s);
    console_write("\n");
}

/// Read one byte of console input
pub fn console_getchar() -> Option<u8> {
    CONSOLE.read().as_ref().and_then(|c| c.get())
}
