//! Command-line parsing: tokenisation, `${setting[:type]}` expansion and
//! `&&` / `||` sequencing.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use cinder_settings::types::{find_setting, SettingType};
use cinder_settings::{root_settings, Setting, Tag};

/// How a command connects to the one after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// Unconditional
    Always,
    /// Run only if the previous command succeeded
    OnSuccess,
    /// Run only if the previous command failed
    OnFailure,
}

/// Expand `${name}` and `${name:type}` against the settings tree
///
/// Unknown settings expand to the empty string.
pub fn expand(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let spec = &after[..end];
                out.push_str(&expand_setting(spec));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    // The status of the previous command
    if out.contains("$?") {
        out = out.replace("$?", &crate::commands::last_status().to_string());
    }
    out
}

fn expand_setting(spec: &str) -> String {
    let (name, type_override) = match spec.split_once(':') {
        Some((name, ty)) => (name, SettingType::by_name(ty)),
        None => (spec, None),
    };
    let setting = match find_setting(name) {
        Some(mut setting) => {
            if let Some(ty) = type_override {
                setting.ty = ty;
            }
            setting
        }
        None => {
            // Allow numeric tags: ${67} or ${175.189}
            let Some(tag) = parse_tag(name) else {
                return String::new();
            };
            Setting {
                name: "",
                tag,
                ty: type_override.unwrap_or(SettingType::String),
            }
        }
    };
    root_settings().fetch_typed(&setting).unwrap_or_default()
}

fn parse_tag(name: &str) -> Option<Tag> {
    match name.split_once('.') {
        Some((encap, inner)) => Some(Tag::encap(encap.parse().ok()?, inner.parse().ok()?)),
        None => Some(Tag::new(name.parse().ok()?)),
    }
}

/// Split a line into whitespace-separated tokens, honouring quotes
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(core::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Split a line into `(connector, command-text)` segments at `&&` / `||`
pub fn split_chain(line: &str) -> Vec<(Connector, String)> {
    let mut segments = Vec::new();
    let mut connector = Connector::Always;
    let mut rest = line;
    loop {
        let and = rest.find("&&");
        let or = rest.find("||");
        let (split_at, next_connector) = match (and, or) {
            (Some(a), Some(o)) if a < o => (Some(a), Connector::OnSuccess),
            (Some(a), None) => (Some(a), Connector::OnSuccess),
            (_, Some(o)) => (Some(o), Connector::OnFailure),
            (None, None) => (None, Connector::Always),
        };
        match split_at {
            Some(at) => {
                segments.push((connector, rest[..at].trim().into()));
                connector = next_connector;
                rest = &rest[at + 2..];
            }
            None => {
                let text = rest.trim();
                if !text.is_empty() || !segments.is_empty() {
                    segments.push((connector, text.into()));
                }
                return segments;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_settings::tag;

    #[test]
    fn tokenizer_handles_quotes() {
        assert_eq!(tokenize("echo hello world"), ["echo", "hello", "world"]);
        assert_eq!(tokenize("set a \"b c\" d"), ["set", "a", "b c", "d"]);
        assert_eq!(tokenize("  spaced   out  "), ["spaced", "out"]);
        assert_eq!(tokenize("say 'it all'"), ["say", "it all"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn chain_splitting() {
        let chain = split_chain("dhcp && chain http://x/y || echo failed");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], (Connector::Always, "dhcp".into()));
        assert_eq!(chain[1], (Connector::OnSuccess, "chain http://x/y".into()));
        assert_eq!(chain[2], (Connector::OnFailure, "echo failed".into()));
    }

    #[test]
    fn expansion_from_settings() {
        let _guard = crate::TEST_MUTEX.lock();
        let root = root_settings();
        root.store(tag::BOOTFILE_NAME, Some(b"http://boot/x")).unwrap();
        assert_eq!(expand("chain ${filename}"), "chain http://boot/x");
        assert_eq!(expand("none ${no-such-setting} here"), "none  here");
        assert_eq!(expand("${67}"), "http://boot/x");
        root.store(tag::BOOTFILE_NAME, None).unwrap();
    }

    #[test]
    fn expansion_with_type_override() {
        let _guard = crate::TEST_MUTEX.lock();
        let root = root_settings();
        root.store(tag::ROUTERS, Some(&[10, 0, 2, 2])).unwrap();
        assert_eq!(expand("${gateway}"), "10.0.2.2");
        assert_eq!(expand("${gateway:hex}"), "0a:00:02:02");
        root.store(tag::ROUTERS, None).unwrap();
    }

    #[test]
    fn unterminated_expansion_passes_through() {
        assert_eq!(expand("echo ${oops"), "echo ${oops");
    }
}
