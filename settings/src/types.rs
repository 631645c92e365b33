//! Typed parsing and formatting of setting values.
//!
//! A setting's type drives how its raw bytes convert to and from text:
//! `set gateway:ipv4 10.0.2.2` encodes four bytes, `show gateway` formats
//! them back. Numeric types are stored big-endian at their natural width.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::net::{Ipv4Addr, Ipv6Addr};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::{base64, hex};

use crate::tag::{self, Tag};

/// Value type of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    String,
    Uint8,
    Uint16,
    Uint32,
    Ipv4,
    Ipv6,
    Hex,
    Uuid,
    Base64,
}

impl SettingType {
    /// Look up a type by its name as used in `name:type` syntax
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => SettingType::String,
            "uint8" | "int8" => SettingType::Uint8,
            "uint16" | "int16" => SettingType::Uint16,
            "uint32" | "int32" => SettingType::Uint32,
            "ipv4" => SettingType::Ipv4,
            "ipv6" => SettingType::Ipv6,
            "hex" => SettingType::Hex,
            "uuid" => SettingType::Uuid,
            "base64" => SettingType::Base64,
            _ => return None,
        })
    }

    /// Format raw setting bytes as text
    pub fn format(self, raw: &[u8]) -> String {
        match self {
            SettingType::String => String::from_utf8_lossy(raw).into_owned(),
            SettingType::Uint8 | SettingType::Uint16 | SettingType::Uint32 => {
                let mut value: u64 = 0;
                for &byte in raw.iter().take(8) {
                    value = (value << 8) | u64::from(byte);
                }
                value.to_string()
            }
            SettingType::Ipv4 => match raw {
                [a, b, c, d, ..] => Ipv4Addr::new(*a, *b, *c, *d).to_string(),
                _ => String::new(),
            },
            SettingType::Ipv6 => {
                if raw.len() >= 16 {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&raw[..16]);
                    Ipv6Addr::from(octets).to_string()
                } else {
                    String::new()
                }
            }
            SettingType::Hex => hex::encode(raw, ":"),
            SettingType::Uuid => {
                if raw.len() >= 16 {
                    format!(
                        "{}-{}-{}-{}-{}",
                        hex::encode(&raw[0..4], ""),
                        hex::encode(&raw[4..6], ""),
                        hex::encode(&raw[6..8], ""),
                        hex::encode(&raw[8..10], ""),
                        hex::encode(&raw[10..16], "")
                    )
                } else {
                    String::new()
                }
            }
            SettingType::Base64 => base64::encode(raw),
        }
    }

    /// Parse text into raw setting bytes
    pub fn parse(self, text: &str) -> Result<Vec<u8>> {
        match self {
            SettingType::String => Ok(text.as_bytes().to_vec()),
            SettingType::Uint8 => {
                let v: u8 = parse_int(text)?;
                Ok(alloc::vec![v])
            }
            SettingType::Uint16 => {
                let v: u16 = parse_int(text)?;
                Ok(v.to_be_bytes().to_vec())
            }
            SettingType::Uint32 => {
                let v: u32 = parse_int(text)?;
                Ok(v.to_be_bytes().to_vec())
            }
            SettingType::Ipv4 => {
                let addr: Ipv4Addr = text.parse().map_err(|_| Error::InvalidArgument)?;
                Ok(addr.octets().to_vec())
            }
            SettingType::Ipv6 => {
                let addr: Ipv6Addr = text.parse().map_err(|_| Error::InvalidArgument)?;
                Ok(addr.octets().to_vec())
            }
            SettingType::Hex => hex::decode(text),
            SettingType::Uuid => {
                let packed: String = text.chars().filter(|&c| c != '-').collect();
                let raw = hex::decode(&packed)?;
                if raw.len() != 16 {
                    return Err(Error::InvalidArgument);
                }
                Ok(raw)
            }
            SettingType::Base64 => base64::decode(text),
        }
    }
}

fn parse_int<T: TryFrom<u64>>(text: &str) -> Result<T> {
    let value = if let Some(hex_text) = text.strip_prefix("0x") {
        u64::from_str_radix(hex_text, 16)
    } else {
        text.parse()
    }
    .map_err(|_| Error::InvalidArgument)?;
    T::try_from(value).map_err(|_| Error::InvalidArgument)
}

/// A named setting: symbolic name, tag, and value type
#[derive(Debug, Clone, Copy)]
pub struct Setting {
    pub name: &'static str,
    pub tag: Tag,
    pub ty: SettingType,
}

/// Predefined settings addressable by name
pub const KNOWN_SETTINGS: &[Setting] = &[
    Setting { name: "ip", tag: tag::EB_YIADDR, ty: SettingType::Ipv4 },
    Setting { name: "netmask", tag: tag::SUBNET_MASK, ty: SettingType::Ipv4 },
    Setting { name: "gateway", tag: tag::ROUTERS, ty: SettingType::Ipv4 },
    Setting { name: "dns", tag: tag::DNS_SERVERS, ty: SettingType::Ipv4 },
    Setting { name: "domain", tag: tag::DOMAIN_NAME, ty: SettingType::String },
    Setting { name: "hostname", tag: tag::HOST_NAME, ty: SettingType::String },
    Setting { name: "filename", tag: tag::BOOTFILE_NAME, ty: SettingType::String },
    Setting { name: "next-server", tag: tag::EB_SIADDR, ty: SettingType::Ipv4 },
    Setting { name: "root-path", tag: tag::ROOT_PATH, ty: SettingType::String },
    Setting { name: "lease-time", tag: tag::LEASE_TIME, ty: SettingType::Uint32 },
    Setting { name: "initiator-iqn", tag: tag::ISCSI_INITIATOR_IQN, ty: SettingType::String },
    Setting { name: "username", tag: tag::EB_USERNAME, ty: SettingType::String },
    Setting { name: "password", tag: tag::EB_PASSWORD, ty: SettingType::String },
    Setting { name: "san-drive", tag: tag::EB_BIOS_DRIVE, ty: SettingType::Uint8 },
    Setting { name: "bus-id", tag: tag::EB_BUS_ID, ty: SettingType::Hex },
    Setting { name: "priority", tag: tag::EB_PRIORITY, ty: SettingType::Uint8 },
];

/// Find a predefined setting by name
pub fn find_setting(name: &str) -> Option<Setting> {
    KNOWN_SETTINGS.iter().find(|s| s.name == name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_round_trip() {
        let raw = SettingType::Uint32.parse("3600").unwrap();
        assert_eq!(raw, [0, 0, 0x0e, 0x10]);
        assert_eq!(SettingType::Uint32.format(&raw), "3600");
        assert_eq!(SettingType::Uint8.parse("0x80").unwrap(), [0x80]);
    }

    #[test]
    fn ipv4_round_trip() {
        let raw = SettingType::Ipv4.parse("10.0.2.15").unwrap();
        assert_eq!(raw, [10, 0, 2, 15]);
        assert_eq!(SettingType::Ipv4.format(&raw), "10.0.2.15");
    }

    #[test]
    fn uuid_formatting() {
        let raw: Vec<u8> = (0u8..16).collect();
        let text = SettingType::Uuid.format(&raw);
        assert_eq!(text, "00010203-0405-0607-0809-0a0b0c0d0e0f");
        assert_eq!(SettingType::Uuid.parse(&text).unwrap(), raw);
    }

    #[test]
    fn known_setting_lookup() {
        let s = find_setting("filename").unwrap();
        assert_eq!(s.tag, tag::BOOTFILE_NAME);
        assert!(find_setting("no-such").is_none());
    }
}
