//! EDNS0 选项解码 / Typed decoding of EDNS0 option payloads into named metadata.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::PepError;
use crate::proto_utils::edns_options;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdnsDataType {
    Bytes,
    Hex,
    Address,
}

/// Configuration form of one option descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct EdnsOptionConfig {
    /// Option code, decimal or `0x` prefixed hex.
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: EdnsDataType,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdnsDescriptor {
    pub name: String,
    pub data_type: EdnsDataType,
    pub size: usize,
    pub start: usize,
    pub end: usize,
}

impl EdnsDescriptor {
    /// Decode one raw option payload. `None` means the payload does not fit the descriptor.
    pub fn decode(&self, raw: &[u8]) -> Option<String> {
        match self.data_type {
            EdnsDataType::Bytes => Some(String::from_utf8_lossy(raw).into_owned()),
            EdnsDataType::Hex => {
                if self.size > 0 && self.size != raw.len() {
                    return None;
                }
                if self.start >= raw.len() || self.end > raw.len() {
                    return None;
                }
                let end = if self.end == 0 { raw.len() } else { self.end };
                raw.get(self.start..end).map(hex::encode)
            }
            EdnsDataType::Address => parse_ip(raw).map(|ip| ip.to_string()),
        }
    }
}

/// Accepts the textual form first, then 4/16 octet network order addresses.
/// A 16 character IPv6 literal is text, not a binary address.
fn parse_ip(raw: &[u8]) -> Option<IpAddr> {
    if let Some(ip) = std::str::from_utf8(raw).ok().and_then(|s| s.trim().parse().ok()) {
        return Some(ip);
    }
    match raw.len() {
        4 => {
            let b: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(b)))
        }
        16 => {
            let b: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

/// Option code -> descriptors. Several descriptors may share a code.
#[derive(Debug, Clone, Default)]
pub struct Edns0Codec {
    options: FxHashMap<u16, Vec<EdnsDescriptor>>,
}

impl Edns0Codec {
    pub fn from_config(cfg: &[EdnsOptionConfig]) -> Result<Self, PepError> {
        let mut codec = Self::default();
        for opt in cfg {
            let code = parse_code(&opt.code)?;
            if opt.end != 0 && opt.start > opt.end {
                return Err(PepError::Config(format!(
                    "edns0 option {}: start {} is past end {}",
                    opt.name, opt.start, opt.end
                )));
            }
            if opt.size > 0 && opt.end > opt.size {
                return Err(PepError::Config(format!(
                    "edns0 option {}: end {} exceeds size {}",
                    opt.name, opt.end, opt.size
                )));
            }
            codec.insert(
                code,
                EdnsDescriptor {
                    name: opt.name.clone(),
                    data_type: opt.data_type,
                    size: opt.size,
                    start: opt.start,
                    end: opt.end,
                },
            );
        }
        Ok(codec)
    }

    pub fn insert(&mut self, code: u16, descriptor: EdnsDescriptor) {
        self.options.entry(code).or_default().push(descriptor);
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// `(name, value)` for every descriptor of `code` that accepts `raw`.
    pub fn decode<'a>(&'a self, code: u16, raw: &'a [u8]) -> impl Iterator<Item = (&'a str, String)> + 'a {
        self.options
            .get(&code)
            .into_iter()
            .flatten()
            .filter_map(move |d| d.decode(raw).map(|v| (d.name.as_str(), v)))
    }

    /// Decode every option of the packet's OPT record into a label -> value map.
    /// The first option producing a label wins.
    pub fn decode_packet(&self, packet: &[u8]) -> FxHashMap<String, String> {
        let mut meta = FxHashMap::default();
        if self.is_empty() {
            return meta;
        }
        for (code, raw) in edns_options(packet) {
            for (name, value) in self.decode(code, raw) {
                meta.entry(name.to_string()).or_insert(value);
            }
        }
        meta
    }
}

fn parse_code(code: &str) -> Result<u16, PepError> {
    let code = code.trim();
    let parsed = match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => code.parse::<u16>(),
    };
    parsed.map_err(|e| PepError::Config(format!("edns0 option code {code:?}: {e}")))
}
