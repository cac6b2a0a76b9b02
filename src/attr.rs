use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::rr::Name;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::PepError;

pub const ATTR_TYPE: &str = "type";
pub const ATTR_DOMAIN_NAME: &str = "domain_name";
pub const ATTR_DNS_QTYPE: &str = "dns_qtype";
pub const ATTR_SOURCE_IP: &str = "source_ip";
pub const ATTR_ADDRESS: &str = "address";
pub const ATTR_POLICY_ACTION: &str = "policy_action";

pub const TYPE_QUERY: &str = "query";
pub const TYPE_RESPONSE: &str = "response";

pub const OBLIGATION_REDIRECT: &str = "redirect_to";
pub const OBLIGATION_REFUSE: &str = "refuse";
pub const OBLIGATION_DROP: &str = "drop";
pub const OBLIGATION_LOG: &str = "log";

/// 属性的声明类型 / Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    String,
    Boolean,
    Integer,
    Float,
    Address,
    Network,
    Domain,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Address(IpAddr),
    Network(IpNet),
    Domain(String),
}

impl AttrValue {
    /// Parse the textual form of a value as `ty`.
    pub fn parse(ty: AttrType, text: &str) -> Result<Self, PepError> {
        let bad = |reason: String| PepError::Attribute {
            value: text.to_string(),
            ty,
            reason,
        };
        match ty {
            AttrType::String => Ok(AttrValue::String(text.to_string())),
            AttrType::Boolean => text
                .parse::<bool>()
                .map(AttrValue::Boolean)
                .map_err(|e| bad(e.to_string())),
            AttrType::Integer => text
                .parse::<i64>()
                .map(AttrValue::Integer)
                .map_err(|e| bad(e.to_string())),
            AttrType::Float => text
                .parse::<f64>()
                .map(AttrValue::Float)
                .map_err(|e| bad(e.to_string())),
            AttrType::Address => text
                .parse::<IpAddr>()
                .map(AttrValue::Address)
                .map_err(|e| bad(e.to_string())),
            AttrType::Network => text
                .parse::<IpNet>()
                .map(AttrValue::Network)
                .map_err(|e| bad(e.to_string())),
            AttrType::Domain => {
                let trimmed = text.trim_end_matches('.');
                Name::from_str(trimmed).map_err(|e| bad(e.to_string()))?;
                Ok(AttrValue::Domain(trimmed.to_ascii_lowercase()))
            }
        }
    }

    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::String(_) => AttrType::String,
            AttrValue::Boolean(_) => AttrType::Boolean,
            AttrValue::Integer(_) => AttrType::Integer,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Address(_) => AttrType::Address,
            AttrValue::Network(_) => AttrType::Network,
            AttrValue::Domain(_) => AttrType::Domain,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(v) | AttrValue::Domain(v) => f.write_str(v),
            AttrValue::Boolean(v) => write!(f, "{v}"),
            AttrValue::Integer(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Address(v) => write!(f, "{v}"),
            AttrValue::Network(v) => write!(f, "{v}"),
        }
    }
}

/// Wire form used by the decision service: `{"id": .., "type": .., "value": ".."}`.
#[derive(Debug, Serialize, Deserialize)]
struct RawAssignment {
    id: String,
    #[serde(rename = "type")]
    ty: AttrType,
    value: String,
}

/// A single named, typed attribute. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAssignment", into = "RawAssignment")]
pub struct AttributeAssignment {
    pub id: String,
    pub value: AttrValue,
}

impl AttributeAssignment {
    pub fn new(id: impl Into<String>, value: AttrValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn string(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(id, AttrValue::String(value.into()))
    }

    pub fn address(id: impl Into<String>, ip: IpAddr) -> Self {
        Self::new(id, AttrValue::Address(ip))
    }

    pub fn domain(id: impl Into<String>, name: &str) -> Self {
        Self::new(
            id,
            AttrValue::Domain(name.trim_end_matches('.').to_ascii_lowercase()),
        )
    }

    /// Parse `text` as `ty`; any failure is a construction error.
    pub fn parse(id: impl Into<String>, ty: AttrType, text: &str) -> Result<Self, PepError> {
        Ok(Self::new(id, AttrValue::parse(ty, text)?))
    }

    pub fn attr_type(&self) -> AttrType {
        self.value.attr_type()
    }

    /// `(id, value)` pair for audit records.
    pub fn flatten(&self) -> (String, String) {
        (self.id.clone(), self.value.to_string())
    }
}

impl TryFrom<RawAssignment> for AttributeAssignment {
    type Error = PepError;

    fn try_from(raw: RawAssignment) -> Result<Self, Self::Error> {
        AttributeAssignment::parse(raw.id, raw.ty, &raw.value)
    }
}

impl From<AttributeAssignment> for RawAssignment {
    fn from(a: AttributeAssignment) -> Self {
        RawAssignment {
            ty: a.attr_type(),
            value: a.value.to_string(),
            id: a.id,
        }
    }
}
