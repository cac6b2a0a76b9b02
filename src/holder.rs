//! Per-transaction attribute state shared by both validation phases.

use std::fmt;
use std::net::IpAddr;

use hickory_proto::rr::RecordType;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::warn;

use crate::attr::{
    self, AttrType, AttributeAssignment, ATTR_ADDRESS, ATTR_DNS_QTYPE,
    ATTR_DOMAIN_NAME, ATTR_POLICY_ACTION, ATTR_SOURCE_IP, ATTR_TYPE, TYPE_QUERY, TYPE_RESPONSE,
};
use crate::error::PepError;
use crate::pdp::{Effect, PdpResponse};

/// Fixed request header: type, domain, qtype, source ip.
pub const HEADER_LEN: usize = 4;
const SOURCE_IP_INDEX: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    Allow,
    Log,
    Refuse,
    Block,
    Drop,
    Redirect,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Allow => "allow",
            Action::Log => "log",
            Action::Refuse => "refuse",
            Action::Block => "block",
            Action::Drop => "drop",
            Action::Redirect => "redirect",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an obligation attribute is routed after a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Categories(u8);

impl Categories {
    pub const EDNS: Categories = Categories(1);
    pub const TRANSFER: Categories = Categories(1 << 1);
    pub const DNSTAP: Categories = Categories(1 << 2);
    pub const METRICS: Categories = Categories(1 << 3);

    pub fn contains(self, other: Categories) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Categories) {
        self.0 |= other.0;
    }

    pub fn parse(names: &[String]) -> Result<Self, PepError> {
        let mut out = Categories::default();
        for name in names {
            let cat = match name.to_ascii_lowercase().as_str() {
                "edns" => Categories::EDNS,
                "transfer" => Categories::TRANSFER,
                "dnstap" => Categories::DNSTAP,
                "metrics" => Categories::METRICS,
                other => {
                    return Err(PepError::Config(format!("unknown attribute category {other:?}")));
                }
            };
            out.insert(cat);
        }
        Ok(out)
    }
}

pub type CategoryTable = FxHashMap<String, Categories>;

/// Pulls one metadata label into a typed request attribute.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Extractor {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub ty: AttrType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Domain,
    Address,
}

/// 每个 DNS 事务一个，只由处理该事务的任务修改
/// One per DNS transaction, owned by the task handling it.
#[derive(Debug, Clone)]
pub struct AttrHolder {
    domain_name: String,
    request_domain: Vec<AttributeAssignment>,
    response_domain: Vec<AttributeAssignment>,
    request_address: Vec<AttributeAssignment>,
    response_address: Vec<AttributeAssignment>,
    transfer: Vec<AttributeAssignment>,
    dnstap: Vec<AttributeAssignment>,
    action: Action,
    redirect_target: Option<String>,
}

impl AttrHolder {
    /// Build the phase-1 request: fixed header, then every extracted metadata
    /// attribute not already present in the tail.
    pub fn new(
        qname: &str,
        qtype: RecordType,
        source_ip: IpAddr,
        extractors: &[Extractor],
        metadata: &FxHashMap<String, String>,
    ) -> Result<Self, PepError> {
        let domain_name = qname.trim_end_matches('.').to_ascii_lowercase();
        let mut request_domain = Vec::with_capacity(HEADER_LEN + extractors.len());
        request_domain.push(AttributeAssignment::string(ATTR_TYPE, TYPE_QUERY));
        request_domain.push(AttributeAssignment::domain(ATTR_DOMAIN_NAME, &domain_name));
        request_domain.push(AttributeAssignment::string(ATTR_DNS_QTYPE, qtype.to_string()));
        request_domain.push(AttributeAssignment::address(ATTR_SOURCE_IP, source_ip));

        let mut holder = Self {
            domain_name,
            request_domain,
            response_domain: Vec::new(),
            request_address: Vec::new(),
            response_address: Vec::new(),
            transfer: Vec::new(),
            dnstap: Vec::new(),
            action: Action::None,
            redirect_target: None,
        };

        for ex in extractors {
            let Some(text) = metadata.get(&ex.label) else {
                continue;
            };
            let assignment = AttributeAssignment::parse(ex.name.clone(), ex.ty, text)?;
            if assignment.id == ATTR_SOURCE_IP {
                holder.request_domain[SOURCE_IP_INDEX] = assignment;
            } else {
                holder.push_tail(assignment);
            }
        }
        Ok(holder)
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_target.as_deref()
    }

    pub fn request_domain(&self) -> &[AttributeAssignment] {
        &self.request_domain
    }

    /// EDNS/metadata derived attributes after the fixed header.
    pub fn tail(&self) -> &[AttributeAssignment] {
        &self.request_domain[HEADER_LEN..]
    }

    pub fn response_domain(&self) -> &[AttributeAssignment] {
        &self.response_domain
    }

    pub fn request_address(&self) -> &[AttributeAssignment] {
        &self.request_address
    }

    pub fn response_address(&self) -> &[AttributeAssignment] {
        &self.response_address
    }

    pub fn transfer(&self) -> &[AttributeAssignment] {
        &self.transfer
    }

    pub fn dnstap(&self) -> &[AttributeAssignment] {
        &self.dnstap
    }

    /// Append to the tail unless the id is already there. Returns whether it was added.
    fn push_tail(&mut self, a: AttributeAssignment) -> bool {
        if self.tail().iter().any(|t| t.id == a.id) {
            return false;
        }
        self.request_domain.push(a);
        true
    }

    pub fn add_domain_response(&mut self, resp: PdpResponse, categories: &CategoryTable) {
        self.response_domain = self.apply_response(resp, categories, Phase::Domain);
    }

    /// Start phase 2 for a resolved address, carrying the transfer attributes.
    pub fn add_address_request(&mut self, ip: IpAddr) {
        let mut attrs = Vec::with_capacity(2 + self.transfer.len());
        attrs.push(AttributeAssignment::string(ATTR_TYPE, TYPE_RESPONSE));
        attrs.push(AttributeAssignment::address(ATTR_ADDRESS, ip));
        attrs.extend(self.transfer().iter().cloned());
        self.request_address = attrs;
    }

    pub fn add_address_response(&mut self, resp: PdpResponse, categories: &CategoryTable) {
        self.response_address = self.apply_response(resp, categories, Phase::Address);
    }

    /// Resolve the action and route obligations. Returns the obligations kept
    /// as response attributes.
    fn apply_response(
        &mut self,
        resp: PdpResponse,
        categories: &CategoryTable,
        phase: Phase,
    ) -> Vec<AttributeAssignment> {
        match resp.effect {
            Effect::Indeterminate => {
                warn!(
                    event = "pdp_indeterminate",
                    qname = %self.domain_name,
                    phase = ?phase,
                    status = resp.status.as_deref().unwrap_or("-"),
                    "indeterminate policy decision"
                );
                self.action = Action::None;
                self.redirect_target = None;
                return Vec::new();
            }
            Effect::Permit => {
                let log = resp.obligations.iter().any(|o| o.id == attr::OBLIGATION_LOG);
                // Log sticks until a deny overrides it.
                self.action = if log || self.action == Action::Log {
                    Action::Log
                } else {
                    Action::Allow
                };
            }
            Effect::Deny => self.resolve_deny(&resp.obligations),
        }

        let mut kept = Vec::with_capacity(resp.obligations.len());
        for o in resp.obligations {
            let cat = categories.get(&o.id).copied().unwrap_or_default();
            if cat.contains(Categories::TRANSFER) {
                self.transfer.push(o.clone());
            }
            if cat.contains(Categories::DNSTAP) {
                self.dnstap.push(o.clone());
            }
            if phase == Phase::Domain && cat.contains(Categories::EDNS) {
                self.push_tail(o);
                continue;
            }
            kept.push(o);
        }
        kept
    }

    /// Deny: drop beats refuse beats redirect beats plain block.
    fn resolve_deny(&mut self, obligations: &[AttributeAssignment]) {
        let has = |id: &str| obligations.iter().any(|o| o.id == id);
        self.redirect_target = None;
        self.action = if has(attr::OBLIGATION_DROP) {
            Action::Drop
        } else if has(attr::OBLIGATION_REFUSE) {
            Action::Refuse
        } else if let Some(target) = obligations.iter().find(|o| o.id == attr::OBLIGATION_REDIRECT) {
            self.redirect_target = Some(target.value.to_string());
            Action::Redirect
        } else {
            Action::Block
        };
    }

    /// Request attributes that feed the attribute gauge.
    pub fn metric_attrs<'a>(
        &'a self,
        categories: &'a CategoryTable,
    ) -> impl Iterator<Item = &'a AttributeAssignment> + 'a {
        self.request_domain.iter().filter(move |a| {
            categories
                .get(&a.id)
                .is_some_and(|c| c.contains(Categories::METRICS))
        })
    }

    /// Flat `(id, value)` list for the audit sink.
    pub fn audit_attrs(&self) -> Vec<(String, String)> {
        match self.action {
            Action::Block | Action::Refuse | Action::Drop | Action::Redirect => {
                let mut out: Vec<(String, String)> = self
                    .request_domain
                    .iter()
                    .chain(self.response_domain())
                    .chain(self.request_address())
                    .chain(self.response_address())
                    .chain(self.dnstap())
                    .map(AttributeAssignment::flatten)
                    .collect();
                out.push((ATTR_POLICY_ACTION.to_string(), self.action.to_string()));
                out
            }
            Action::None | Action::Allow | Action::Log => self
                .tail()
                .iter()
                .chain(self.dnstap())
                .map(AttributeAssignment::flatten)
                .collect(),
        }
    }

    /// `key=value` lines describing the attribute state, for debug answers.
    pub fn describe(&self) -> Vec<String> {
        self.request_domain
            .iter()
            .chain(self.response_domain())
            .chain(self.request_address())
            .chain(self.response_address())
            .map(|a| format!("{}={}", a.id, a.value))
            .collect()
    }
}
