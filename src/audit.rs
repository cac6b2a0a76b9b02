//! 审计记录 / Structured audit records on the `audit` tracing target.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{info, warn};

use crate::holder::{Action, AttrHolder};

#[derive(Serialize)]
struct AuditAttr<'a> {
    id: &'a str,
    value: &'a str,
}

/// Whether a transaction that ended with `action` gets an audit record.
pub fn should_audit(action: Action, log_all_permits: bool) -> bool {
    match action {
        Action::Log | Action::Block | Action::Refuse | Action::Drop | Action::Redirect => true,
        Action::Allow => log_all_permits,
        Action::None => false,
    }
}

/// JSON array of `{"id", "value"}` objects in holder order.
pub fn encode(holder: &AttrHolder) -> serde_json::Result<String> {
    let attrs = holder.audit_attrs();
    let records: Vec<AuditAttr<'_>> = attrs
        .iter()
        .map(|(id, value)| AuditAttr { id, value })
        .collect();
    serde_json::to_string(&records)
}

pub fn record(holder: &AttrHolder, client_ip: IpAddr) {
    match encode(holder) {
        Ok(attrs) => info!(
            target: "audit",
            qname = %holder.domain_name(),
            client_ip = %client_ip,
            action = %holder.action(),
            attrs = %attrs,
            "policy audit"
        ),
        Err(err) => warn!(target: "audit", error = %err, "audit encoding failed"),
    }
}
