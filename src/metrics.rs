//! Prometheus export of the attribute gauge.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use tiny_http::{Header, Response, Server};
use tracing::{debug, info, warn};

use crate::gauge::GaugeSink;

pub struct PrometheusSink {
    values: IntGaugeVec,
}

impl PrometheusSink {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let values = IntGaugeVec::new(
            Opts::new(
                "pep_attribute_values",
                "Queries carrying an attribute value within the sliding window",
            ),
            &["attribute", "value"],
        )?;
        registry.register(Box::new(values.clone()))?;
        Ok(Self { values })
    }
}

impl GaugeSink for PrometheusSink {
    fn set(&self, attr: &str, value: &str, count: u64) {
        self.values
            .with_label_values(&[attr, value])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    fn remove(&self, attr: &str, value: &str) {
        let _ = self.values.remove_label_values(&[attr, value]);
    }
}

pub fn encode(registry: &Registry) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .context("encode metrics")?;
    Ok(buf)
}

/// Bind the scrape endpoint. Binding happens before the serving thread starts
/// so a bad address fails startup.
pub fn bind_metrics(addr: SocketAddr) -> anyhow::Result<Server> {
    let server =
        Server::http(addr).map_err(|e| anyhow::anyhow!("bind metrics listener {addr}: {e}"))?;
    info!(target = "metrics", addr = %addr, "metrics endpoint listening");
    Ok(server)
}

/// Blocking accept loop: `/metrics` gets the text exposition of `registry`,
/// anything else a 404.
pub fn serve_metrics(server: Server, registry: Arc<Registry>) {
    for request in server.incoming_requests() {
        if request.url() != "/metrics" {
            let _ = request.respond(Response::empty(404));
            continue;
        }
        let body = match encode(&registry) {
            Ok(body) => body,
            Err(err) => {
                warn!(target = "metrics", error = %err, "metrics encoding failed");
                let _ = request.respond(Response::empty(500));
                continue;
            }
        };
        let mut response = Response::from_data(body);
        let encoder = TextEncoder::new();
        let content_type = encoder.format_type().as_bytes();
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], content_type) {
            response = response.with_header(header);
        }
        if let Err(err) = request.respond(response) {
            debug!(target = "metrics", error = %err, "metrics response failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauge::VALUES_COUNT;

    #[test]
    fn sink_sets_and_removes_series() {
        let registry = Registry::new();
        let sink = PrometheusSink::new(&registry).unwrap();
        sink.set("client_id", "aabb", 7);
        sink.set("client_id", VALUES_COUNT, 1);

        let text = String::from_utf8(encode(&registry).unwrap()).unwrap();
        assert!(text.contains(r#"pep_attribute_values{attribute="client_id",value="aabb"} 7"#));

        sink.remove("client_id", "aabb");
        let text = String::from_utf8(encode(&registry).unwrap()).unwrap();
        assert!(!text.contains(r#"value="aabb""#));
        assert!(text.contains(r#"value="VALUES_COUNT"} 1"#));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = PrometheusSink::new(&registry).unwrap();
        assert!(PrometheusSink::new(&registry).is_err());
    }

    fn scrape(addr: SocketAddr, path: &str) -> String {
        use std::io::{Read, Write};
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn endpoint_serves_text_format() {
        let registry = Arc::new(Registry::new());
        let sink = PrometheusSink::new(&registry).unwrap();
        sink.set("uid", "u1", 2);

        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);
        let server = bind_metrics(addr).unwrap();
        let shared = Arc::clone(&registry);
        std::thread::spawn(move || serve_metrics(server, shared));

        let out = scrape(addr, "/metrics");
        assert!(out.starts_with("HTTP/1.1 200"), "{out}");
        assert!(out.contains("text/plain"));
        assert!(out.contains(r#"pep_attribute_values{attribute="uid",value="u1"} 2"#));

        let out = scrape(addr, "/other");
        assert!(out.starts_with("HTTP/1.1 404"), "{out}");
    }

    #[test]
    fn bind_reports_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let err = bind_metrics(addr).err().expect("bind should fail");
        assert!(err.to_string().contains("bind metrics listener"));
    }
}
