use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::audit;
use crate::config::RuntimeConfig;
use crate::error::PepError;
use crate::gauge::AttrGauge;
use crate::holder::{Action, AttrHolder};
use crate::pdp::PolicyClient;
use crate::proto_utils::parse_quick;
use crate::resolver::Downstream;

const SYNTH_TTL: u32 = 300;
const DNS_HEADER_LEN: usize = 12;
const TXT_CHUNK: usize = 255;

/// 事务结果：应答或静默丢弃 / A reply to write, or nothing at all.
#[derive(Debug)]
pub enum Outcome {
    Reply(Bytes),
    Drop,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<ArcSwap<RuntimeConfig>>,
    pdp: Arc<dyn PolicyClient>,
    downstream: Arc<dyn Downstream>,
    gauge: AttrGauge,
    // Runtime metrics for diagnosing concurrency / 运行时指标，用于诊断并发
    pub metrics_inflight: Arc<AtomicUsize>,
    pub metrics_total_requests: Arc<AtomicU64>,
}

/// 下游解析结果 / What happened to the downstream lookup.
enum Resolution {
    /// Phase 1 ended the transaction.
    Skipped,
    Resolved {
        answer: Bytes,
        address: Option<IpAddr>,
    },
    Failed(PepError),
}

struct Transaction {
    domain_action: Action,
    resolution: Resolution,
}

/// Question section as seen by the quick parser.
struct Question {
    id: u16,
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
    recursion_desired: bool,
}

impl Engine {
    pub fn new(
        config: Arc<ArcSwap<RuntimeConfig>>,
        pdp: Arc<dyn PolicyClient>,
        downstream: Arc<dyn Downstream>,
        gauge: AttrGauge,
    ) -> Self {
        Self {
            config,
            pdp,
            downstream,
            gauge,
            metrics_inflight: Arc::new(AtomicUsize::new(0)),
            metrics_total_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run one transaction and map every failure to SERVFAIL. `None` means
    /// nothing is written back.
    pub async fn serve(&self, packet: &[u8], peer: SocketAddr) -> Option<Bytes> {
        match self.handle_packet(packet, peer).await {
            Ok(Outcome::Reply(resp)) => Some(resp),
            Ok(Outcome::Drop) => None,
            Err(err) => {
                warn!(event = "dns_error", client_ip = %peer.ip(), error = %err, "transaction failed");
                servfail(packet)
            }
        }
    }

    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<Outcome, PepError> {
        struct InflightGuard(Arc<AtomicUsize>);
        impl Drop for InflightGuard {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.metrics_total_requests.fetch_add(1, Ordering::Relaxed);
        self.metrics_inflight.fetch_add(1, Ordering::Relaxed);
        let _inflight_guard = InflightGuard(Arc::clone(&self.metrics_inflight));

        let start = Instant::now();
        let cfg = self.config.load_full();
        let question = Question::parse(packet)
            .ok_or_else(|| PepError::Protocol("no parsable question".into()))?;

        if question.qtype == RecordType::TXT {
            if let Some(target) = cfg.strip_debug_suffix(&question.name) {
                let lines = self.debug_trace(&cfg, target, &question, peer, packet).await?;
                let answers = txt_answers(&question, lines)?;
                return question.reply(ResponseCode::NoError, answers).map(Outcome::Reply);
            }
        }

        if cfg.is_passthrough(&question.name) {
            let answer = self.downstream.exchange(packet).await?;
            debug!(
                event = "passthrough",
                qname = %question.name,
                client_ip = %peer.ip(),
                latency_ms = start.elapsed().as_millis() as u64,
                "passthrough answer"
            );
            return Ok(Outcome::Reply(answer));
        }

        let mut holder = build_holder(&cfg, &question.name, question.qtype, peer, packet)?;
        for attr in holder.metric_attrs(&cfg.categories) {
            self.gauge.inc(attr.clone());
        }

        let tx = self.validate(&cfg, &mut holder, packet).await?;
        if audit::should_audit(holder.action(), cfg.settings.log_all_permits) {
            audit::record(&holder, peer.ip());
        }
        debug!(
            event = "dns_decision",
            qname = %question.name,
            qtype = ?question.qtype,
            client_ip = %peer.ip(),
            query_action = %tx.domain_action,
            action = %holder.action(),
            latency_ms = start.elapsed().as_millis() as u64,
            "policy decision"
        );
        self.finalize(&question, &holder, tx.resolution).await
    }

    /// Phase 1, downstream lookup, then phase 2 on the first A/AAAA answer.
    async fn validate(
        &self,
        cfg: &RuntimeConfig,
        holder: &mut AttrHolder,
        query: &[u8],
    ) -> Result<Transaction, PepError> {
        let resp = self
            .pdp
            .validate(holder.request_domain())
            .await
            .map_err(|e| in_phase(e, "domain"))?;
        holder.add_domain_response(resp, &cfg.categories);
        let domain_action = holder.action();
        if !matches!(domain_action, Action::Allow | Action::Log) {
            return Ok(Transaction {
                domain_action,
                resolution: Resolution::Skipped,
            });
        }

        let answer = match self.downstream.exchange(query).await {
            Ok(answer) => answer,
            Err(err) => {
                return Ok(Transaction {
                    domain_action,
                    resolution: Resolution::Failed(err),
                });
            }
        };

        let address = first_address(&answer);
        if let Some(ip) = address {
            holder.add_address_request(ip);
            let resp = self
                .pdp
                .validate(holder.request_address())
                .await
                .map_err(|e| in_phase(e, "address"))?;
            holder.add_address_response(resp, &cfg.categories);
        }
        Ok(Transaction {
            domain_action,
            resolution: Resolution::Resolved { answer, address },
        })
    }

    async fn finalize(
        &self,
        question: &Question,
        holder: &AttrHolder,
        resolution: Resolution,
    ) -> Result<Outcome, PepError> {
        let resp = match holder.action() {
            Action::Allow | Action::Log => match resolution {
                Resolution::Resolved { answer, .. } => answer,
                Resolution::Failed(err) => return Err(err),
                Resolution::Skipped => {
                    return Err(PepError::Downstream("no downstream answer".into()));
                }
            },
            Action::Block => question.reply(ResponseCode::NXDomain, Vec::new())?,
            Action::Refuse => question.reply(ResponseCode::Refused, Vec::new())?,
            Action::Drop => return Ok(Outcome::Drop),
            Action::Redirect => {
                let target = holder
                    .redirect_target()
                    .ok_or(PepError::InvalidAction(Action::Redirect.as_str()))?;
                self.redirect(question, target).await?
            }
            Action::None => return Err(PepError::InvalidAction(Action::None.as_str())),
        };
        Ok(Outcome::Reply(resp))
    }

    /// Literal addresses answer the matching qtype directly; a name is
    /// resolved downstream and chained behind a CNAME.
    async fn redirect(&self, question: &Question, target: &str) -> Result<Bytes, PepError> {
        if let Ok(ip) = target.parse::<IpAddr>() {
            let owner = question.name()?;
            let answers = match (ip, question.qtype) {
                (IpAddr::V4(v4), RecordType::A) => {
                    vec![Record::from_rdata(owner, SYNTH_TTL, RData::A(A(v4)))]
                }
                (IpAddr::V6(v6), RecordType::AAAA) => {
                    vec![Record::from_rdata(owner, SYNTH_TTL, RData::AAAA(AAAA(v6)))]
                }
                _ => Vec::new(),
            };
            return question.reply(ResponseCode::NoError, answers);
        }

        let target_name = parse_name(target)?;
        let lookup = build_query(question.id, &target_name, question.qtype)?;
        let answer = self.downstream.exchange(&lookup).await?;
        let msg = Message::from_bytes(&answer)?;

        let mut answers = Vec::with_capacity(msg.answers().len() + 1);
        answers.push(Record::from_rdata(
            question.name()?,
            SYNTH_TTL,
            RData::CNAME(CNAME(target_name)),
        ));
        answers.extend(msg.answers().iter().cloned());
        question.reply(msg.response_code(), answers)
    }

    /// 调试查询：以 A 类型重跑事务并描述过程
    /// Debug query: rerun the transaction for `name` as an A lookup and describe it.
    async fn debug_trace(
        &self,
        cfg: &RuntimeConfig,
        name: &str,
        question: &Question,
        peer: SocketAddr,
        packet: &[u8],
    ) -> Result<Vec<String>, PepError> {
        let mut holder = build_holder(cfg, name, RecordType::A, peer, packet)?;
        let lookup = build_query(question.id, &parse_name(name)?, RecordType::A)?;
        let tx = self.validate(cfg, &mut holder, &lookup).await?;

        let resolve = match &tx.resolution {
            Resolution::Skipped => "skip",
            Resolution::Resolved { address: Some(_), .. } => "yes",
            Resolution::Resolved { address: None, .. } => "no",
            Resolution::Failed(_) => "failed",
        };
        let mut lines = vec![
            format!("resolve:{resolve}"),
            format!("query:{}", tx.domain_action),
        ];
        match &tx.resolution {
            Resolution::Resolved { address: Some(_), .. } => {
                lines.push(format!("ip:{}", holder.action()));
            }
            Resolution::Failed(err) => lines.push(format!("error:{err}")),
            _ => {}
        }
        if let Some(target) = holder.redirect_target() {
            lines.push(format!("redirect:{target}"));
        }
        lines.extend(holder.describe());

        debug!(
            event = "debug_query",
            qname = %name,
            client_ip = %peer.ip(),
            action = %holder.action(),
            resolve,
            "debug trace"
        );
        Ok(lines)
    }
}

impl Question {
    fn parse(packet: &[u8]) -> Option<Self> {
        let mut qname_buf = [0u8; 256];
        let q = parse_quick(packet, &mut qname_buf)?;
        Some(Self {
            id: q.tx_id,
            name: q.qname.to_string(),
            qtype: RecordType::from(q.qtype),
            qclass: DNSClass::from(q.qclass),
            recursion_desired: packet.get(2).is_some_and(|flags| flags & 0x01 != 0),
        })
    }

    fn name(&self) -> Result<Name, PepError> {
        parse_name(&self.name)
    }

    fn reply(&self, rcode: ResponseCode, answers: Vec<Record>) -> Result<Bytes, PepError> {
        let mut msg = Message::new();
        msg.set_id(self.id);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(self.recursion_desired);
        msg.set_recursion_available(true);
        msg.set_authoritative(false);
        msg.set_response_code(rcode);

        let mut query = Query::query(self.name()?, self.qtype);
        query.set_query_class(self.qclass);
        msg.add_query(query);
        msg.add_answers(answers);

        let mut out = Vec::with_capacity(512);
        {
            let mut encoder = BinEncoder::new(&mut out);
            msg.emit(&mut encoder)?;
        }
        Ok(Bytes::from(out))
    }
}

fn build_holder(
    cfg: &RuntimeConfig,
    qname: &str,
    qtype: RecordType,
    peer: SocketAddr,
    packet: &[u8],
) -> Result<AttrHolder, PepError> {
    let metadata = if cfg.edns.is_empty() {
        FxHashMap::default()
    } else {
        cfg.edns.decode_packet(packet)
    };
    AttrHolder::new(qname, qtype, peer.ip(), &cfg.extractors, &metadata)
}

fn in_phase(err: PepError, phase: &'static str) -> PepError {
    match err {
        PepError::Pdp { reason, .. } => PepError::pdp(phase, reason),
        other => other,
    }
}

fn parse_name(name: &str) -> Result<Name, PepError> {
    if name.is_empty() {
        return Ok(Name::root());
    }
    Ok(Name::from_str(name)?)
}

fn build_query(id: u16, name: &Name, qtype: RecordType) -> Result<Vec<u8>, PepError> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name.clone(), qtype));
    Ok(msg.to_vec()?)
}

/// First A/AAAA record of the answer section. Unparsable answers have none.
fn first_address(answer: &[u8]) -> Option<IpAddr> {
    let msg = Message::from_bytes(answer).ok()?;
    msg.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}

fn txt_answers(question: &Question, lines: Vec<String>) -> Result<Vec<Record>, PepError> {
    let owner = question.name()?;
    Ok(lines
        .into_iter()
        .map(|line| {
            Record::from_rdata(owner.clone(), 0, RData::TXT(TXT::new(vec![clip(line)])))
        })
        .collect())
}

// TXT character-strings hold at most 255 bytes.
fn clip(mut line: String) -> String {
    if line.len() > TXT_CHUNK {
        let mut end = TXT_CHUNK;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    line
}

/// SERVFAIL for `packet`: with its question when parsable, header-only otherwise.
fn servfail(packet: &[u8]) -> Option<Bytes> {
    if let Some(question) = Question::parse(packet) {
        if let Ok(resp) = question.reply(ResponseCode::ServFail, Vec::new()) {
            return Some(resp);
        }
    }
    let header = packet.get(..DNS_HEADER_LEN)?;
    let mut out = header.to_vec();
    // QR, keep opcode and RD.
    out[2] = 0x80 | (header[2] & 0x79);
    // RA, rcode 2.
    out[3] = 0x80 | 0x02;
    out[4..].fill(0);
    Some(Bytes::from(out))
}
