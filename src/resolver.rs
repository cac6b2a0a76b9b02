//! 下游解析器 / Downstream DNS exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::PepError;
use crate::proto_utils::is_truncated;

#[async_trait]
pub trait Downstream: Send + Sync {
    /// Send a wire-format query and return the wire-format answer.
    async fn exchange(&self, query: &[u8]) -> Result<Bytes, PepError>;
}

type Pending = DashMap<u16, (u16, oneshot::Sender<Bytes>)>;

struct UdpSocketState {
    socket: Arc<UdpSocket>,
    // Key: 改写后的 ID / rewritten id. Value: (原始 ID / original id, 等待者 / waiter)
    inflight: Arc<Pending>,
    next_id: AtomicU16,
}

/// UDP 套接字池 + TC 位时的 TCP 重试 / Pooled UDP with TCP retry on truncation.
pub struct UpstreamResolver {
    upstream: SocketAddr,
    timeout: Duration,
    pool: Vec<UdpSocketState>,
    next_idx: AtomicUsize,
}

impl UpstreamResolver {
    /// Must be called inside a tokio runtime: every pooled socket gets a receive task.
    pub fn new(upstream: SocketAddr, timeout_dur: Duration, pool_size: usize) -> anyhow::Result<Self> {
        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let socket = Arc::new(bind_udp(upstream)?);
            let inflight: Arc<Pending> = Arc::new(DashMap::new());
            tokio::spawn(recv_loop(Arc::clone(&socket), Arc::clone(&inflight), upstream));
            pool.push(UdpSocketState {
                socket,
                inflight,
                next_id: AtomicU16::new(rand_seed()),
            });
        }
        Ok(Self {
            upstream,
            timeout: timeout_dur,
            pool,
            next_idx: AtomicUsize::new(0),
        })
    }

    async fn exchange_udp(&self, query: &[u8]) -> Result<Bytes, PepError> {
        if query.len() < 2 {
            return Err(PepError::Protocol("query too short".into()));
        }
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let state = &self.pool[idx];
        let original_id = u16::from_be_bytes([query[0], query[1]]);

        // Find a free ID
        let mut attempts = 0;
        let new_id = loop {
            let id = state.next_id.fetch_add(1, Ordering::Relaxed);
            if !state.inflight.contains_key(&id) {
                break id;
            }
            attempts += 1;
            if attempts > 100 {
                warn!(socket_idx = idx, inflight = state.inflight.len(), "udp pool exhausted");
                return Err(PepError::Downstream("udp pool exhausted".into()));
            }
        };

        let (tx, rx) = oneshot::channel();
        state.inflight.insert(new_id, (original_id, tx));

        let mut packet = query.to_vec();
        packet[..2].copy_from_slice(&new_id.to_be_bytes());
        if let Err(e) = state.socket.send_to(&packet, self.upstream).await {
            state.inflight.remove(&new_id);
            return Err(PepError::Downstream(e.to_string()));
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(PepError::Downstream("channel closed".into())),
            Err(_) => {
                state.inflight.remove(&new_id);
                Err(PepError::Downstream(format!("upstream {} timeout", self.upstream)))
            }
        }
    }

    async fn exchange_tcp(&self, query: &[u8]) -> Result<Bytes, PepError> {
        let fut = async {
            let mut stream = TcpStream::connect(self.upstream).await?;
            let len = u16::try_from(query.len())
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large"))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(query).await?;
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(Bytes::from(buf))
        };
        match timeout(self.timeout, fut).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(PepError::Downstream(e.to_string())),
            Err(_) => Err(PepError::Downstream(format!("upstream {} tcp timeout", self.upstream))),
        }
    }
}

#[async_trait]
impl Downstream for UpstreamResolver {
    async fn exchange(&self, query: &[u8]) -> Result<Bytes, PepError> {
        let start = std::time::Instant::now();
        let resp = self.exchange_udp(query).await?;
        let resp = if is_truncated(&resp) {
            debug!(upstream = %self.upstream, "truncated udp answer, retrying over tcp");
            self.exchange_tcp(query).await?
        } else {
            resp
        };
        debug!(upstream = %self.upstream, upstream_ns = start.elapsed().as_nanos() as u64, "upstream call latency");
        Ok(resp)
    }
}

fn bind_udp(upstream: SocketAddr) -> anyhow::Result<UdpSocket> {
    let (domain, local): (Domain, SocketAddr) = if upstream.is_ipv4() {
        (Domain::IPV4, SocketAddr::from(([0, 0, 0, 0], 0)))
    } else {
        (Domain::IPV6, SocketAddr::from(([0u16; 8], 0)))
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    // Set buffer sizes to 4MB to prevent packet loss under load
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.bind(&local.into()).context("bind")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    UdpSocket::from_std(socket.into()).context("from_std")
}

async fn recv_loop(socket: Arc<UdpSocket>, inflight: Arc<Pending>, upstream: SocketAddr) {
    let mut buf = [0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if len < 2 || src != upstream {
                    continue;
                }
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                if let Some((_, (original_id, tx))) = inflight.remove(&id) {
                    // Restore original ID
                    let mut resp = buf[..len].to_vec();
                    resp[..2].copy_from_slice(&original_id.to_be_bytes());
                    let _ = tx.send(Bytes::from(resp));
                }
            }
            Err(e) => {
                error!("UDP pool recv error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn rand_seed() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos ^ (nanos >> 16)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answers every datagram with the same bytes, QR set, and optionally TC set.
    async fn spawn_udp_echo(truncate: bool) -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = sock.recv_from(&mut buf).await {
                let mut resp = buf[..len].to_vec();
                resp[2] |= 0x80;
                if truncate {
                    resp[2] |= 0x02;
                }
                let _ = sock.send_to(&resp, peer).await;
            }
        });
        addr
    }

    fn query(id: u16) -> Vec<u8> {
        let mut q = vec![0u8; 12];
        q[..2].copy_from_slice(&id.to_be_bytes());
        q.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
        q
    }

    #[tokio::test]
    async fn udp_exchange_restores_transaction_id() {
        let addr = spawn_udp_echo(false).await;
        let resolver = UpstreamResolver::new(addr, Duration::from_secs(1), 2).unwrap();
        for id in [0x0102u16, 0xbeef, 7] {
            let resp = resolver.exchange(&query(id)).await.unwrap();
            assert_eq!(u16::from_be_bytes([resp[0], resp[1]]), id);
            assert_eq!(&resp[12..], &query(id)[12..]);
        }
    }

    #[tokio::test]
    async fn truncated_answer_retries_over_tcp() {
        let addr = spawn_udp_echo(true).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut len = [0u8; 2];
                stream.read_exact(&mut len).await.unwrap();
                let mut q = vec![0u8; u16::from_be_bytes(len) as usize];
                stream.read_exact(&mut q).await.unwrap();
                q[2] |= 0x80;
                q[3] = 0x03; // NXDOMAIN marks the tcp path
                stream.write_all(&len).await.unwrap();
                stream.write_all(&q).await.unwrap();
            }
        });

        let resolver = UpstreamResolver::new(addr, Duration::from_secs(1), 1).unwrap();
        let resp = resolver.exchange(&query(42)).await.unwrap();
        assert!(!is_truncated(&resp));
        assert_eq!(resp[3] & 0x0f, 3);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let resolver = UpstreamResolver::new(addr, Duration::from_millis(50), 1).unwrap();
        let err = resolver.exchange(&query(1)).await.unwrap_err();
        assert!(matches!(err, PepError::Downstream(_)));
        drop(silent);
    }
}
