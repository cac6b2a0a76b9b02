mod attr;
mod audit;
mod config;
mod counter;
mod edns0;
mod engine;
mod error;
mod gauge;
mod holder;
mod metrics;
mod pdp;
mod proto_utils;
mod resolver;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use clap::Parser;
use prometheus::Registry;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_runtime;
use crate::engine::Engine;
use crate::gauge::AttrGauge;
use crate::metrics::{PrometheusSink, bind_metrics, serve_metrics};
use crate::pdp::HttpPolicyClient;
use crate::resolver::UpstreamResolver;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS policy enforcement point backed by an external decision service", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/pep.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 输出日志
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    let cfg = load_runtime(&args.config).context("load initial config")?;
    let bind_udp: SocketAddr = cfg.settings.bind_udp.parse().context("parse udp bind addr")?;
    let bind_tcp: SocketAddr = cfg.settings.bind_tcp.parse().context("parse tcp bind addr")?;
    let upstream: SocketAddr = cfg.settings.upstream.parse().context("parse upstream addr")?;
    let metrics_addr: Option<SocketAddr> = cfg
        .settings
        .metrics_addr
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()
        .context("parse metrics addr")?;

    // 全局属性计量：进程内唯一，由 main 启停
    let registry = Arc::new(Registry::new());
    let sink = PrometheusSink::new(&registry).context("register gauge metrics")?;
    let gauge = AttrGauge::new(&cfg.gauge, Arc::new(sink));
    for name in cfg.metric_attr_names() {
        gauge.register(name);
    }
    gauge.start();

    let pdp = HttpPolicyClient::new(cfg.pdp.endpoints.clone(), cfg.pdp_timeout())
        .context("build pdp client")?;
    let resolver = UpstreamResolver::new(upstream, cfg.upstream_timeout(), cfg.settings.udp_pool_size)
        .context("build upstream resolver")?;

    let runtime = Arc::new(ArcSwap::from_pointee(cfg));
    let engine = Engine::new(runtime.clone(), Arc::new(pdp), Arc::new(resolver), gauge.clone());

    watcher::spawn(args.config.clone(), runtime.clone(), gauge.clone());

    if let Some(addr) = metrics_addr {
        let server = bind_metrics(addr)?;
        let registry = Arc::clone(&registry);
        // tiny_http 为阻塞式，放在独立线程
        std::thread::spawn(move || serve_metrics(server, registry));
    }

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    if cfg!(unix) {
        // SO_REUSEPORT: one socket per worker, the kernel spreads datagrams
        for worker_id in 0..udp_workers {
            let std_socket = create_udp_socket(bind_udp, true)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            tokio::spawn(run_udp_worker(worker_id, socket, engine.clone()));
        }
    } else {
        let std_socket = create_udp_socket(bind_udp, false).context("create udp socket")?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        for worker_id in 0..udp_workers {
            tokio::spawn(run_udp_worker(worker_id, Arc::clone(&socket), engine.clone()));
        }
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    });

    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, upstream = %upstream, udp_workers, "pep dns server started");

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!(
        total_requests = engine.metrics_total_requests.load(Ordering::Relaxed),
        inflight = engine.metrics_inflight.load(Ordering::Relaxed),
        gauge = ?gauge.state(),
        "shutting down"
    );
    gauge.stop().await;
    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(false))
            .init();
    }
}

fn create_udp_socket(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        set_reuse_port(&socket);
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

// Set via libc so it does not depend on socket2 feature flags. Failure is non-fatal.
#[cfg(unix)]
fn set_reuse_port(socket: &Socket) {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use std::os::unix::io::AsRawFd;

    let val: c_int = 1;
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        debug!("SO_REUSEPORT not available: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &Socket) {}

/// 每个数据报一个任务 / One task per datagram; the receive loop never waits on policy.
async fn run_udp_worker(worker_id: usize, socket: Arc<UdpSocket>, engine: Engine) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                debug!(worker_id, error = %err, "udp recv error");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(resp) = engine.serve(&packet, peer).await {
                let _ = socket.send_to(&resp, peer).await;
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, engine).await {
                debug!(client_ip = %peer.ip(), error = %err, "tcp connection closed");
            }
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        // Dropped transactions write nothing; the client times out as it would over UDP.
        let Some(resp) = engine.serve(&buf, peer).await else {
            continue;
        };
        let Ok(len) = u16::try_from(resp.len()) else {
            continue;
        };
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}
