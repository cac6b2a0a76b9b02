use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::info;

use crate::attr::AttrType;
use crate::counter::BUCKET_COUNT;
use crate::edns0::{Edns0Codec, EdnsOptionConfig};
use crate::holder::{Categories, CategoryTable, Extractor};

#[derive(Debug, Clone, Deserialize)]
pub struct PepConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub pdp: PdpSettings,
    /// EDNS0 选项描述，同一 code 可出现多次。
    #[serde(default)]
    pub edns0: Vec<EdnsOptionConfig>,
    /// 属性名 -> 类别列表（edns/transfer/dnstap/metrics）。
    #[serde(default)]
    pub attributes: FxHashMap<String, Vec<String>>,
    /// 从元数据标签提取请求属性。
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    /// 直通域名后缀，不经过策略校验。
    #[serde(default)]
    pub passthrough: Vec<String>,
    #[serde(default)]
    pub gauge: GaugeSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 下游解析器。
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// 下游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// UDP 下游连接池大小。
    #[serde(default = "default_udp_pool_size")]
    pub udp_pool_size: usize,
    /// 调试查询后缀（TXT 查询），为空则关闭。
    #[serde(default)]
    pub debug_query_suffix: Option<String>,
    /// Prometheus 指标监听地址，为空则不启动。
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// 允许的请求也写审计记录。
    #[serde(default)]
    pub log_all_permits: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            udp_pool_size: default_udp_pool_size(),
            debug_query_suffix: None,
            metrics_addr: None,
            log_all_permits: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PdpSettings {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_pdp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PdpSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_ms: default_pdp_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GaugeSettings {
    /// 统计窗口（时间单位个数）。
    #[serde(default = "default_gauge_window")]
    pub window: u64,
    /// 时间单位长度（毫秒）。
    #[serde(default = "default_gauge_unit_ms")]
    pub unit_ms: u64,
    /// 淘汰与发布周期（毫秒）。
    #[serde(default = "default_gauge_tick_ms")]
    pub tick_ms: u64,
    /// 入队缓冲，满时丢弃并计为错误。
    #[serde(default = "default_gauge_queue_size")]
    pub queue_size: usize,
}

impl Default for GaugeSettings {
    fn default() -> Self {
        Self {
            window: default_gauge_window(),
            unit_ms: default_gauge_unit_ms(),
            tick_ms: default_gauge_tick_ms(),
            queue_size: default_gauge_queue_size(),
        }
    }
}

impl GaugeSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.unit_ms == 0 || self.tick_ms == 0 || self.window == 0 || self.queue_size == 0 {
            anyhow::bail!("gauge window, unit_ms, tick_ms and queue_size must be positive");
        }
        // Increments between two ticks must still land inside the ring.
        let tick_units = self.tick_ms.div_ceil(self.unit_ms);
        if self.window + tick_units >= BUCKET_COUNT {
            anyhow::bail!(
                "gauge window {} plus one tick ({} units) must stay below {} units",
                self.window,
                tick_units,
                BUCKET_COUNT
            );
        }
        Ok(())
    }
}

/// 编译后的运行时配置 / Validated, compiled configuration shared by all requests.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: GlobalSettings,
    pub pdp: PdpSettings,
    pub gauge: GaugeSettings,
    pub edns: Edns0Codec,
    pub categories: CategoryTable,
    pub extractors: Vec<Extractor>,
    /// Lowercase, no leading or trailing dots.
    pub passthrough: Vec<String>,
    pub debug_suffix: Option<String>,
}

impl RuntimeConfig {
    pub fn from_config(cfg: PepConfig) -> Result<Self> {
        let edns = Edns0Codec::from_config(&cfg.edns0).context("compile edns0 options")?;

        let mut categories = CategoryTable::default();
        for (name, cats) in &cfg.attributes {
            let parsed = Categories::parse(cats).with_context(|| format!("attribute {name}"))?;
            categories.insert(name.clone(), parsed);
        }

        // EDNS0 值默认以 string 属性暴露，除非已有提取器声明同名标签。
        let mut extractors = cfg.extractors.clone();
        for opt in &cfg.edns0 {
            if !extractors.iter().any(|e| e.label == opt.name) {
                extractors.push(Extractor {
                    name: opt.name.clone(),
                    label: opt.name.clone(),
                    ty: AttrType::String,
                });
            }
        }

        cfg.gauge.validate()?;

        let passthrough = cfg
            .passthrough
            .iter()
            .map(|s| normalize_suffix(s))
            .filter(|s| !s.is_empty())
            .collect();
        let debug_suffix = cfg
            .settings
            .debug_query_suffix
            .as_deref()
            .map(normalize_suffix)
            .filter(|s| !s.is_empty());

        Ok(Self {
            settings: cfg.settings,
            pdp: cfg.pdp,
            gauge: cfg.gauge,
            edns,
            categories,
            extractors,
            passthrough,
            debug_suffix,
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.upstream_timeout_ms)
    }

    pub fn pdp_timeout(&self) -> Duration {
        Duration::from_millis(self.pdp.timeout_ms)
    }

    /// `qname` equals a passthrough suffix or is below one.
    pub fn is_passthrough(&self, qname: &str) -> bool {
        let qname = qname.trim_end_matches('.');
        self.passthrough.iter().any(|s| is_subdomain(qname, s))
    }

    /// Strip the debug suffix; `None` when this is not a debug query.
    pub fn strip_debug_suffix<'a>(&self, qname: &'a str) -> Option<&'a str> {
        let suffix = self.debug_suffix.as_deref()?;
        let qname = qname.trim_end_matches('.');
        let rest = qname.strip_suffix(suffix)?.strip_suffix('.')?;
        (!rest.is_empty()).then_some(rest)
    }

    /// Names of attributes tracked by the gauge.
    pub fn metric_attr_names(&self) -> impl Iterator<Item = &str> {
        self.categories
            .iter()
            .filter(|(_, c)| c.contains(Categories::METRICS))
            .map(|(n, _)| n.as_str())
    }
}

fn normalize_suffix(s: &str) -> String {
    s.trim_matches('.').to_ascii_lowercase()
}

fn is_subdomain(qname: &str, suffix: &str) -> bool {
    let (q, s) = (qname.as_bytes(), suffix.as_bytes());
    if q.len() < s.len() || !q[q.len() - s.len()..].eq_ignore_ascii_case(s) {
        return false;
    }
    q.len() == s.len() || q[q.len() - s.len() - 1] == b'.'
}

pub fn load_config(path: &Path) -> Result<PepConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: PepConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }
    Ok(cfg)
}

/// Read and compile in one step.
pub fn load_runtime(path: &Path) -> Result<RuntimeConfig> {
    RuntimeConfig::from_config(load_config(path)?)
        .with_context(|| format!("compile config file: {}", path.display()))
}


fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_udp_pool_size() -> usize {
    16
}

fn default_pdp_timeout_ms() -> u64 {
    500
}

fn default_gauge_window() -> u64 {
    60
}

fn default_gauge_unit_ms() -> u64 {
    1000
}

fn default_gauge_tick_ms() -> u64 {
    1000
}

fn default_gauge_queue_size() -> usize {
    4096
}
