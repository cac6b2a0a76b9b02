use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{self, RuntimeConfig};
use crate::gauge::AttrGauge;

const RELOAD_RETRIES: u32 = 3;

pub fn spawn(path: PathBuf, runtime: Arc<ArcSwap<RuntimeConfig>>, gauge: AttrGauge) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, runtime, gauge) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(
    path: PathBuf,
    runtime: Arc<ArcSwap<RuntimeConfig>>,
    gauge: AttrGauge,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &runtime, &gauge),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Reload with a short retry for truncate-then-write races. A config that
/// never compiles leaves the running one in place.
fn reload(path: &Path, runtime: &ArcSwap<RuntimeConfig>, gauge: &AttrGauge) {
    let mut attempt = 1;
    loop {
        match config::load_runtime(path) {
            Ok(new_cfg) => {
                apply(runtime, gauge, new_cfg);
                info!(target = "watcher", path = %path.display(), "config reloaded");
                return;
            }
            Err(err) if attempt >= RELOAD_RETRIES => {
                warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                return;
            }
            Err(_) => {
                attempt += 1;
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Swap in `new_cfg`, registering metric attributes the gauge has not seen.
fn apply(runtime: &ArcSwap<RuntimeConfig>, gauge: &AttrGauge, new_cfg: RuntimeConfig) {
    for name in new_cfg.metric_attr_names() {
        gauge.register(name);
    }
    runtime.store(Arc::new(new_cfg));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GaugeSettings, PepConfig};
    use crate::gauge::GaugeSink;
    use serde_json::json;

    struct NullSink;

    impl GaugeSink for NullSink {
        fn set(&self, _attr: &str, _value: &str, _count: u64) {}
        fn remove(&self, _attr: &str, _value: &str) {}
    }

    fn runtime(raw: serde_json::Value) -> RuntimeConfig {
        let cfg: PepConfig = serde_json::from_value(raw).unwrap();
        RuntimeConfig::from_config(cfg).unwrap()
    }

    fn temp_config(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("pepdns-{}-{name}.json", std::process::id()));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn reload_swaps_valid_config() {
        let shared = ArcSwap::from_pointee(runtime(json!({})));
        let gauge = AttrGauge::new(&GaugeSettings::default(), Arc::new(NullSink));
        let path = temp_config(
            "valid",
            r#"{ "passthrough": ["corp.example"], "attributes": { "uid": ["metrics"] } }"#,
        );

        reload(&path, &shared, &gauge);
        assert!(shared.load().is_passthrough("www.corp.example"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn broken_config_keeps_previous() {
        let shared = ArcSwap::from_pointee(runtime(json!({ "passthrough": ["old.example"] })));
        let gauge = AttrGauge::new(&GaugeSettings::default(), Arc::new(NullSink));
        let path = temp_config("broken", r#"{ "gauge": { "window": 100 } }"#);

        reload(&path, &shared, &gauge);
        assert!(shared.load().is_passthrough("old.example"));
        let _ = std::fs::remove_file(path);
    }
}
