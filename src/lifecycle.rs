use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;

/// Current settings plus a generation number bumped on every successful
/// reload. Readers compare generations to notice a swap.
pub struct ConfigSlot {
    current: ArcSwap<Config>,
    generation: AtomicU64,
    path: PathBuf,
}

impl ConfigSlot {
    pub fn new(config: Config, path: impl Into<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            generation: AtomicU64::new(0),
            path: path.into(),
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn replace(&self, config: Config) -> u64 {
        self.current.store(Arc::new(config));
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Re-reads and validates the file. On error the previous settings stay
    /// in place.
    pub fn reload(&self) -> Result<u64, ConfigError> {
        let config = Config::load(&self.path)?;
        Ok(self.replace(config))
    }
}

/// Owns the shutdown token and reacts to process signals.
#[derive(Clone)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    settings: Arc<ConfigSlot>,
}

impl Lifecycle {
    pub fn new(settings: Arc<ConfigSlot>) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            settings,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self, reason: &str) {
        if !self.shutdown.is_cancelled() {
            info!("Shutdown requested: {}", reason);
            self.shutdown.cancel();
        }
    }

    pub fn reload(&self) {
        info!("################################################");
        info!("Reloading configuration from {}", self.settings.path().display());
        info!("################################################");

        match self.settings.reload() {
            Ok(generation) => info!("Configuration reloaded (generation {})", generation),
            Err(e) => error!("Configuration reload failed, keeping previous settings: {}", e),
        }
    }

    /// Waits for SIGINT/SIGTERM (shutdown) and SIGHUP (reload) until the
    /// token is cancelled.
    #[cfg(unix)]
    pub async fn watch_signals(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sighup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => (term, hup),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers, only Ctrl-C is handled: {}", e);
                    return self.watch_ctrl_c().await;
                }
            };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::signal::ctrl_c() => {
                    self.request_shutdown("SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    self.request_shutdown("SIGTERM");
                    break;
                }
                _ = sighup.recv() => self.reload(),
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn watch_signals(self) {
        self.watch_ctrl_c().await
    }

    async fn watch_ctrl_c(self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => self.request_shutdown("SIGINT"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) const JSON_PI_TOML: &str = r#"
        [source]
        brokers = "localhost:9092"
        format = "json"

        [target]
        product = "pi"
        publish = "rest"
        tenant_id = "pi-tenant"

        [target.rest]
        protocol = "http"
        host = "collector"
        port = 8080
    "#;

    #[test]
    fn test_reload_swaps_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediator.toml");
        fs::write(&path, JSON_PI_TOML).unwrap();

        let slot = ConfigSlot::new(Config::load(&path).unwrap(), &path);
        assert_eq!(slot.generation(), 0);

        fs::write(&path, JSON_PI_TOML.replace("localhost:9092", "other:9092")).unwrap();
        assert_eq!(slot.reload().unwrap(), 1);
        assert_eq!(slot.generation(), 1);
        assert_eq!(slot.load().source.brokers, "other:9092");
    }

    #[test]
    fn test_failed_reload_keeps_previous_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediator.toml");
        fs::write(&path, JSON_PI_TOML).unwrap();

        let settings = Arc::new(ConfigSlot::new(Config::load(&path).unwrap(), &path));
        let lifecycle = Lifecycle::new(Arc::clone(&settings));

        fs::write(&path, JSON_PI_TOML.replace("product = \"pi\"", "product = \"nope\"")).unwrap();
        lifecycle.reload();

        assert_eq!(settings.generation(), 0);
        assert_eq!(settings.load().target.tenant_id.as_deref(), Some("pi-tenant"));
    }

    #[tokio::test]
    async fn test_request_shutdown_stops_signal_watch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediator.toml");
        fs::write(&path, JSON_PI_TOML).unwrap();

        let settings = Arc::new(ConfigSlot::new(Config::load(&path).unwrap(), &path));
        let lifecycle = Lifecycle::new(Arc::clone(&settings));
        let token = lifecycle.shutdown_token();
        let watcher = tokio::spawn(lifecycle.clone().watch_signals());

        lifecycle.request_shutdown("test");
        assert!(token.is_cancelled());
        watcher.await.unwrap();
    }
}
