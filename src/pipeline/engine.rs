// src/pipeline/engine.rs

//! Wires configuration into a running monitoring engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigWatcher;
use crate::error::Result;
use crate::models::Config;
use crate::services::audit::AuditTrail;
use crate::services::classifier::SeverityClassifier;
use crate::services::delivery::{ChannelRouter, StaticPreferences};
use crate::services::detector::ChangeDetector;
use crate::services::dispatcher::NotificationDispatcher;
use crate::services::fetcher::{FetchTarget, Fetcher, HttpTarget};
use crate::services::parser::ParserRegistry;
use crate::storage::{LocalStore, Store};
use crate::utils::retry::RetryPolicy;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::cycle::CycleRunner;
use super::scheduler::Scheduler;

/// Builds an [`Engine`], defaulting every collaborator from configuration.
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    target: Option<Arc<dyn FetchTarget>>,
    router: Option<ChannelRouter>,
    fetch_policy: Option<RetryPolicy>,
    delivery_policy: Option<RetryPolicy>,
    attempt_timeout: Option<Duration>,
    cycle_timeout: Option<Duration>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            target: None,
            router: None,
            fetch_policy: None,
            delivery_policy: None,
            attempt_timeout: None,
            cycle_timeout: None,
        }
    }

    /// Use this store instead of a `LocalStore` under `storage.root_dir`.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this fetch target instead of HTTP.
    pub fn target(mut self, target: Arc<dyn FetchTarget>) -> Self {
        self.target = Some(target);
        self
    }

    /// Use this router instead of the built-in `log` and `webhook` channels.
    pub fn router(mut self, router: ChannelRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn fetch_policy(mut self, policy: RetryPolicy) -> Self {
        self.fetch_policy = Some(policy);
        self
    }

    pub fn delivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.delivery_policy = Some(policy);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = Some(timeout);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(LocalStore::open(&config.storage.root_dir).await?),
        };
        let target: Arc<dyn FetchTarget> = match self.target {
            Some(target) => target,
            None => Arc::new(HttpTarget::new(&config.fetcher)?),
        };
        let router = match self.router {
            Some(router) => router,
            None => ChannelRouter::with_defaults(
                &config.fetcher.user_agent,
                config.notifier.webhook_timeout_secs,
            )?,
        };

        let parsers = ParserRegistry::from_definitions(&config.parsers)?;
        for source in &config.sources {
            if !parsers.contains(&source.parser) {
                log::warn!(
                    "Source '{}' uses unknown parser '{}'",
                    source.id,
                    source.parser
                );
            }
        }
        for recipient in &config.recipients {
            for channel in recipient.channels.iter().filter(|c| !router.contains(c)) {
                log::warn!(
                    "Recipient '{}' uses unknown channel '{}'",
                    recipient.recipient_id,
                    channel
                );
            }
        }

        let mut fetcher = Fetcher::new(&config.fetcher, target, parsers);
        if let Some(policy) = self.fetch_policy {
            fetcher = fetcher.with_policy(policy);
        }
        if let Some(timeout) = self.attempt_timeout {
            fetcher = fetcher.with_attempt_timeout(timeout);
        }

        let preferences = Arc::new(StaticPreferences::new(config.recipients.clone()));
        let mut dispatcher = NotificationDispatcher::new(
            &config.notifier,
            Arc::clone(&store),
            preferences.clone(),
            router,
        );
        if let Some(policy) = self.delivery_policy {
            dispatcher = dispatcher.with_policy(policy);
        }
        let dispatcher = Arc::new(dispatcher);

        let runner = Arc::new(CycleRunner::new(
            Arc::clone(&store),
            fetcher,
            ChangeDetector::new(Arc::clone(&store), &config.detector),
            SeverityClassifier::new(&config.classifier),
            Arc::clone(&dispatcher),
            CircuitBreaker::with_config(CircuitBreakerConfig {
                failure_threshold: config.scheduler.failure_threshold,
            }),
            self.cycle_timeout
                .unwrap_or_else(|| config.scheduler.cycle_timeout()),
        ));
        let scheduler = Arc::new(Scheduler::new(
            &config.scheduler,
            &config.notifier,
            Arc::clone(&runner),
        )?);

        let engine = Engine {
            trail: AuditTrail::new(Arc::clone(&store)),
            reload_interval: Duration::from_secs(config.scheduler.reload_interval_secs.max(1)),
            store,
            preferences,
            dispatcher,
            runner,
            scheduler,
        };
        engine.apply_config(&config).await?;
        engine.dispatcher.restore_pending().await?;
        Ok(engine)
    }
}

/// A wired engine: store, scheduler, dispatcher and audit queries.
pub struct Engine {
    store: Arc<dyn Store>,
    preferences: Arc<StaticPreferences>,
    dispatcher: Arc<NotificationDispatcher>,
    runner: Arc<CycleRunner>,
    scheduler: Arc<Scheduler>,
    trail: AuditTrail,
    reload_interval: Duration,
}

impl Engine {
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn runner(&self) -> &Arc<CycleRunner> {
        &self.runner
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    /// Apply source definitions and recipients from a (re)loaded config.
    ///
    /// Tuning sections take effect on restart only.
    pub async fn apply_config(&self, config: &Config) -> Result<()> {
        let mut ids = HashSet::new();
        for def in &config.sources {
            self.store.register_source(def).await?;
            ids.insert(def.id.clone());
        }
        self.scheduler.set_configured(ids);
        self.preferences.replace(config.recipients.clone()).await;
        log::info!(
            "Applied configuration: {} sources, {} recipients",
            config.sources.len(),
            config.recipients.len()
        );
        Ok(())
    }

    /// Run the scheduler until `shutdown` fires, reloading configuration
    /// edits picked up by `watcher`, then drain in-flight work.
    pub async fn run(&self, shutdown: CancellationToken, watcher: Option<ConfigWatcher>) {
        let scheduler = Arc::clone(&self.scheduler);
        let stop = shutdown.clone();
        let forward = async move {
            stop.cancelled().await;
            scheduler.shutdown_token().cancel();
        };

        tokio::join!(
            forward,
            self.scheduler.run(),
            self.watch(watcher, &shutdown)
        );
        self.scheduler.shutdown().await;
    }

    async fn watch(&self, watcher: Option<ConfigWatcher>, shutdown: &CancellationToken) {
        let Some(mut watcher) = watcher else {
            return;
        };
        let mut interval = tokio::time::interval(self.reload_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match watcher.poll() {
                        Some(Ok(config)) => {
                            if let Err(e) = self.apply_config(&config).await {
                                log::error!("Config reload failed: {}", e);
                            }
                        }
                        Some(Err(e)) => log::error!("Ignoring invalid config edit: {}", e),
                        None => {}
                    }
                }
            }
        }
    }
}
