//! Filter orchestration: rule application, DNS-driven updates and hot reload.
//!
//! A [`Filter`] owns the active configuration and the kernel state compiled
//! from it. Once started, two background threads run alongside the caller:
//!
//! - a DNS refresh loop re-resolving cached domains and pushing the answers
//!   into the matching address sets
//! - a config watch loop reloading the configuration file when it changes
//!
//! Both reach the kernel only through the filter's state lock, so a reload
//! and a set update never interleave.

mod classify;
mod watcher;

pub use classify::{classify, rule_matches_domain, RuleKind};
pub use watcher::ConfigWatcher;

use ahash::AHashSet;
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::compiler::{Compiler, RuleSpec, SetKey};
use crate::config::{Config, Rule, Settings};
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::netfilter::{Netfilter, NftCommand};
use crate::wildcard::is_wildcard;

/// Lifecycle of a [`Filter`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Created => "created",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

struct FilterState {
    lifecycle: Lifecycle,
    config: Arc<Config>,
    compiler: Compiler,
}

struct Shared {
    state: Mutex<FilterState>,
    resolver: Arc<Resolver>,
    config_path: PathBuf,
}

struct Background {
    cancel: Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Egress filter bound to one configuration file.
pub struct Filter {
    shared: Arc<Shared>,
    watch: bool,
    tasks: Mutex<Option<Background>>,
}

impl Filter {
    /// Create a filter from an already validated configuration.
    ///
    /// `config_path` is where reloads read from.
    pub fn new(
        config: Config,
        config_path: impl AsRef<Path>,
        resolver: Arc<Resolver>,
        netfilter: Arc<dyn Netfilter>,
    ) -> Self {
        Self::with_compiler(config, config_path, resolver, Compiler::new(netfilter))
    }

    /// Create a filter driving `nft` with the given runtime settings.
    pub fn from_settings(
        config: Config,
        config_path: impl AsRef<Path>,
        settings: &Settings,
    ) -> Result<Self> {
        let resolver = Arc::new(Resolver::new(&settings.resolver)?);
        let netfilter = Arc::new(NftCommand::new(&settings.nft_path));
        let compiler = Compiler::with_table(netfilter, settings.table.clone());
        Ok(Self::with_compiler(config, config_path, resolver, compiler).with_watch(settings.watch))
    }

    fn with_compiler(
        config: Config,
        config_path: impl AsRef<Path>,
        resolver: Arc<Resolver>,
        compiler: Compiler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FilterState {
                    lifecycle: Lifecycle::Created,
                    config: Arc::new(config),
                    compiler,
                }),
                resolver,
                config_path: config_path.as_ref().to_path_buf(),
            }),
            watch: true,
            tasks: Mutex::new(None),
        }
    }

    /// Enable or disable watching the configuration file. Enabled by default.
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }

    /// The configuration currently applied.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.shared.state.lock().config)
    }

    pub fn config_path(&self) -> &Path {
        &self.shared.config_path
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.shared.resolver
    }

    /// Kernel set name backing a compiled rule or domain sub-rule.
    pub fn set_name(&self, key: &SetKey) -> Option<String> {
        self.shared.state.lock().compiler.set_name(key)
    }

    /// Install the drop-only table, apply every rule, then start the
    /// background loops.
    ///
    /// If any rule fails to reach the kernel the table is left drop-only and
    /// the error is returned.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match state.lifecycle {
                Lifecycle::Created => {}
                Lifecycle::Running => return Err(Error::InvalidState("filter is already running")),
                Lifecycle::Stopped => return Err(Error::InvalidState("filter has been stopped")),
            }

            // Replaces any table left behind by an earlier run.
            state.compiler.reset()?;

            let config = Arc::clone(&state.config);
            let compiled = match apply_rules(&state.compiler, &config, &self.shared.resolver) {
                Ok(compiled) => compiled,
                Err(e) => {
                    if let Err(reset_err) = state.compiler.reset() {
                        log::error!("Failed to clear partially applied rules: {}", reset_err);
                    }
                    return Err(e);
                }
            };

            state.lifecycle = Lifecycle::Running;
            log::info!(
                "Egress filter started: {} rules compiled into {} kernel rules",
                config.rules.len(),
                compiled
            );
        }

        self.spawn_background();
        Ok(())
    }

    /// Stop the background loops and remove all kernel state.
    ///
    /// A filter whose start failed still owns a drop-only table; stopping it
    /// removes that table. Stopping a stopped filter does nothing.
    pub fn stop(&self) -> Result<()> {
        if self.lifecycle() == Lifecycle::Stopped {
            return Ok(());
        }

        if let Some(background) = self.tasks.lock().take() {
            drop(background.cancel);
            for handle in background.handles {
                if handle.join().is_err() {
                    log::error!("Background thread panicked");
                }
            }
        }

        let mut state = self.shared.state.lock();
        if state.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        state.lifecycle = Lifecycle::Stopped;
        state.compiler.cleanup()?;

        log::info!("Egress filter stopped");
        Ok(())
    }

    /// Reread the configuration file and replace the applied rules.
    ///
    /// An unreadable or invalid file leaves the kernel untouched.
    pub fn reload(&self) -> Result<()> {
        self.shared.reload()
    }

    /// Replace the addresses of every compiled sub-rule for `domain`.
    ///
    /// Returns the number of sets updated. Ignored unless running.
    pub fn update_domain_ips(&self, domain: &str, addresses: &[Ipv4Addr]) -> Result<usize> {
        self.shared.update_domain_ips(domain, addresses)
    }

    fn spawn_background(&self) {
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        let mut handles = Vec::with_capacity(2);

        let shared = Arc::clone(&self.shared);
        let rx = cancelled.clone();
        let refresh = thread::Builder::new()
            .name("dns-refresh".to_string())
            .spawn(move || {
                shared.resolver.run_periodic_refresh(&rx, |domain, addresses| {
                    if let Err(e) = shared.update_domain_ips(domain, addresses) {
                        log::warn!("Failed to update addresses for {}: {}", domain, e);
                    }
                });
            });
        match refresh {
            Ok(handle) => handles.push(handle),
            Err(e) => log::error!("Failed to spawn DNS refresh thread: {}", e),
        }

        if self.watch {
            match ConfigWatcher::new(&self.shared.config_path) {
                Ok(watcher) => {
                    let shared = Arc::clone(&self.shared);
                    let watch = thread::Builder::new()
                        .name("config-watch".to_string())
                        .spawn(move || watch_loop(&shared, &watcher, &cancelled));
                    match watch {
                        Ok(handle) => handles.push(handle),
                        Err(e) => log::error!("Failed to spawn config watch thread: {}", e),
                    }
                }
                Err(e) => log::warn!(
                    "Config watch unavailable for {}, continuing without hot reload: {}",
                    self.shared.config_path.display(),
                    e
                ),
            }
        }

        *self.tasks.lock() = Some(Background { cancel, handles });
    }
}

impl Shared {
    fn reload(&self) -> Result<()> {
        let config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                log::error!(
                    "Failed to reload {}, keeping current rules: {}",
                    self.config_path.display(),
                    e
                );
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return Err(Error::InvalidState("filter is not running"));
        }

        state.compiler.reset()?;
        let config = Arc::new(config);
        let previous = std::mem::replace(&mut state.config, Arc::clone(&config));

        match apply_rules(&state.compiler, &config, &self.resolver) {
            Ok(compiled) => {
                log::info!(
                    "Reloaded configuration version {}: {} rules, {} kernel rules",
                    config.version,
                    config.rules.len(),
                    compiled
                );
                self.prune_cache(&config);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to apply reloaded configuration, restoring previous: {}", e);
                state.config = Arc::clone(&previous);
                let restored = state
                    .compiler
                    .reset()
                    .and_then(|_| apply_rules(&state.compiler, &previous, &self.resolver));
                if let Err(restore_err) = restored {
                    log::error!("Failed to restore previous rules: {}", restore_err);
                }
                self.prune_cache(&previous);
                Err(e)
            }
        }
    }

    /// Forget cached domains no rule of `config` resolves any more, so the
    /// refresh loop stops querying them.
    fn prune_cache(&self, config: &Config) {
        let wanted: AHashSet<&str> = config
            .rules
            .iter()
            .flat_map(|rule| rule.egress.domains.iter())
            .map(String::as_str)
            .filter(|domain| !is_wildcard(domain))
            .collect();
        let removed = self.resolver.retain(|domain| wanted.contains(domain));
        if removed > 0 {
            log::debug!("Dropped {} domains from the DNS cache", removed);
        }
    }

    fn update_domain_ips(&self, domain: &str, addresses: &[Ipv4Addr]) -> Result<usize> {
        let state = self.state.lock();
        if state.lifecycle != Lifecycle::Running {
            log::debug!("Ignoring address update for {}: filter {}", domain, state.lifecycle);
            return Ok(0);
        }

        let entries: Vec<String> = addresses.iter().map(ToString::to_string).collect();
        let mut updated = 0;
        for rule in &state.config.rules {
            if !rule_matches_domain(rule, domain) {
                continue;
            }

            let key = SetKey::domain(rule.name.as_str(), domain);
            match state.compiler.update_ips(&key, &entries) {
                Ok(()) => updated += 1,
                Err(Error::SetNotFound(_)) => {
                    log::debug!("No compiled set for {}, skipping", key);
                }
                Err(e) => log::warn!("Failed to update {}: {}", key, e),
            }
        }
        Ok(updated)
    }
}

fn watch_loop(shared: &Shared, watcher: &ConfigWatcher, cancel: &Receiver<()>) {
    loop {
        select! {
            recv(watcher.events()) -> event => {
                if event.is_err() {
                    return;
                }
                let coalesced = watcher.coalesce();
                log::info!(
                    "Configuration change detected ({} events), reloading",
                    coalesced + 1
                );
                // Failures are logged by reload and the previous rules stay active.
                let _ = shared.reload();
            }
            recv(cancel) -> _ => {
                log::debug!("Config watch stopped");
                return;
            }
        }
    }
}

/// Compile every rule of `config` in order. Returns the number of kernel
/// rules appended.
fn apply_rules(compiler: &Compiler, config: &Config, resolver: &Resolver) -> Result<usize> {
    let mut compiled = 0;

    for rule in &config.rules {
        let egress = &rule.egress;

        match classify(rule) {
            RuleKind::Domain {
                resolvable,
                wildcards,
            } => {
                for pattern in wildcards {
                    log::warn!(
                        "Rule {}: wildcard domain {} is not enforced",
                        rule.name,
                        pattern
                    );
                }

                for domain in resolvable {
                    let addresses = match resolver.resolve(domain) {
                        Ok(addresses) => addresses,
                        Err(e) => {
                            log::warn!("Rule {}: skipping domain: {}", rule.name, e);
                            continue;
                        }
                    };
                    let addresses: Vec<String> =
                        addresses.iter().map(ToString::to_string).collect();
                    let key = SetKey::domain(rule.name.as_str(), domain);
                    compiled += compiler.add_rule(&rule_spec(rule, key, &addresses))?;
                }

                if !egress.ips.is_empty() {
                    compiled += compiler.add_rule(&rule_spec(rule, rule_key(rule), &egress.ips))?;
                }
            }
            RuleKind::Address => {
                compiled += compiler.add_rule(&rule_spec(rule, rule_key(rule), &egress.ips))?;
            }
            RuleKind::ProtocolOnly => {
                compiled += compiler.add_rule(&rule_spec(rule, rule_key(rule), &[]))?;
            }
        }
    }

    Ok(compiled)
}

fn rule_key(rule: &Rule) -> SetKey {
    SetKey::rule(rule.name.as_str())
}

fn rule_spec<'a>(rule: &'a Rule, key: SetKey, addresses: &'a [String]) -> RuleSpec<'a> {
    RuleSpec {
        key,
        action: rule.action,
        priority: rule.order,
        addresses,
        ports: &rule.egress.ports,
        protocols: &rule.egress.protocols,
    }
}
