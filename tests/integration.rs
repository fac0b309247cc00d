//! End-to-end filtering scenarios against the in-memory netfilter backend.

use egress_gate::compiler::{DEFAULT_TABLE, FORWARD_CHAIN, RULES_CHAIN};
use egress_gate::dns::Lookup;
use egress_gate::netfilter::{Packet, Statement, Verdict};
use egress_gate::{
    Action, Config, Error, Filter, Lifecycle, MemoryNetfilter, Protocol, Resolver, ResolverConfig,
    Result, Rule, SetKey,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// DNS answers shared between a test and its resolver.
#[derive(Clone, Default)]
struct Scripted(Arc<Mutex<HashMap<String, Vec<Ipv4Addr>>>>);

impl Scripted {
    fn set(&self, domain: &str, addrs: &[[u8; 4]]) {
        let addrs = addrs.iter().map(|a| Ipv4Addr::from(*a)).collect();
        self.0.lock().insert(domain.to_string(), addrs);
    }
}

impl Lookup for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        self.0
            .lock()
            .get(domain)
            .cloned()
            .ok_or_else(|| Error::resolution(domain, "NXDOMAIN"))
    }
}

fn resolver(dns: &Scripted, refresh: Duration) -> Arc<Resolver> {
    let config = ResolverConfig {
        refresh_interval: refresh,
        ..ResolverConfig::default()
    };
    Arc::new(Resolver::with_lookups(
        vec![Box::new(dns.clone())],
        Box::new(Scripted::default()),
        &config,
    ))
}

fn config(rules: Vec<Rule>) -> Config {
    let mut config = Config {
        version: "1.0".to_string(),
        rules,
    };
    config.sort();
    config
}

fn start(rules: Vec<Rule>, dns: &Scripted) -> (Arc<MemoryNetfilter>, Filter) {
    let nf = Arc::new(MemoryNetfilter::new());
    let filter = Filter::new(
        config(rules),
        "/nonexistent/config.yaml",
        resolver(dns, Duration::from_secs(3600)),
        nf.clone(),
    )
    .with_watch(false);
    filter.start().unwrap();
    (nf, filter)
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

#[test]
fn test_terminal_drop_is_last() {
    let dns = Scripted::default();
    let (nf, filter) = start(
        vec![Rule::new("web", Action::Allow, 10).with_ips(&["10.0.0.0/8"])],
        &dns,
    );

    let forward = nf.rules(DEFAULT_TABLE, FORWARD_CHAIN);
    assert_eq!(forward.last().unwrap().statements, vec![Statement::Drop]);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(10, 1, 1, 1), 80)), Verdict::Accept);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(8, 8, 8, 8), 80)), Verdict::Drop);

    filter.stop().unwrap();
}

#[test]
fn test_unresolvable_rule_set_drops_everything() {
    let dns = Scripted::default();
    let (nf, filter) = start(
        vec![Rule::new("web", Action::Allow, 10).with_domains(&["gone.example"])],
        &dns,
    );

    assert!(nf.rules(DEFAULT_TABLE, RULES_CHAIN).is_empty());
    assert_eq!(nf.evaluate(&Packet::tcp(ip(1, 1, 1, 1), 443)), Verdict::Drop);
    assert_eq!(nf.evaluate(&Packet::icmp(ip(1, 1, 1, 1))), Verdict::Drop);

    filter.stop().unwrap();
}

#[test]
fn test_deny_all() {
    let dns = Scripted::default();
    let (nf, filter) = start(vec![Rule::new("deny-all", Action::Deny, 1)], &dns);

    assert_eq!(nf.evaluate(&Packet::tcp(ip(1, 1, 1, 1), 443)), Verdict::Drop);
    assert_eq!(nf.evaluate(&Packet::udp(ip(9, 9, 9, 9), 53)), Verdict::Drop);

    filter.stop().unwrap();
}

#[test]
fn test_metadata_deny_before_broad_allow() {
    let dns = Scripted::default();
    // Listed out of order; sorting puts the deny first.
    let (nf, filter) = start(
        vec![
            Rule::new("allow-link-local", Action::Allow, 100).with_ips(&["169.254.0.0/16"]),
            Rule::new("block-metadata", Action::Deny, 50).with_ips(&["169.254.169.254"]),
        ],
        &dns,
    );

    let rules = nf.rules(DEFAULT_TABLE, RULES_CHAIN);
    assert_eq!(rules[0].comment.as_deref(), Some("block-metadata (order 50)"));
    assert_eq!(rules[1].comment.as_deref(), Some("allow-link-local (order 100)"));

    assert_eq!(
        nf.evaluate(&Packet::tcp(ip(169, 254, 169, 254), 80)),
        Verdict::Drop
    );
    assert_eq!(
        nf.evaluate(&Packet::tcp(ip(169, 254, 1, 1), 80)),
        Verdict::Accept
    );

    filter.stop().unwrap();
}

#[test]
fn test_each_domain_gets_its_own_sub_rule() {
    let dns = Scripted::default();
    dns.set("a.example", &[[192, 0, 2, 1]]);
    dns.set("b.example", &[[192, 0, 2, 2], [192, 0, 2, 3]]);

    let (nf, filter) = start(
        vec![Rule::new("web", Action::Allow, 10)
            .with_domains(&["a.example", "b.example"])
            .with_protocols(&[Protocol::Tcp])
            .with_ports(&["443"])],
        &dns,
    );

    assert_eq!(nf.rules(DEFAULT_TABLE, RULES_CHAIN).len(), 2);

    let a = filter.set_name(&SetKey::domain("web", "a.example")).unwrap();
    let b = filter.set_name(&SetKey::domain("web", "b.example")).unwrap();
    assert_ne!(a, b);
    assert_eq!(nf.set_elements(DEFAULT_TABLE, &a).unwrap().len(), 1);
    assert_eq!(nf.set_elements(DEFAULT_TABLE, &b).unwrap().len(), 2);

    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 3), 443)), Verdict::Accept);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 3), 80)), Verdict::Drop);

    // Updating one domain leaves the other's set alone.
    filter
        .update_domain_ips("a.example", &[ip(198, 51, 100, 1)])
        .unwrap();
    assert_eq!(nf.set_elements(DEFAULT_TABLE, &b).unwrap().len(), 2);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 1), 443)), Verdict::Drop);
    assert_eq!(
        nf.evaluate(&Packet::tcp(ip(198, 51, 100, 1), 443)),
        Verdict::Accept
    );

    filter.stop().unwrap();
}

#[test]
fn test_domain_set_never_shared_with_rule_named_like_it() {
    let dns = Scripted::default();
    dns.set("a.example", &[[192, 0, 2, 1]]);

    let (nf, filter) = start(
        vec![
            Rule::new("web/a.example", Action::Deny, 10).with_ips(&["10.0.0.1"]),
            Rule::new("web", Action::Allow, 20).with_domains(&["a.example"]),
            Rule::new("allow-10", Action::Allow, 30).with_ips(&["10.0.0.0/8"]),
        ],
        &dns,
    );

    let deny = filter.set_name(&SetKey::rule("web/a.example")).unwrap();
    let domain = filter.set_name(&SetKey::domain("web", "a.example")).unwrap();
    assert_ne!(deny, domain);
    assert_eq!(
        nf.set_elements(DEFAULT_TABLE, &deny),
        Some(vec!["10.0.0.1/32".parse().unwrap()])
    );
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 1), 443)), Verdict::Accept);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(10, 0, 0, 1), 443)), Verdict::Drop);

    // A refresh of the domain must not rewrite the deny rule's set.
    let updated = filter
        .update_domain_ips("a.example", &[ip(192, 0, 2, 9)])
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(10, 0, 0, 1), 443)), Verdict::Drop);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 9), 443)), Verdict::Accept);
    assert_eq!(
        nf.set_elements(DEFAULT_TABLE, &deny),
        Some(vec!["10.0.0.1/32".parse().unwrap()])
    );

    filter.stop().unwrap();
}

#[test]
fn test_port_range_with_invalid_sibling() {
    let dns = Scripted::default();
    let (nf, filter) = start(
        vec![Rule::new("high", Action::Allow, 10)
            .with_protocols(&[Protocol::Tcp])
            .with_ports(&["8000-9000", "9000-8000", "abc"])],
        &dns,
    );

    assert_eq!(nf.rules(DEFAULT_TABLE, RULES_CHAIN).len(), 1);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(1, 1, 1, 1), 8500)), Verdict::Accept);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(1, 1, 1, 1), 9001)), Verdict::Drop);

    filter.stop().unwrap();
}

#[test]
fn test_refresh_updates_address_set() {
    let dns = Scripted::default();
    dns.set("api.example", &[[203, 0, 113, 1]]);

    let nf = Arc::new(MemoryNetfilter::new());
    let filter = Filter::new(
        config(vec![
            Rule::new("api", Action::Allow, 10).with_domains(&["api.example"])
        ]),
        "/nonexistent/config.yaml",
        resolver(&dns, Duration::from_millis(50)),
        nf.clone(),
    )
    .with_watch(false);
    filter.start().unwrap();

    dns.set("api.example", &[[203, 0, 113, 2]]);
    let moved = wait_for(Duration::from_secs(5), || {
        nf.evaluate(&Packet::tcp(ip(203, 0, 113, 2), 443)) == Verdict::Accept
    });
    assert!(moved);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(203, 0, 113, 1), 443)), Verdict::Drop);

    filter.stop().unwrap();
}

fn write_config(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
}

const ALLOW_ONE: &str = r#"
version: "1"
rules:
  - name: one
    action: allow
    order: 10
    egress:
      ips: ["192.0.2.1"]
"#;

const ALLOW_TWO: &str = r#"
version: "2"
rules:
  - name: two
    action: allow
    order: 10
    egress:
      ips: ["192.0.2.2"]
"#;

const ALLOW_TWO_AND_THREE: &str = r#"
version: "3"
rules:
  - name: two
    action: allow
    order: 10
    egress:
      ips: ["192.0.2.2"]
  - name: three
    action: allow
    order: 20
    egress:
      ips: ["192.0.2.3"]
"#;

const MISSING_VERSION: &str = r#"
version: ""
rules:
  - name: open
    action: allow
"#;

const DOMAINS_AB: &str = r#"
version: "1"
rules:
  - name: web
    action: allow
    order: 10
    egress:
      domains: ["a.example", "b.example", "*.example"]
"#;

const DOMAINS_A: &str = r#"
version: "2"
rules:
  - name: web
    action: allow
    order: 10
    egress:
      domains: ["a.example"]
"#;

fn start_with(
    dir: &TempDir,
    content: &str,
    dns: &Scripted,
    watch: bool,
) -> (Arc<MemoryNetfilter>, Filter, std::path::PathBuf) {
    let path = dir.path().join("config.yaml");
    write_config(&path, content);

    let nf = Arc::new(MemoryNetfilter::new());
    let filter = Filter::new(
        Config::load(&path).unwrap(),
        &path,
        resolver(dns, Duration::from_secs(3600)),
        nf.clone(),
    )
    .with_watch(watch);
    filter.start().unwrap();
    (nf, filter, path)
}

fn start_from_file(dir: &TempDir, watch: bool) -> (Arc<MemoryNetfilter>, Filter, std::path::PathBuf) {
    start_with(dir, ALLOW_ONE, &Scripted::default(), watch)
}

#[test]
fn test_reload_swaps_rules() {
    let dir = TempDir::new().unwrap();
    let (nf, filter, path) = start_from_file(&dir, false);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 1), 80)), Verdict::Accept);

    write_config(&path, ALLOW_TWO);
    filter.reload().unwrap();

    assert_eq!(filter.config().version, "2");
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 1), 80)), Verdict::Drop);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 2), 80)), Verdict::Accept);
    assert_eq!(nf.sets(DEFAULT_TABLE).len(), 1);

    filter.stop().unwrap();
}

#[test]
fn test_invalid_reload_keeps_state() {
    let dir = TempDir::new().unwrap();
    let (nf, filter, path) = start_from_file(&dir, false);
    let before = nf.snapshot();
    let commits = nf.commit_count();

    write_config(&path, MISSING_VERSION);
    assert!(matches!(filter.reload(), Err(Error::Config(_))));

    assert_eq!(nf.snapshot(), before);
    assert_eq!(nf.commit_count(), commits);
    assert_eq!(filter.config().version, "1");

    filter.stop().unwrap();
}

#[test]
fn test_reload_kernel_failure_keeps_state() {
    let dir = TempDir::new().unwrap();
    let (nf, filter, path) = start_from_file(&dir, false);
    let before = nf.snapshot();

    write_config(&path, ALLOW_TWO);
    nf.fail_next_commit("netlink: Operation not permitted");
    assert!(matches!(filter.reload(), Err(Error::Kernel(_))));

    assert_eq!(nf.snapshot(), before);
    assert_eq!(filter.config().version, "1");

    filter.stop().unwrap();
}

#[test]
fn test_reload_failure_midway_restores_previous_rules() {
    let dir = TempDir::new().unwrap();
    let (nf, filter, path) = start_from_file(&dir, false);

    write_config(&path, ALLOW_TWO_AND_THREE);
    // The reset and the first new rule commit, the second new rule fails.
    nf.fail_commit_after(2, "netlink: No buffer space available");
    assert!(matches!(filter.reload(), Err(Error::Kernel(_))));

    assert_eq!(filter.config().version, "1");
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 1), 80)), Verdict::Accept);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 2), 80)), Verdict::Drop);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 3), 80)), Verdict::Drop);
    assert_eq!(nf.rules(DEFAULT_TABLE, RULES_CHAIN).len(), 1);
    assert_eq!(nf.sets(DEFAULT_TABLE).len(), 1);

    // The restored rules still reload normally.
    filter.reload().unwrap();
    assert_eq!(filter.config().version, "3");
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 3), 80)), Verdict::Accept);

    filter.stop().unwrap();
}

#[test]
fn test_reload_forgets_dropped_domains() {
    let dir = TempDir::new().unwrap();
    let dns = Scripted::default();
    dns.set("a.example", &[[192, 0, 2, 1]]);
    dns.set("b.example", &[[192, 0, 2, 2]]);
    let (_nf, filter, path) = start_with(&dir, DOMAINS_AB, &dns, false);
    assert!(filter.resolver().cached("b.example").is_some());

    write_config(&path, DOMAINS_A);
    filter.reload().unwrap();

    assert!(filter.resolver().cached("a.example").is_some());
    assert!(filter.resolver().cached("b.example").is_none());
    assert_eq!(filter.resolver().len(), 1);

    filter.stop().unwrap();
}

#[test]
fn test_watcher_reloads_on_change() {
    let dir = TempDir::new().unwrap();
    let (nf, filter, path) = start_from_file(&dir, true);

    write_config(&path, ALLOW_TWO);
    let reloaded = wait_for(Duration::from_secs(10), || filter.config().version == "2");
    assert!(reloaded);
    assert_eq!(nf.evaluate(&Packet::tcp(ip(192, 0, 2, 2), 80)), Verdict::Accept);

    filter.stop().unwrap();
}

#[test]
fn test_stop_removes_table() {
    let dns = Scripted::default();
    let (nf, filter) = start(vec![Rule::new("all", Action::Allow, 1)], &dns);
    assert!(matches!(filter.start(), Err(Error::InvalidState(_))));

    filter.stop().unwrap();
    assert_eq!(filter.lifecycle(), Lifecycle::Stopped);
    assert!(!nf.has_table(DEFAULT_TABLE));

    filter.stop().unwrap();
    // With no table installed the model lets traffic through, as the kernel does.
    assert_eq!(nf.evaluate(&Packet::tcp(ip(1, 1, 1, 1), 80)), Verdict::Accept);
}
