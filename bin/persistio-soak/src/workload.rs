//! Soak workload
//!
//! Several persisters play the part of nodes sharing one backend. Each node
//! runs a thread that deposits into its own accounts with write-behind,
//! transfers into any account with write-through and reads quotes through
//! remote proxies. Lost synchronous writes are recovered by discarding and
//! redoing the change; entries stranded by a lost background write are
//! counted and discarded at the end. Every stored lineage is then checked
//! against the same-node run cap.

use crate::account::{Account, AccountMapper};
use persistio_common::{ChangeKind, Config, Identity, Result};
use persistio_core::{MemoryDriver, Persister, Query};
use persistio_remote::{MemorySource, ProxyRegistry, RemoteValue};
use persistio_version::VersionLineage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, info, warn};

const ACCOUNT_KIND: &str = "account";
const QUOTE_KIND: &str = "quote";

/// Workload shape
#[derive(Debug, Clone)]
pub struct SoakOptions {
    pub nodes: usize,
    pub accounts: usize,
    pub operations: usize,
    pub quotes: usize,
    pub seed: Option<u64>,
}

/// Per-node counters
#[derive(Debug, Default)]
struct NodeCounters {
    deposits: AtomicU64,
    persists: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    quote_reads: AtomicU64,
    events: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub deposits: u64,
    pub persists: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub quote_reads: u64,
    pub change_events: u64,
    pub cache_hit_ratio: f64,
    pub cache_loads: u64,
    pub flushed: u64,
    pub coalesced: u64,
}

#[derive(Debug, Serialize)]
pub struct SoakReport {
    pub nodes: Vec<NodeReport>,
    pub stored_records: usize,
    pub stranded: usize,
    pub backend_writes: u64,
    pub longest_lineage: usize,
    pub cap_violations: usize,
    pub quote_loads: u64,
}

impl SoakReport {
    pub const fn is_healthy(&self) -> bool {
        self.cap_violations == 0
    }
}

struct Node {
    persister: Persister<Account>,
    counters: Arc<NodeCounters>,
}

/// Run the workload to completion
pub fn run(config: &Config, options: &SoakOptions) -> Result<SoakReport> {
    let driver = Arc::new(MemoryDriver::new());
    let nodes = start_nodes(config, options, &driver)?;

    let accounts = seed_accounts(&nodes[0].persister, options.accounts)?;
    info!("Seeded {} accounts", accounts.len());

    let source = Arc::new(MemorySource::new());
    let quotes: Vec<Identity> = (0..options.quotes)
        .map(|n| Identity::new(QUOTE_KIND, format!("q{n}")))
        .collect::<std::result::Result<_, _>>()?;
    for quote in &quotes {
        source.put(quote.clone(), RemoteValue::new(100.0, VersionLineage::parse("feed+1")));
    }
    let registry = ProxyRegistry::new(config, source.clone())?;

    let workload = Workload {
        nodes: nodes.len(),
        accounts: &accounts,
        quotes: &quotes,
        registry: &registry,
        source: &source,
    };
    thread::scope(|scope| {
        for (index, node) in nodes.iter().enumerate() {
            let seed = options.seed.map(|seed| seed.wrapping_add(index as u64));
            let workload = &workload;
            scope.spawn(move || {
                let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
                for _ in 0..options.operations {
                    workload.step(index, node, &mut rng);
                }
                node.persister.flush_all();
            });
        }
    });

    for node in &nodes {
        node.persister.close();
    }
    registry.close();

    let mut stranded = 0;
    for node in &nodes {
        for id in &accounts {
            let Some(account) = node.persister.get(id)? else {
                continue;
            };
            if node.persister.is_dirty(&account) {
                warn!("{}: {} stranded by a lost background write", node.persister.node(), id);
                node.persister.discard(id);
                stranded += 1;
            }
        }
    }

    let max_run = config.version.max_same_node_run;
    let mut longest_lineage = 0;
    let mut cap_violations = 0;
    let stored = nodes[0].persister.find_ids(&Query::all(ACCOUNT_KIND))?;
    for id in &stored {
        let Some(record) = driver.record(id) else {
            continue;
        };
        let version = record.version();
        longest_lineage = longest_lineage.max(version.len());
        if exceeds_cap(&version, max_run) {
            warn!("{} stored with lineage {} past the run cap", id, version);
            cap_violations += 1;
        }
    }

    Ok(SoakReport {
        nodes: nodes.iter().map(report_node).collect(),
        stored_records: stored.len(),
        stranded,
        backend_writes: driver.write_count(),
        longest_lineage,
        cap_violations,
        quote_loads: source.load_count(),
    })
}

fn start_nodes(config: &Config, options: &SoakOptions, driver: &Arc<MemoryDriver>) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(options.nodes.max(1));
    for index in 0..options.nodes.max(1) {
        let mut node_config = config.clone();
        node_config.node.id = format!("{}-{index}", config.node.id);

        let persister = Persister::builder(ACCOUNT_KIND, driver.clone(), Arc::new(AccountMapper))
            .config(&node_config)
            .change_watch(driver.clone())
            .build()?;
        let counters = Arc::new(NodeCounters::default());
        let events = Arc::clone(&counters);
        persister.add_listener(
            move |kind: ChangeKind, id: &Identity, _: &dyn Fn() -> Option<Arc<Account>>| {
                debug!("{} {}", kind, id);
                events.events.fetch_add(1, Ordering::Relaxed);
            },
        )?;
        nodes.push(Node { persister, counters });
    }
    Ok(nodes)
}

fn seed_accounts(persister: &Persister<Account>, count: usize) -> Result<Vec<Identity>> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let id = persister.new_id("acct-")?;
        persister.update(&Arc::new(Account::new(id.clone(), 0)))?;
        ids.push(id);
    }
    Ok(ids)
}

/// State shared by the node threads
struct Workload<'a> {
    nodes: usize,
    accounts: &'a [Identity],
    quotes: &'a [Identity],
    registry: &'a ProxyRegistry<f64>,
    source: &'a MemorySource<f64>,
}

impl Workload<'_> {
    fn step(&self, index: usize, node: &Node, rng: &mut StdRng) {
        let roll = rng.gen_range(0..100);
        let result = match roll {
            0..60 => self.deposit(index, node, rng),
            60..80 => self.transfer(node, rng),
            80..95 => self.read_quote(node, rng),
            _ => {
                node.persister.flush_all();
                Ok(())
            }
        };
        if let Err(e) = result {
            node.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!("{}: operation failed: {}", node.persister.node(), e);
        }
    }

    /// Write-behind change to one of the node's own accounts
    fn deposit(&self, index: usize, node: &Node, rng: &mut StdRng) -> Result<()> {
        let own: Vec<&Identity> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(n, _)| n % self.nodes == index)
            .map(|(_, id)| id)
            .collect();
        if own.is_empty() {
            return Ok(());
        }
        let id = own[rng.gen_range(0..own.len())].clone();
        let Some(account) = node.persister.get(&id)? else {
            return Ok(());
        };
        account.deposit(rng.gen_range(1..=100));
        node.counters.deposits.fetch_add(1, Ordering::Relaxed);
        node.persister.update(&account)
    }

    /// Write-through change to any account, redone after a lost write
    fn transfer(&self, node: &Node, rng: &mut StdRng) -> Result<()> {
        if self.accounts.is_empty() {
            return Ok(());
        }
        let id = self.accounts[rng.gen_range(0..self.accounts.len())].clone();
        let amount = rng.gen_range(1..=100);
        let persister = &node.persister;

        for _ in 0..3 {
            let Some(account) = persister.get(&id)? else {
                return Ok(());
            };
            account.deposit(amount);
            match persister.persist(&account) {
                Ok(_) => {
                    node.counters.persists.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    node.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!("{}: lost write on {}, redoing", persister.node(), id);
                    persister.discard(&id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read_quote(&self, node: &Node, rng: &mut StdRng) -> Result<()> {
        if self.quotes.is_empty() {
            return Ok(());
        }
        let id = &self.quotes[rng.gen_range(0..self.quotes.len())];
        if rng.gen_bool(0.1) {
            // The feed moves on
            if let Some(current) = self.source.current(id) {
                let version = current.version.append("feed", false, usize::MAX);
                let price = current.value + rng.gen_range(-1.0..1.0);
                self.source.put(id.clone(), RemoteValue::new(price, version));
            }
        }
        self.registry.value(id)?;
        node.counters.quote_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Whether some same-node run in the lineage is longer than `max_run`
fn exceeds_cap(version: &VersionLineage, max_run: usize) -> bool {
    let mut run = 0;
    let mut previous: Option<&str> = None;
    for tag in version.tags() {
        run = if previous == Some(tag.node()) { run + 1 } else { 1 };
        if run > max_run {
            return true;
        }
        previous = Some(tag.node());
    }
    false
}

fn report_node(node: &Node) -> NodeReport {
    let counters = &node.counters;
    let stats = node.persister.stats();
    let flusher = node.persister.flusher_stats();
    NodeReport {
        node: node.persister.node().to_string(),
        deposits: counters.deposits.load(Ordering::Relaxed),
        persists: counters.persists.load(Ordering::Relaxed),
        conflicts: counters.conflicts.load(Ordering::Relaxed),
        failures: counters.failures.load(Ordering::Relaxed),
        quote_reads: counters.quote_reads.load(Ordering::Relaxed),
        change_events: counters.events.load(Ordering::Relaxed),
        cache_hit_ratio: stats.hit_ratio(),
        cache_loads: stats.loads.load(Ordering::Relaxed),
        flushed: flusher.map_or(0, |f| f.executed.load(Ordering::Relaxed)),
        coalesced: flusher.map_or(0, |f| f.coalesced.load(Ordering::Relaxed)),
    }
}
