//! A small CRM front end sitting on top of a natural-language workflow agent.
//!
//! The agent is simulated: it answers after a noticeable delay, wraps its JSON in chatter, and can be told to fail.
//! Run it twice with the same `--data-dir` to see the persistent tier at work.
//!
//! ```sh
//! RUST_LOG=rt_cache=debug cargo run --example crm --features demo -- --latency 500
//! ```

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use futures::future::join_all;
use rt_cache::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

const CONTACTS_TTL: TtlConfig = TtlConfig::from_millis(60_000, 300_000);
const CONTACT_TTL: TtlConfig = TtlConfig::from_millis(120_000, 600_000);
const DASHBOARD_TTL: TtlConfig = TtlConfig::from_millis(30_000, 120_000);

#[derive(Debug, Clone, Parser)]
#[clap(about, version, name = "crm")]
struct Cli {
    /// Where the persistent tier keeps its document.
    #[clap(long, env = "RTCACHE_DATA_DIR", default_value = ".rt-cache")]
    data_dir: PathBuf,

    /// Persistent tier size limit in bytes.
    #[clap(long, env = "RTCACHE_QUOTA")]
    quota: Option<usize>,

    /// How long the agent takes to answer, in milliseconds.
    #[clap(long, env = "RTCACHE_LATENCY", default_value_t = 800)]
    latency: u64,

    /// Number of widgets asking for the dashboard at once.
    #[clap(long, env = "RTCACHE_WIDGETS", default_value_t = 5)]
    widgets: usize,

    /// Make the agent fail the forced dashboard refresh.
    #[clap(long, env = "RTCACHE_FAIL_REFRESH", default_value_t = false)]
    fail_refresh: bool,

    /// Wipe the cache before exiting.
    #[clap(long, default_value_t = false)]
    clear: bool,
}

#[derive(Debug, Error)]
enum AgentError {
    #[error("agent is unreachable")]
    Unreachable,
    #[error("no JSON in agent response: {0}")]
    NoJson(String),
    #[error("malformed agent response: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Contact {
    id:      u32,
    name:    String,
    company: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Dashboard {
    contacts:   u32,
    open_deals: u32,
    revenue:    f64,
}

/// The slow, chatty backend.
#[async_trait]
trait WorkflowApi: Send + Sync + 'static {
    async fn ask(&self, prompt: &str) -> Result<String, AgentError>;
}

#[derive(Debug)]
struct SimulatedAgent {
    latency: Duration,
    fail:    AtomicUsize,
    calls:   AtomicUsize,
}

impl SimulatedAgent {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn fail_next(&self, count: usize) {
        self.fail.store(count, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn contacts() -> Vec<Contact> {
        [("Ada Lovelace", "Analytical Engines"), ("Grace Hopper", "COBOL Inc."), ("Alan Turing", "Bletchley Park")]
            .into_iter()
            .enumerate()
            .map(|(i, (name, company))| Contact {
                id:      i as u32 + 1,
                name:    name.into(),
                company: company.into(),
            })
            .collect()
    }

    fn answer(&self, prompt: &str) -> Result<String, AgentError> {
        let json = if prompt.starts_with("list contacts") {
            serde_json::to_string_pretty(&Self::contacts())?
        }
        else if let Some(id) = prompt.strip_prefix("show contact ") {
            let id: u32 = id.trim().parse().map_err(|_| AgentError::NoJson(prompt.into()))?;
            match Self::contacts().into_iter().find(|c| c.id == id) {
                Some(contact) => serde_json::to_string_pretty(&contact)?,
                None => return Ok(format!("I couldn't find contact {id}, sorry.")),
            }
        }
        else {
            let calls = self.calls() as u32;
            serde_json::to_string_pretty(&Dashboard {
                contacts:   Self::contacts().len() as u32,
                open_deals: 4 + calls,
                revenue:    12_500.0 * calls as f64,
            })?
        };

        Ok(format!("Sure! Here is what I found:\n```json\n{json}\n```\nAnything else?"))
    }
}

#[async_trait]
impl WorkflowApi for SimulatedAgent {
    async fn ask(&self, prompt: &str) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let failing = self
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AgentError::Unreachable);
        }
        self.answer(prompt)
    }
}

/// Pulls the JSON payload out of the agent's prose.
fn extract_json<T: DeserializeOwned>(response: &str) -> Result<T, AgentError> {
    let start = response
        .find(['{', '['])
        .ok_or_else(|| AgentError::NoJson(response.into()))?;
    let end = response
        .rfind(['}', ']'])
        .filter(|end| *end > start)
        .ok_or_else(|| AgentError::NoJson(response.into()))?;
    Ok(serde_json::from_str(&response[start..=end])?)
}

struct CrmService<A: WorkflowApi> {
    cache: TieredCache<FileStorage>,
    agent: Arc<A>,
}

impl<A: WorkflowApi> CrmService<A> {
    async fn query<T>(
        &self,
        key: &str,
        prompt: String,
        ttl: TtlConfig,
        options: FetchOptions,
    ) -> Result<Fetched<T>, CacheError<AgentError>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let agent = Arc::clone(&self.agent);
        self.cache
            .fetch(
                key,
                move || async move { extract_json::<T>(&agent.ask(&prompt).await?) },
                ttl,
                options,
            )
            .await
    }

    async fn contacts(&self) -> Result<Fetched<Vec<Contact>>, CacheError<AgentError>> {
        self.query("contacts", "list contacts".into(), CONTACTS_TTL, FetchOptions::default())
            .await
    }

    async fn contact(&self, id: u32) -> Result<Fetched<Contact>, CacheError<AgentError>> {
        self.query(
            &format!("contact:{id}"),
            format!("show contact {id}"),
            CONTACT_TTL,
            FetchOptions::default(),
        )
        .await
    }

    async fn dashboard(&self, options: FetchOptions) -> Result<Fetched<Dashboard>, CacheError<AgentError>> {
        self.query("dashboard", "summarize the dashboard".into(), DASHBOARD_TTL, options)
            .await
    }
}

fn setup_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing()?;

    let path = cli.data_dir.join("crm-cache.json");
    let storage = Arc::new(
        FileStorage::open_with_quota(&path, cli.quota)
            .with_context(|| format!("opening cache document {}", path.display()))?,
    );
    let config = CacheConfig::builder().name("crm").build()?;
    let agent = Arc::new(SimulatedAgent::new(Duration::from_millis(cli.latency)));
    let crm = CrmService {
        cache: TieredCache::new(&config, storage),
        agent: Arc::clone(&agent),
    };
    crm.cache.start_janitor(Duration::from_secs(30));

    let started = Instant::now();
    let contacts = crm.contacts().await?;
    info!(
        "{} contacts from {} in {:?}",
        contacts.data.len(),
        contacts.source,
        started.elapsed()
    );

    let started = Instant::now();
    let again = crm.contacts().await?;
    info!("contacts again from {} in {:?}", again.source, started.elapsed());

    for contact in &contacts.data {
        let fetched = crm.contact(contact.id).await?;
        info!("contact:{} '{}' from {}", contact.id, fetched.data.name, fetched.source);
    }

    let calls_before = agent.calls();
    let widgets = join_all((0..cli.widgets).map(|_| crm.dashboard(FetchOptions::default()))).await;
    for (i, widget) in widgets.into_iter().enumerate() {
        let widget = widget?;
        info!("widget {i}: {} open deals from {}", widget.data.open_deals, widget.source);
    }
    info!(
        "{} widgets cost {} agent call(s)",
        cli.widgets,
        agent.calls() - calls_before
    );

    if cli.fail_refresh {
        agent.fail_next(1);
    }
    match crm.dashboard(FetchOptions::force_refresh()).await {
        Ok(fresh) => info!("refreshed dashboard: {} open deals", fresh.data.open_deals),
        Err(err) => {
            warn!("refresh failed: {err}");
            let cached = crm.dashboard(FetchOptions::default()).await?;
            info!("still showing {} open deals from {}", cached.data.open_deals, cached.source);
        }
    }

    let status = crm.cache.cache_status("dashboard");
    info!("dashboard status: {}", serde_json::to_string(&status)?);
    if let Some(age) = crm.cache.last_fetch_age("dashboard") {
        info!("dashboard fetched {:?} ago", age);
    }

    crm.cache.invalidate_pattern("contact:*");
    info!("after invalidation contact:1 is {:?}", crm.cache.cache_status("contact:1"));

    if cli.clear {
        crm.cache.clear_all();
        info!("cache cleared");
    }

    crm.cache.close().await;
    Ok(())
}
