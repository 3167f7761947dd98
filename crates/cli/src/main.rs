use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use keel_core::{AnyObject, Kind, Spec, StorageConfig};
use keel_kv::{KvBackend, MemoryBackend, MemoryOptions};
use keel_registry::Registry;
use keel_selector::Selector;
use keel_store::reflector::object_key;
use keel_store::{GenericStore, ListOptions, RequestContext, Storage, StoreError};
use tracing::{debug, info, warn};

mod manifest;
mod render;

use render::Row;

const EVENT_DRAIN: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel storage operator tool")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace requests are addressed to
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved storage configuration
    Config,
    /// Print the key layout of every kind
    Layout,
    /// Load manifests into an in-memory store and list the result
    Load {
        /// Multi-document YAML file
        manifest: PathBuf,
        /// Label selector, e.g. "env=prod,tier in (web,api)"
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
        /// Field selector, e.g. "metadata.name=east"
        #[arg(long = "fields", default_value = "")]
        fields: String,
        /// Only list this kind (singular or plural, any case)
        #[arg(long = "kind")]
        kind: Option<String>,
        /// List across all namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
        /// Include objects with pending initializers
        #[arg(long = "include-uninitialized", action = ArgAction::SetTrue)]
        include_uninitialized: bool,
        /// Also print the change events the load produced
        #[arg(long = "events", action = ArgAction::SetTrue)]
        events: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = StorageConfig::from_env();

    match cli.command {
        Commands::Config => {
            config.validate()?;
            match cli.output {
                Output::Human => println!("{}", serde_yaml::to_string(&config)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        }
        Commands::Layout => {
            let registry = Registry::new(&config)?;
            print_layout(&registry, cli.output)?;
        }
        Commands::Load { manifest, selector, fields, kind, all_namespaces, include_uninitialized, events } => {
            let text = std::fs::read_to_string(&manifest).with_context(|| format!("reading {}", manifest.display()))?;
            let objects = manifest::parse(&text)?;
            let only = kind.as_deref().map(Kind::from_str).transpose()?;
            let opts = ListOptions { selector: Selector::parse(&selector, &fields)?, include_uninitialized };
            info!(path = %manifest.display(), documents = objects.len(), "load invoked");

            let mem = MemoryBackend::shared(MemoryOptions {
                history_capacity: config.history_capacity,
                watch_buffer: config.watch_buffer,
            });
            let backend: Arc<dyn KvBackend> = mem;
            let storage = Storage::new(&config, Arc::clone(&backend))?;

            let ctx = RequestContext::new(cli.namespace.clone());
            let mut failed = 0usize;
            for obj in objects {
                if let Err(e) = create(&storage, &ctx, obj).await {
                    failed += 1;
                    eprintln!("error ({}): {e}", e.status_code());
                }
            }

            let revision = backend.current_revision().await?;
            info!(revision, failed, "manifest loaded");

            let list_ctx = if all_namespaces { RequestContext::all_namespaces() } else { ctx };
            if events {
                print_events(&storage, &list_ctx, &opts, only, cli.output).await?;
            }
            let (rows, values) = list_all(&storage, &list_ctx, &opts, only).await?;
            match cli.output {
                Output::Human => render::print_table(&rows),
                Output::Json => println!("{}", serde_json::to_string_pretty(&values)?),
            }
            if failed > 0 {
                bail!("{failed} object(s) could not be loaded");
            }
        }
    }

    Ok(())
}

fn print_layout(registry: &Registry, output: Output) -> Result<()> {
    #[derive(serde::Serialize)]
    struct LayoutRow {
        kind: &'static str,
        scope: &'static str,
        key_root: String,
        key_example: String,
        fields: &'static [&'static str],
    }
    let rows: Vec<LayoutRow> = registry
        .layouts()
        .into_iter()
        .map(|(kind, layout)| {
            let scope = if layout.is_namespaced() { "namespaced" } else { "cluster" };
            let key_example = layout.key_for("<namespace>", "<name>", kind).unwrap_or_default();
            LayoutRow { kind: kind.as_str(), scope, key_root: layout.type_root(), key_example, fields: fields_of(registry, kind) }
        })
        .collect();
    match output {
        Output::Human => {
            for r in &rows {
                println!("{:<10} {:<11} {:<32} {}", r.kind, r.scope, r.key_example, r.fields.join(","));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

fn fields_of(registry: &Registry, kind: Kind) -> &'static [&'static str] {
    match kind {
        Kind::Cluster => registry.descriptor::<keel_core::ClusterSpec>().selectable_fields,
        Kind::Host => registry.descriptor::<keel_core::HostSpec>().selectable_fields,
        Kind::Node => registry.descriptor::<keel_core::NodeSpec>().selectable_fields,
        Kind::NodeGroup => registry.descriptor::<keel_core::NodeGroupSpec>().selectable_fields,
    }
}

async fn create(storage: &Storage, ctx: &RequestContext, obj: AnyObject) -> Result<(), StoreError> {
    let (kind, name) = (obj.kind(), obj.metadata().name.clone());
    let rv = match obj {
        AnyObject::Cluster(o) => storage.clusters.create(ctx, o).await?.metadata.resource_version,
        AnyObject::Host(o) => storage.hosts.create(ctx, o).await?.metadata.resource_version,
        AnyObject::Node(o) => storage.nodes.create(ctx, o).await?.metadata.resource_version,
        AnyObject::NodeGroup(o) => storage.node_groups.create(ctx, o).await?.metadata.resource_version,
    };
    debug!(%kind, %name, %rv, "loaded");
    Ok(())
}

/// Lists one kind, or skips it when the field selector names fields the
/// kind does not declare.
async fn list_kind<S: Spec>(
    store: &GenericStore<S>,
    ctx: &RequestContext,
    opts: &ListOptions,
    rows: &mut Vec<Row>,
    values: &mut Vec<serde_json::Value>,
) -> Result<()> {
    if opts.selector.fields.keys().any(|k| !store.descriptor().supports_field(k)) {
        debug!(kind = %S::KIND, "field selector not supported; skipping kind");
        return Ok(());
    }
    let list = store.list(ctx, opts).await?;
    let now = chrono::Utc::now();
    for obj in &list.items {
        rows.push(Row::of(obj, now));
        values.push(serde_json::to_value(obj)?);
    }
    Ok(())
}

async fn list_all(
    storage: &Storage,
    ctx: &RequestContext,
    opts: &ListOptions,
    only: Option<Kind>,
) -> Result<(Vec<Row>, Vec<serde_json::Value>)> {
    let (mut rows, mut values) = (Vec::new(), Vec::new());
    for kind in Kind::ALL {
        if only.is_some_and(|k| k != kind) {
            continue;
        }
        match kind {
            Kind::Cluster => list_kind(&storage.clusters, ctx, opts, &mut rows, &mut values).await?,
            Kind::Host => list_kind(&storage.hosts, ctx, opts, &mut rows, &mut values).await?,
            Kind::Node => list_kind(&storage.nodes, ctx, opts, &mut rows, &mut values).await?,
            Kind::NodeGroup => list_kind(&storage.node_groups, ctx, opts, &mut rows, &mut values).await?,
        }
    }
    Ok((rows, values))
}

async fn drain_events<S: Spec>(
    store: &GenericStore<S>,
    ctx: &RequestContext,
    opts: &ListOptions,
    output: Output,
) -> Result<()> {
    if opts.selector.fields.keys().any(|k| !store.descriptor().supports_field(k)) {
        return Ok(());
    }
    // Replay everything the backend still retains.
    let mut stream = match store.watch(ctx, opts, "0").await {
        Ok(stream) => stream,
        Err(e) if e.is_resync_required() => {
            warn!(kind = %S::KIND, error = %e, "event history no longer available");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    while let Ok(Some(ev)) = tokio::time::timeout(EVENT_DRAIN, stream.next()).await {
        let ev = ev?;
        match output {
            Output::Human => println!("{:<8} {} {} rv={}", ev.type_, S::KIND, object_key(&ev.object), ev.resource_version),
            Output::Json => println!("{}", serde_json::to_string(&ev)?),
        }
    }
    Ok(())
}

async fn print_events(
    storage: &Storage,
    ctx: &RequestContext,
    opts: &ListOptions,
    only: Option<Kind>,
    output: Output,
) -> Result<()> {
    for kind in Kind::ALL {
        if only.is_some_and(|k| k != kind) {
            continue;
        }
        match kind {
            Kind::Cluster => drain_events(&storage.clusters, ctx, opts, output).await?,
            Kind::Host => drain_events(&storage.hosts, ctx, opts, output).await?,
            Kind::Node => drain_events(&storage.nodes, ctx, opts, output).await?,
            Kind::NodeGroup => drain_events(&storage.node_groups, ctx, opts, output).await?,
        }
    }
    Ok(())
}
