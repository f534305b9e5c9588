//! decai node: serve zero-knowledge inference to peers, or request it.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use decai_discovery::{
    MemoryRouter, MemoryRouting, ServiceAdvertiser, ServiceDescriptor, ServiceDiscovery,
};
use decai_inference::{
    InferenceClient, InferenceService, InferenceVerdict, ModelArtifacts, ModelCatalog,
};
use decai_session::{connect_tcp, listen_tcp, PeerSession, SessionConfig, SessionEvent};
use decai_wire::{PeerId, PeerInfo};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod engine;

use config::NodeConfig;
use engine::CliProofEngine;
use logging::DecaiLogFormatter;

#[derive(Parser, Debug)]
#[command(name = "decai", version, about = "Peer-to-peer verifiable inference node")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Peer id announced to remote peers (overrides the config file)
    #[arg(long, global = true)]
    peer_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve configured models to connecting peers
    Serve {
        /// Listen address, e.g. 0.0.0.0:10333
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Request one inference from a server and verify the proof
    Request(RequestArgs),
    /// Run a server and a client in one process; the client finds the server by discovery
    Demo(RequestArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct RequestArgs {
    /// Server to dial, e.g. 127.0.0.1:10333
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Model to run
    #[arg(long, default_value = "mnist")]
    model: String,

    /// Input JSON file
    #[arg(long)]
    input: PathBuf,

    /// SRS file (defaults to the model's configured srs)
    #[arg(long)]
    srs: Option<PathBuf>,

    /// How long to wait for the output, e.g. 5m
    #[arg(long, default_value = "5m")]
    timeout: humantime::Duration,
}

/// What a role needs to open sessions and run the engine
struct Node {
    config: NodeConfig,
    session: SessionConfig,
    engine: Arc<CliProofEngine>,
}

impl Node {
    fn new(config: NodeConfig, peer_id: &str) -> Self {
        let mut session = SessionConfig::new(PeerId::new(peer_id));
        session.protocol = config.protocol.clone();
        session.max_frame_size = config.max_frame_size;
        let engine = Arc::new(CliProofEngine::new(&config.engine));
        Self {
            config,
            session,
            engine,
        }
    }

    fn peer_id(&self) -> &PeerId {
        &self.session.local_peer
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("decai={}", args.log_level).parse()?)
        .add_directive(format!("decai_wire={}", args.log_level).parse()?)
        .add_directive(format!("decai_session={}", args.log_level).parse()?)
        .add_directive(format!("decai_discovery={}", args.log_level).parse()?)
        .add_directive(format!("decai_inference={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(DecaiLogFormatter::new("decai"))
        .init();

    info!("Starting decai node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load_from_file(&args.config)?;
    let peer_id = args.peer_id.clone().unwrap_or_else(|| config.peer_id.clone());

    match args.command {
        Command::Serve { listen } => {
            let node = Arc::new(Node::new(config, &peer_id));
            let addr = listen.unwrap_or(node.config.listen);
            let listener = listen_tcp(addr).await?;
            component_info!("serve", "{}", process_local_notice(listener.local_addr()?));
            let server = Server::start(node, listener, MemoryRouting::new()).await?;
            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to wait for Ctrl-C: {}", e);
                    }
                })
                .await
        }
        Command::Request(request) => {
            let node = Arc::new(Node::new(config, &peer_id));
            let verdict = run_request(node, request, None).await?;
            report(&verdict)
        }
        Command::Demo(request) => {
            let routing = MemoryRouting::new();
            let server_node = Arc::new(Node::new(config.clone(), &peer_id));
            let client_node = Arc::new(Node::new(config, &format!("{}-client", peer_id)));

            let listener = listen_tcp(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
            let server = Server::start(server_node, listener, routing.clone()).await?;
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let server_task = tokio::spawn(server.run(async move {
                let _ = stop_rx.await;
            }));

            let result = run_request(client_node, request, Some(routing)).await;
            let _ = stop_tx.send(());
            server_task.await??;
            report(&result?)
        }
    }
}

/// A listener plus the services advertised for it
struct Server {
    node: Arc<Node>,
    listener: TcpListener,
    routing: MemoryRouting,
    advertiser: ServiceAdvertiser<MemoryRouter>,
    service: Arc<InferenceService<CliProofEngine>>,
}

impl Server {
    /// Load servable models and announce them
    async fn start(
        node: Arc<Node>,
        listener: TcpListener,
        routing: MemoryRouting,
    ) -> anyhow::Result<Self> {
        let local_addr = listener.local_addr()?;
        let catalog = Arc::new(server_catalog(&node.config)?);
        if catalog.is_empty() {
            bail!("no model has a compiled circuit configured; nothing to serve");
        }

        let local = PeerInfo::new(node.peer_id().clone(), vec![local_addr.to_string()]);
        let router = Arc::new(routing.router(local));
        let mut advertiser = ServiceAdvertiser::new(router, node.config.discovery.advertise_delay);
        for model in catalog.names() {
            advertiser.register(ServiceDescriptor::model(model))?;
        }
        let provided = advertiser.provide_all().await;
        component_debug!("serve", "Provided {} services at startup", provided);

        let service = Arc::new(InferenceService::new(node.engine.clone(), catalog));
        component_info!("serve", "Listening on {} as {}", local_addr, node.peer_id());

        Ok(Self {
            node,
            listener,
            routing,
            advertiser,
            service,
        })
    }

    /// Accept peers until `shutdown` resolves
    async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let session_config = self.node.session.clone();
                        let service = self.service.clone();
                        let events = events_tx.clone();
                        tokio::spawn(async move {
                            let session = match PeerSession::start(
                                &session_config,
                                stream,
                                service,
                                Some(events),
                            )
                            .await
                            {
                                Ok(session) => session,
                                Err(e) => {
                                    component_warn!("serve", "Rejected {}: {}", addr, e);
                                    return;
                                }
                            };
                            let peer = session.peer().clone();
                            match session.closed().await {
                                Ok(summary) => component_debug!(
                                    "serve",
                                    "{} sent {} frames, {} dispatched, {} failed",
                                    peer,
                                    summary.frames,
                                    summary.dispatched,
                                    summary.handler_failures
                                ),
                                Err(e) => component_warn!("serve", "Session with {} failed: {}", peer, e),
                            }
                        });
                    }
                    Err(e) => {
                        component_error!("serve", "Accept error: {}; stopping listener", e);
                        break;
                    }
                },
                Some(event) = events_rx.recv() => match event {
                    SessionEvent::Connected { peer, .. } => {
                        component_info!("serve", "Peer {} connected", peer);
                        self.advertiser.on_peer_connected(&peer);
                    }
                    SessionEvent::Disconnected { peer, error: Some(error) } => {
                        component_warn!("serve", "Peer {} disconnected: {}", peer, error);
                    }
                    SessionEvent::Disconnected { peer, error: None } => {
                        component_info!("serve", "Peer {} disconnected", peer);
                    }
                },
                _ = &mut shutdown => {
                    component_info!("serve", "Shutting down");
                    break;
                }
            }
        }

        self.routing.withdraw(self.node.peer_id());
        Ok(())
    }
}

/// Models with a compiled circuit, ready to prove
fn server_catalog(config: &NodeConfig) -> anyhow::Result<ModelCatalog> {
    let mut catalog = ModelCatalog::new();
    for (name, paths) in &config.models {
        let Some(compiled) = &paths.compiled else {
            warn!("Model {} has no compiled circuit; not serving it", name);
            continue;
        };
        let artifacts = ModelArtifacts::load(compiled, paths.settings.as_deref())
            .with_context(|| format!("loading artifacts for model {}", name))?;
        catalog.insert(name.clone(), artifacts);
    }
    Ok(catalog)
}

/// Catalog holding the settings needed to verify `model`
fn client_catalog(config: &NodeConfig, model: &str) -> anyhow::Result<ModelCatalog> {
    let settings_path = config
        .model(model)
        .and_then(|paths| paths.settings.clone())
        .with_context(|| format!("model {} has no settings configured; cannot verify", model))?;
    let settings = std::fs::read(&settings_path)
        .with_context(|| format!("reading settings {:?}", settings_path))?;

    let mut catalog = ModelCatalog::new();
    catalog.insert(
        model,
        ModelArtifacts {
            compiled: Bytes::new(),
            settings: Some(Bytes::from(settings)),
        },
    );
    Ok(catalog)
}

/// Dial (or discover) a server, send one request and wait for its verdict
async fn run_request(
    node: Arc<Node>,
    args: RequestArgs,
    routing: Option<MemoryRouting>,
) -> anyhow::Result<InferenceVerdict> {
    let target = match (args.connect, routing) {
        (Some(addr), _) => addr,
        (None, Some(routing)) => discover_server(&node, routing, &args.model).await?,
        (None, None) => bail!("--connect is required: no routing network is available to discover servers"),
    };

    let input = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("reading input {:?}", args.input))?;
    let srs_path = args
        .srs
        .clone()
        .or_else(|| node.config.model(&args.model).and_then(|paths| paths.srs.clone()))
        .with_context(|| format!("no SRS given and none configured for model {}", args.model))?;
    let srs = tokio::fs::read(&srs_path)
        .await
        .with_context(|| format!("reading SRS {:?}", srs_path))?;

    let catalog = Arc::new(client_catalog(&node.config, &args.model)?);
    let (client, mut verdicts) = InferenceClient::new(node.engine.clone(), catalog);
    let client = Arc::new(client);

    component_info!("request", "Dialing {}", target);
    let stream = connect_tcp(target).await?;
    let session = PeerSession::start(&node.session, stream, client.clone(), None).await?;

    let task_id = client.request(session.queue(), &args.model, Bytes::from(input), Bytes::from(srs))?;
    component_info!("request", "Sent task {} to {}", task_id, session.peer());

    let verdict = tokio::time::timeout(*args.timeout, verdicts.recv())
        .await
        .with_context(|| format!("no output for task {} within {}", task_id, args.timeout))?
        .context("session closed before an output arrived")?;

    session.close();
    if let Err(e) = session.closed().await {
        component_warn!("request", "Session ended with error: {}", e);
    }
    Ok(verdict)
}

/// First reachable address offering `model`
async fn discover_server(
    node: &Node,
    routing: MemoryRouting,
    model: &str,
) -> anyhow::Result<SocketAddr> {
    let router = Arc::new(routing.router(PeerInfo::new(node.peer_id().clone(), Vec::new())));
    let discovery = ServiceDiscovery::new(router, node.config.discovery.clone());

    let providers = discovery.discover(&ServiceDescriptor::model(model)).await;
    for provider in &providers {
        for addr in &provider.addrs {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    component_info!("request", "Found {} at {}", provider.id, addr);
                    return Ok(addr);
                }
                Err(_) => component_debug!("request", "Skipping unusable address {}", addr),
            }
        }
    }
    bail!("no server found offering model {}", model)
}

/// Startup notice for `serve`: its routing table lives only in this process
fn process_local_notice(addr: SocketAddr) -> String {
    format!(
        "Service advertisements are process-local; peers in other processes will not \
         discover this node and must dial {} directly",
        addr
    )
}

fn report(verdict: &InferenceVerdict) -> anyhow::Result<()> {
    println!("task:      {}", verdict.task_id);
    println!("model:     {}", verdict.model_id);
    println!("verified:  {}", verdict.verified);
    println!("elapsed:   {:.2?}", verdict.elapsed);
    for (i, row) in verdict.outputs.iter().enumerate() {
        println!("output[{}]: {:?}", i, row);
    }
    println!("predicted: {:?}", verdict.predicted());

    if !verdict.verified {
        bail!("proof for task {} did not verify", verdict.task_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::ModelPaths;
    use decai_discovery::ContentId;
    use decai_session::InboundContext;
    use decai_wire::Envelope;
    use std::time::Duration;
    use tempfile::TempDir;

    fn serving_config(dir: &TempDir) -> NodeConfig {
        let compiled = dir.path().join("network.compiled");
        std::fs::write(&compiled, b"circuit").unwrap();

        let mut config = NodeConfig::default();
        config.models.insert(
            "mnist".to_string(),
            ModelPaths {
                compiled: Some(compiled),
                settings: None,
                srs: None,
            },
        );
        config.discovery.advertise_delay = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_connection_refreshes_advertisement() {
        let dir = TempDir::new().unwrap();
        let routing = MemoryRouting::new();
        let node = Arc::new(Node::new(serving_config(&dir), "server"));
        let listener = listen_tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::start(node, listener, routing.clone()).await.unwrap();

        let id = ContentId::for_service(&ServiceDescriptor::model("mnist")).unwrap();
        assert_eq!(routing.providers(&id).len(), 1);

        // Drop the startup record so only a re-announcement can restore it
        routing.withdraw(&PeerId::from("server"));
        assert!(routing.providers(&id).is_empty());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));

        let client_config = SessionConfig::new(PeerId::from("client"));
        let handler =
            Arc::new(|_: Envelope, _: InboundContext| async { Ok::<(), anyhow::Error>(()) });
        let stream = connect_tcp(addr).await.unwrap();
        let session = PeerSession::start(&client_config, stream, handler, None)
            .await
            .unwrap();

        let refreshed = tokio::time::timeout(Duration::from_secs(5), async {
            while routing.providers(&id).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok(), "no re-announcement after connect");

        let providers = routing.providers(&id);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, PeerId::from("server"));
        assert_eq!(providers[0].addrs, vec![addr.to_string()]);

        session.close();
        let _ = session.closed().await;
        stop_tx.send(()).unwrap();
        server_task.await.unwrap().unwrap();
        assert!(routing.providers(&id).is_empty());
    }

    #[test]
    fn test_serve_notice_names_dial_address() {
        let notice = process_local_notice(SocketAddr::from(([10, 0, 0, 7], 10333)));
        assert!(notice.contains("process-local"));
        assert!(notice.contains("10.0.0.7:10333"));
    }
}
