//! dns-masquerade binary entry point.

use clap::Parser;
use dns_masquerade::config::{IngressConfig, IntentConfig};
use dns_masquerade::dependents::ANNOTATION_MASQUERADE_TO;
use dns_masquerade::resolver::endpoint_source;
use dns_masquerade::resources::INGRESS_API_VERSION;
use dns_masquerade::store::WatchEvent;
use dns_masquerade::{
    telemetry, Config, ConfigResource, Controller, DependentController, DependentManager, HickoryLookup, Ingress,
    IntentAdmission, MemoryStore, ObjectStore, Reconciler, ReconcilerSettings, Resolver, RewriteIntent,
    ServiceEndpoints, TcpRelayProvider,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reconciles DNS rewrite intents into a shared resolver configuration.
#[derive(Parser, Debug)]
#[command(name = "dns-masquerade")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "dns-masquerade.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("DNS_MASQUERADE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    config.validate()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        artifact = %format!("{}/{}", config.controller.artifact_namespace, config.controller.artifact_name),
        endpoints = config.resolver.endpoints.len(),
        in_cluster = config.resolver.in_cluster,
        "Starting dns-masquerade"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let intents = MemoryStore::<RewriteIntent>::new();
    let configs = MemoryStore::<ConfigResource>::new();
    let ingresses = MemoryStore::<Ingress>::new();
    let services = MemoryStore::<ServiceEndpoints>::new();
    seed_intents(&intents, &config.intents).await;
    seed_ingresses(&ingresses, &config.ingresses).await;

    let settings = ReconcilerSettings::from(&config.controller);
    let sink = config.controller.artifact_file.clone().map(|path| {
        tokio::spawn(write_artifact_file(
            configs.clone(),
            settings.artifact_key.clone(),
            path,
            shutdown.clone(),
        ))
    });

    if config.resolver.endpoints.is_empty() {
        info!(
            service = %format!("{}/{}", config.resolver.discovery_namespace, config.resolver.discovery_service),
            "No DNS endpoints configured; discovering them from the cluster DNS service"
        );
    }
    let resolver = Resolver::new(
        Arc::new(HickoryLookup::new(config.resolver.dial_timeout())),
        endpoint_source(&config.resolver, Arc::new(services)),
    )
    .with_tunnels(Arc::new(TcpRelayProvider::new(config.resolver.tunnel_routes())))
    .in_cluster(config.resolver.in_cluster)
    .with_tunnel_timeout(config.resolver.tunnel_timeout())
    .with_shutdown(shutdown.clone());

    let dependents = DependentController::new(DependentManager::new(
        Arc::new(ingresses),
        Arc::new(intents.clone()),
        INGRESS_API_VERSION,
        config.controller.finalizer.clone(),
    ));
    let dependents = tokio::spawn(dependents.run(shutdown.clone()));

    let reconciler = Reconciler::new(
        Arc::new(intents.clone()),
        Arc::new(configs),
        Arc::new(resolver),
        settings,
    );
    let controller = Controller::new(Arc::new(intents), reconciler, config.controller.workers);
    let result = controller.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(sink) = sink {
        let _ = sink.await;
    }
    match dependents.await {
        Ok(Err(e)) => error!("Dependent controller error: {}", e),
        Err(e) => error!("Dependent controller panicked: {}", e),
        Ok(Ok(())) => {}
    }

    if let Err(e) = result {
        error!("Controller error: {}", e);
        return Err(e.into());
    }

    info!("dns-masquerade shutdown complete");
    Ok(())
}

/// Admit and store the intents declared in the configuration.
async fn seed_intents(store: &MemoryStore<RewriteIntent>, declared: &[IntentConfig]) {
    let admission = IntentAdmission::default();
    for entry in declared {
        let intent = RewriteIntent::new(&entry.namespace, &entry.name, &entry.from, &entry.to);
        if let Err(e) = admission.validate_create(&intent) {
            warn!(intent = %intent.meta.key(), error = %e, "Rejected intent");
            continue;
        }
        match store.create(intent).await {
            Ok(intent) => info!(intent = %intent.meta.key(), from = %entry.from, to = %entry.to, "Seeded intent"),
            Err(e) => warn!(name = %entry.name, error = %e, "Failed to seed intent"),
        }
    }
}

/// Store the ingresses declared in the configuration.
async fn seed_ingresses(store: &MemoryStore<Ingress>, declared: &[IngressConfig]) {
    for entry in declared {
        let mut ingress = Ingress::new(&entry.namespace, &entry.name, entry.hosts.clone());
        if let Some(to) = &entry.masquerade_to {
            ingress
                .meta
                .annotations
                .insert(ANNOTATION_MASQUERADE_TO.to_string(), to.clone());
        }
        match store.create(ingress).await {
            Ok(ingress) => info!(ingress = %ingress.meta.key(), hosts = entry.hosts.len(), "Seeded ingress"),
            Err(e) => warn!(name = %entry.name, error = %e, "Failed to seed ingress"),
        }
    }
}

/// Mirror the artifact into a file for servers that import one.
async fn write_artifact_file(
    configs: MemoryStore<ConfigResource>,
    key: String,
    path: PathBuf,
    shutdown: CancellationToken,
) {
    let mut events = configs.watch();
    loop {
        let resource = tokio::select! {
            biased;

            _ = shutdown.cancelled() => return,

            event = events.next() => match event {
                Some(WatchEvent::Created(resource)) | Some(WatchEvent::Updated { new: resource, .. }) => resource,
                Some(WatchEvent::Deleted(_)) => continue,
                None => return,
            },
        };

        let text = resource.data.get(&key).cloned().unwrap_or_default();
        match tokio::fs::write(&path, text).await {
            Ok(()) => info!(path = %path.display(), "Artifact file written"),
            Err(e) => error!(path = %path.display(), "Failed to write artifact file: {}", e),
        }
    }
}
