//! Fedgate - federated Kubernetes API reverse proxy

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fedgate::backend::BackendPool;
use fedgate::cache::RouteCache;
use fedgate::dispatch::FederatedTypes;
use fedgate::filter::{self, RequestFilter};
use fedgate::identity::CertAuthenticator;
use fedgate::registry::{
    central_registry_client, local_backend_config, local_client, KubeRegistry,
};
use fedgate::server::{bind_tcp, bind_unix, build_router, serve, AppState, ServeSettings};
use fedgate::tls::{build_server_tls, TlsPaths};

const DEFAULT_PORT: u16 = 8001;

/// Fedgate - proxy kubectl traffic across a cluster federation
#[derive(Parser, Debug)]
#[command(name = "fedgate", version, about, long_about = None)]
struct Cli {
    /// Generate the federation CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a proxy to the federated Kubernetes API servers
    Proxy(ProxyArgs),
}

/// Proxy flags, kubectl-proxy compatible where they overlap
#[derive(Parser, Debug)]
struct ProxyArgs {
    /// The port on which to run the proxy. Set to 0 to pick a random port.
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// The IP address on which to serve on.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Unix socket on which to run the proxy.
    #[arg(long, short = 'u', default_value = "")]
    unix_socket: String,

    /// Also serve static files from the given directory under the specified prefix.
    #[arg(long = "www", short = 'w', default_value = "")]
    www: String,

    /// Prefix to serve static files under, if static file directory is specified.
    #[arg(long = "www-prefix", short = 'P', default_value = "/static/")]
    www_prefix: String,

    /// Prefix to serve the proxied API under.
    #[arg(long = "api-prefix", default_value = "/")]
    api_prefix: String,

    /// Regular expression for paths that the proxy should accept.
    #[arg(long, default_value = filter::DEFAULT_ACCEPT_PATHS)]
    accept_paths: String,

    /// Regular expression for paths that the proxy should reject. Paths
    /// specified here will be rejected even when accepted by --accept-paths.
    #[arg(long, default_value = filter::DEFAULT_REJECT_PATHS)]
    reject_paths: String,

    /// Regular expression for hosts that the proxy should accept.
    #[arg(long, default_value = filter::DEFAULT_ACCEPT_HOSTS)]
    accept_hosts: String,

    /// Regular expression for HTTP methods that the proxy should reject.
    #[arg(long, default_value = filter::DEFAULT_REJECT_METHODS)]
    reject_methods: String,

    /// Disable request filtering. This is dangerous and can leave you
    /// vulnerable to XSRF attacks, when used with an accessible port.
    #[arg(long, default_value_t = false)]
    disable_filter: bool,

    /// Keep-alive period in seconds for backend connections. Set to 0 to
    /// disable keepalive.
    #[arg(long, default_value_t = 0)]
    keepalive: u64,

    /// CA bundle used to verify client certificates.
    #[arg(long, default_value = "/var/lib/minikube/certs/ca.crt")]
    client_ca: PathBuf,

    /// Server TLS certificate.
    #[arg(long, default_value = "/var/lib/minikube/certs/apiserver.crt")]
    tls_cert: PathBuf,

    /// Server TLS private key.
    #[arg(long, default_value = "/var/lib/minikube/certs/apiserver.key")]
    tls_key: PathBuf,

    /// Comma-separated resource-type prefixes that are served by the
    /// master cluster, matched case-insensitively.
    #[arg(long, default_value = "federated")]
    federated_prefixes: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        use kube::CustomResourceExt;
        let placement = serde_yaml::to_string(&fedgate::crd::NamespacePlacement::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let cluster = serde_yaml::to_string(&fedgate::crd::FederatedCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{placement}---\n{cluster}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Proxy(args)) => run_proxy(args).await,
        None => anyhow::bail!("no command given; try `fedgate proxy --help`"),
    }
}

async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    if args.port != DEFAULT_PORT && !args.unix_socket.is_empty() {
        anyhow::bail!("don't specify both --unix-socket and --port");
    }

    let api_prefix = ensure_trailing_slash(&args.api_prefix);
    let static_prefix = ensure_trailing_slash(&args.www_prefix);

    let static_dir = if args.www.is_empty() {
        None
    } else {
        let meta = std::fs::metadata(&args.www)
            .map_err(|e| anyhow::anyhow!("static file directory {}: {}", args.www, e))?;
        if !meta.is_dir() {
            anyhow::bail!("static file directory {} is not a directory", args.www);
        }
        Some(PathBuf::from(&args.www))
    };

    let filter = if args.disable_filter {
        if args.unix_socket.is_empty() {
            tracing::warn!(
                "Request filter disabled, your proxy is vulnerable to XSRF attacks, \
                 please be cautious"
            );
        }
        None
    } else {
        Some(RequestFilter::from_patterns(
            &args.accept_paths,
            &args.reject_paths,
            &args.accept_hosts,
            &args.reject_methods,
        )?)
    };

    let keepalive = (args.keepalive > 0).then(|| Duration::from_secs(args.keepalive));

    // Local credentials first, then the central registry through the
    // well-known kubeconfig secret
    let local = local_client().await?;
    let central = central_registry_client(&local).await?;
    let registry = Arc::new(KubeRegistry::new(central, keepalive));
    tracing::info!("connected to central registry");

    let local_config = local_backend_config(keepalive).await?;
    let backends = Arc::new(BackendPool::new(registry.clone(), &local_config)?);

    let federated_types = FederatedTypes::new(
        args.federated_prefixes
            .split(',')
            .map(|s| s.trim().to_string()),
    );

    let state = AppState {
        registry,
        authenticator: Arc::new(CertAuthenticator::new(args.client_ca.clone())),
        backends,
        route_cache: Arc::new(RouteCache::default()),
        filter: filter.map(Arc::new),
        federated_types: Arc::new(federated_types),
        api_prefix,
    };

    let router = build_router(
        state,
        &ServeSettings {
            static_prefix,
            static_dir,
        },
    )?;

    let tls = build_server_tls(&TlsPaths {
        client_ca: args.client_ca.clone(),
        cert: args.tls_cert.clone(),
        key: args.tls_key.clone(),
    })?;

    // Bind before serving so an OS-assigned port can be reported
    let listener = if args.unix_socket.is_empty() {
        bind_tcp(&args.address, args.port).await?
    } else {
        bind_unix(Path::new(&args.unix_socket))?
    };

    println!("Starting to serve on {}", listener.local_addr_string());

    serve(listener, tls, router).await?;
    Ok(())
}

fn ensure_trailing_slash(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
