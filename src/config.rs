use clap::Parser;

/// Infrastructure configuration: everything needed to find the external policy store
/// and bind the two listening ports. Business configuration and security policy are
/// never read from here — they come exclusively from the store (see `store` module).
#[derive(Parser, Debug, Clone)]
#[command(name = "ingress-gateway", version)]
pub struct GatewayArgs {
    /// URL of the external key-value/pub-sub store (e.g. redis://127.0.0.1:6379).
    #[arg(long, env = "STORE_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// Key prefix used for all store keys and the pub/sub channel.
    #[arg(long, env = "STORE_PREFIX", default_value = "gateway:")]
    pub store_prefix: String,

    /// Override for the listener bind address; if unset, the business config's
    /// listen_addr is used.
    #[arg(long, env = "LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Metrics/health/ready bind address.
    #[arg(long, env = "MGMT_ADDR", default_value = "0.0.0.0:9090")]
    pub mgmt_addr: String,

    /// Attempt to enable kernel socket-redirect acceleration for TCP sessions.
    #[arg(long, env = "ENABLE_KERNEL_REDIRECT", default_value_t = false)]
    pub enable_kernel_redirect: bool,

    /// Load business config and security policy, log a summary, and exit without
    /// binding any listener.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

/// Initializes the global tracing subscriber from `RUST_LOG` (default `info`),
/// switching to JSON output when `LOG_FORMAT=json` is set.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
