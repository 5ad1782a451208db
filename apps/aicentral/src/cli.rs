use clap::Parser;

/// CLI/env surface for the gateway binary. Precedence is CLI flag > env var
/// > default, which `clap`'s `env` feature gives us for free per field.
#[derive(Debug, Clone, Parser)]
#[command(name = "aicentral", version, about = "Reverse proxy gateway for Azure OpenAI / OpenAI-shaped inference APIs")]
pub struct CliArgs {
    /// Path to the pipeline configuration document (JSON).
    #[arg(long, env = "AICENTRAL_CONFIG")]
    pub config: String,

    /// Bind address, host:port.
    #[arg(long, env = "AICENTRAL_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Outbound proxy for upstream requests, if any.
    #[arg(long, env = "AICENTRAL_PROXY")]
    pub proxy: Option<String>,

    /// Seconds to wait for in-flight requests to finish after a shutdown
    /// signal before the process exits anyway.
    #[arg(long, env = "AICENTRAL_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}
