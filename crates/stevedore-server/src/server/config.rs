use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `stevedore-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is honored), with defaults suitable for local experimentation.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "stevedore-server",
    version,
    about = "An HTTP service that runs requests on a fixed pool of worker threads"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Number of worker threads, and therefore the maximum number of jobs
    /// executing at once. Requests beyond that wait in the pool's queue.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Simulated work per job, in milliseconds. A job stops early once its
    /// submitter has timed out.
    ///
    /// Environment variable: `JOB_DELAY_MS`
    #[arg(long, env = "JOB_DELAY_MS", default_value_t = 100)]
    pub job_delay_ms: u64,

    /// How long `POST /work` waits for a result before answering 408.
    ///
    /// Environment variable: `JOB_TIMEOUT_MS`
    #[arg(long, env = "JOB_TIMEOUT_MS", default_value_t = 1_000)]
    pub job_timeout_ms: u64,

    /// Name the pool's counters are published under in `GET /debug/vars`.
    ///
    /// Environment variable: `METRICS_NAME`
    #[arg(long, env = "METRICS_NAME", default_value_t = String::from("echo"))]
    pub metrics_name: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub job_delay: Duration,
    pub job_timeout: Duration,
    pub metrics_name: String,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.job_timeout_ms == 0 {
            bail!("JOB_TIMEOUT_MS must be greater than 0");
        }

        if args.metrics_name.trim().is_empty() {
            bail!("METRICS_NAME must not be empty");
        }

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            job_delay: Duration::from_millis(args.job_delay_ms),
            job_timeout: Duration::from_millis(args.job_timeout_ms),
            metrics_name: args.metrics_name,
        })
    }
}
