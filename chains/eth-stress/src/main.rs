use anyhow::Result;
use clap::Parser;
use core_logic::{
    arm_force_exit, listen_for_shutdown, setup_logger, ConfirmationMode, StatsSnapshot,
};
use dotenv::dotenv;
use eth_stress::config::DEFAULT_CONFIG_PATH;
use eth_stress::rpc::EthersDialer;
use eth_stress::{StressConfig, StressRun};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    #[arg(long)]
    rpc_url: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    /// Hex encoded transaction data
    #[arg(long)]
    payload: Option<String>,
    #[arg(long)]
    retry: Option<u32>,
    #[arg(long)]
    max_open_connection: Option<u64>,
    #[arg(long)]
    max_transaction: Option<u64>,
    #[arg(long)]
    target_tps: Option<u32>,
    /// Use eth_sendTransactionAsync and wait for callbacks
    #[arg(long = "async")]
    async_mode: bool,
    #[arg(long, value_enum)]
    confirmation_mode: Option<ModeArg>,
    #[arg(short, long)]
    export_metrics: Option<String>,
    #[arg(long, default_value = "30")]
    metrics_interval: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Auto,
    Subscription,
    Polling,
}

impl From<ModeArg> for ConfirmationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => ConfirmationMode::Auto,
            ModeArg::Subscription => ConfirmationMode::Subscription,
            ModeArg::Polling => ConfirmationMode::Polling,
        }
    }
}

impl Args {
    fn apply(&self, config: &mut StressConfig) {
        if let Some(rpc_url) = &self.rpc_url {
            config.rpc_url = rpc_url.clone();
        }
        if self.from.is_some() {
            config.from = self.from.clone();
        }
        if self.to.is_some() {
            config.to = self.to.clone();
        }
        if let Some(payload) = &self.payload {
            config.payload = payload.clone();
        }
        if let Some(retry) = self.retry {
            config.retry = retry;
        }
        if let Some(n) = self.max_open_connection {
            config.max_open_connection = n;
        }
        if let Some(n) = self.max_transaction {
            config.max_transaction = n;
        }
        if self.target_tps.is_some() {
            config.target_tps = self.target_tps;
        }
        if self.async_mode {
            config.async_mode = true;
        }
        if let Some(mode) = self.confirmation_mode {
            config.confirmation_mode = mode.into();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_guard = setup_logger();
    dotenv().ok();

    let args = Args::parse();
    info!("Loading config from: {}", args.config);

    let mut config = match StressConfig::load(Some(args.config.as_str())) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {:#}", e);
            drop(log_guard);
            std::process::exit(2);
        }
    };
    args.apply(&mut config);

    let shutdown = CancellationToken::new();
    listen_for_shutdown(shutdown.clone());
    let force_exit = arm_force_exit(
        shutdown.clone(),
        Duration::from_millis(config.grace_period_ms),
    );

    let dialer = Arc::new(EthersDialer::new(config.rpc_url.as_str()));
    let run = StressRun::new(config, dialer, shutdown.clone());
    let latest = run.latest_stats();

    let metrics_task = args.export_metrics.clone().map(|path| {
        let latest = latest.clone();
        let interval_secs = args.metrics_interval.max(1);
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                export_latest(&latest, &path).await;
            }
        })
    });

    let outcome = run.run().await;
    // Completion cancels the token too; the run is already unwound here.
    force_exit.abort();

    if let Some(task) = metrics_task {
        task.abort();
    }
    if let Some(path) = &args.export_metrics {
        export_latest(&latest, path).await;
    }

    match outcome {
        Ok(report) => {
            info!(
                sent = report.sent,
                confirmed = report.confirmed,
                "Stress run completed"
            );
            Ok(())
        }
        Err(e) => {
            error!("Stress run failed: {:#}", e);
            drop(log_guard);
            std::process::exit(1);
        }
    }
}

async fn export_latest(latest: &watch::Receiver<Option<StatsSnapshot>>, path: &str) {
    let snapshot = latest.borrow().clone();
    let Some(snapshot) = snapshot else {
        return;
    };
    match snapshot.export_to_file(path).await {
        Ok(_) => info!("Metrics exported to {}", path),
        Err(e) => error!("Metrics export failed: {}", e),
    }
}
