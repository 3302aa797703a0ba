use anyhow::Result;
use clap::Parser;

use user_cluster::{
    cli::{Cli, Command},
    primary, worker,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // Forked workers re-enter through the same binary; their role arrives
    // in the environment, set by the primary at fork time.
    if let Some(env) = worker::from_env()? {
        return worker::run(env).await;
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            primary::run(primary::PrimaryConfig {
                public_port: args.port,
                num_workers: args.effective_workers(),
            })
            .await
        }
    }
}
