use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the cluster primary: fork the workers and route messages.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Public port the balancer binds. Falls back to the PORT environment
    /// variable, then 4000.
    #[arg(long, default_value_t = default_port())]
    pub port: u16,

    /// Number of HTTP workers to fork (one balancer plus regulars).
    /// Defaults to the host CPU count; at least two so the balancer
    /// always has a target.
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

impl ServeArgs {
    /// Worker count with the topology minimum applied.
    pub fn effective_workers(&self) -> usize {
        self.workers.max(2)
    }
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(4000)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2)
        .max(2)
}
