use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::TargetArgs;

#[derive(Parser)]
#[command(
    name = "scaleflip",
    about = "Blue/green rotation of Azure VM scale sets",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace every instance of a scale set with a fresh batch.
    ///
    /// Scales out, protects the new instances from scale-in, scales back in
    /// so the old instances are removed, then clears protection again.
    Rotate {
        #[command(flatten)]
        target: TargetArgs,
        /// Scale-out multiplier (overrides the config file)
        #[arg(long)]
        scale_out_factor: Option<f64>,
        /// Scale-in multiplier (overrides the config file)
        #[arg(long)]
        scale_in_factor: Option<f64>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Clear scale-in protection left behind by an aborted rotation
    Unprotect {
        #[command(flatten)]
        target: TargetArgs,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_format);

    match cli.command {
        Commands::Rotate {
            target,
            scale_out_factor,
            scale_in_factor,
            format,
        } => {
            commands::rotate::rotate(&target, scale_out_factor, scale_in_factor, &format).await
        }
        Commands::Unprotect { target, format } => {
            commands::unprotect::unprotect(&target, &format).await
        }
    }
}

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match log_format {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}
