//! CLI entry point for twinhead-rs.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use twinhead_rs::{Result, RunConfig, Runner};

#[derive(Parser)]
#[command(name = "twinhead")]
#[command(about = "Dual-head text classification fine-tuning for pretrained encoders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Train and/or evaluate as configured
    Run {
        /// Path to configuration file
        config: String,
        /// Force training on
        #[arg(long)]
        do_train: bool,
        /// Force evaluation on the dev split
        #[arg(long)]
        do_eval: bool,
        /// Force prediction on the test split
        #[arg(long)]
        do_predict: bool,
        /// Overwrite a non-empty output directory
        #[arg(long)]
        overwrite_output_dir: bool,
        /// Rank of this process in a multi-process run
        #[arg(long)]
        local_rank: Option<usize>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Run preset (trac-bert, trac-mbert)
        #[arg(long, default_value = "trac-bert")]
        preset: String,
    },
}

impl Commands {
    /// Rank requested on the command line or by a launcher.
    fn local_rank(&self) -> Option<usize> {
        match self {
            Commands::Run {
                local_rank: Some(rank),
                ..
            } => Some(*rank),
            _ => std::env::var("LOCAL_RANK").ok().and_then(|v| v.parse().ok()),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Workers only report warnings unless RUST_LOG says otherwise.
    let default_level = match cli.command.local_rank() {
        Some(rank) if rank > 0 => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "{}", err.chain());
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = RunConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Task: {}", config.task_name);
            println!("  Model: {} ({})", config.model.model_name_or_path, config.model.model_type);
            println!("  Data: {}", config.data_dir);
            println!("  Output: {}", config.output_dir);
        }
        Commands::Run {
            config,
            do_train,
            do_eval,
            do_predict,
            overwrite_output_dir,
            local_rank,
        } => {
            tracing::info!("Starting run with config: {}", config);
            let mut config = RunConfig::from_file(&config)?;
            config.do_train |= do_train;
            config.do_eval |= do_eval;
            config.do_predict |= do_predict;
            config.overwrite_output_dir |= overwrite_output_dir;
            if local_rank.is_some() {
                config.distributed.local_rank = local_rank;
            }

            let outcome = Runner::new(config)?.run()?;
            if let Some((global_step, loss)) = outcome.training {
                println!("✓ Trained {global_step} steps, average loss {loss:.4}");
            }
            for (key, value) in &outcome.results {
                println!("  {key} = {value}");
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = RunConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
