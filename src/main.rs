// neuroprior binary
//
// Commands:
//   neuroprior train [config.json ...] [--key=value ...]   Train (options resolved left to right)
//   neuroprior inspect <ckpt-*.pth>                         Print a checkpoint's run state
//
// Exit status 1 on any error, with the full error chain printed.

use clap::{Parser, Subcommand};
use neuroprior::checkpoint::summarize_checkpoint;
use neuroprior::config::RunConfig;
use neuroprior::error::TrainError;
use neuroprior::eval::tail_mean;
use neuroprior::pipeline;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "neuroprior")]
#[command(about = "Train voxel-to-CLIP diffusion priors on fMRI shards")]
struct Cli {
    /// Log at debug level.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run training.
    Train {
        /// JSON config files and --key=value overrides, applied in order.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Summarize a checkpoint file.
    Inspect {
        checkpoint: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(false).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    if let Err(e) = dispatch(cli.command) {
        match e.downcast_ref::<TrainError>() {
            Some(te) if te.is_config_error() => eprintln!("configuration error: {e:#}"),
            _ => eprintln!("error: {e:#}"),
        }
        std::process::exit(1);
    }
}

fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Train { args } => {
            let config = RunConfig::from_args(&args)?;
            let state = pipeline::run(&config)?;
            println!(
                "finished epoch {} | best val loss {:.4} | {} train steps",
                state.epoch,
                state.best_val_loss,
                state.train_losses.len()
            );
        }
        Command::Inspect { checkpoint } => {
            let s = summarize_checkpoint(&checkpoint)?;
            println!("checkpoint      {}", checkpoint.display());
            println!("epoch           {}", s.state.epoch);
            println!("best val loss   {:.4}", s.state.best_val_loss);
            println!("optimizer step  {}", s.state.optimizer_step);
            println!("scheduler step  {}", s.state.scheduler_step);
            println!("parameters      {} in {} tensors", s.model_params, s.model_tensors);
            println!("optimizer state {} tensors", s.optimizer_tensors);
            println!("train loss      {:.4} (last 100 steps)", tail_mean(&s.state.train_losses, 100));
            println!("val loss        {:.4} (last 100 steps)", tail_mean(&s.state.val_losses, 100));
        }
    }
    Ok(())
}
