use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mdpipe",
    version,
    about = "Restartable pipeline for replica-exchange molecular dynamics"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Silence all logging.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the selected pipeline stages for one parameter file.
    Run(RunArgs),
    /// Print the resolved parameters, replica ladder and resource split.
    Describe {
        params: PathBuf,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print a geometric temperature ladder with HREX lambda values.
    Ladder {
        #[arg(short = 'n', long)]
        n_replica: usize,
        #[arg(long)]
        tmin: f64,
        #[arg(long)]
        tmax: f64,
        /// Unbiased reference temperature; defaults to --tmin.
        #[arg(long)]
        tunbiased: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize neighbour exchange probabilities from an mdrun log.
    Exchange {
        log: PathBuf,
        /// Output directory; defaults to the log's directory.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter parameter file, pipeline definition and templates.
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("stages")
        .required(true)
        .multiple(true)
        .args(["initialize", "equilibrate", "production", "all"])
))]
pub struct RunArgs {
    /// Parameter file (KEY=value lines).
    pub params: PathBuf,

    /// Energy minimization.
    #[arg(long)]
    pub initialize: bool,
    /// NVT/NPT equilibration.
    #[arg(long)]
    pub equilibrate: bool,
    /// Production sampling followed by archival.
    #[arg(long)]
    pub production: bool,
    #[arg(long)]
    pub all: bool,

    /// Pipeline definition; defaults to pipeline.yaml next to PARAMS.
    #[arg(long)]
    pub pipeline: Option<PathBuf>,
    /// Directory the stage directories are created in; defaults to the
    /// directory holding PARAMS.
    #[arg(long)]
    pub root: Option<PathBuf>,
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set_values: Vec<String>,
    #[arg(long)]
    pub walltime_hours: Option<f64>,
    /// Re-hash recorded artifacts before trusting a completion record.
    #[arg(long)]
    pub verify_checksums: bool,
    #[arg(long)]
    pub json: bool,
}
