use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "iodump",
    version,
    about = "Run a model once on random inputs and archive its inputs and outputs"
)]
pub struct Cli {
    /// Path to the model file
    pub model: PathBuf,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Device for inference (cpu or cuda:N)
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Directory the archive is written to
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Seed for input generation; random when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Re-read the archive after writing and check its structure
    #[arg(long)]
    pub verify: bool,
}
