mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use iodump_backend_ort::OrtBackend;
use iodump_core::{Device, ModelArtifact};
use iodump_runtime::{archive_file_name, execute, load_model, read_archive, write_archive};
use rand::{rngs::StdRng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid --log filter")?)
        .with_writer(std::io::stderr)
        .init();

    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let device = parse_device(&cli.device)?;
    let artifact = ModelArtifact::from_path(&cli.model)?;
    let model_name = artifact.file_name()?;

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let outcome = {
        let mut model = load_model(&OrtBackend::new(), &artifact, device)?;
        execute(&mut model, &mut rng)?
    };

    let path = cli.out_dir.join(archive_file_name(&model_name));
    write_archive(&path, &model_name, &outcome.inputs, &outcome.outputs)?;

    if cli.verify {
        read_archive(&path)?
            .check_structure(&outcome.inputs, &outcome.outputs)
            .with_context(|| format!("archive {} failed verification", path.display()))?;
        tracing::info!(path = %path.display(), "archive verified");
    }

    println!("{}", path.display());
    Ok(())
}

fn parse_device(raw: &str) -> Result<Device> {
    if raw.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }

    if let Some(rest) = raw.strip_prefix("cuda:") {
        let device_id: u32 = rest.parse().context("invalid cuda device id")?;
        return Ok(Device::Cuda { device_id });
    }

    anyhow::bail!("unsupported device: {raw} (expected cpu or cuda:N)");
}
