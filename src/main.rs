//! CLI entry point for simplon-sim
//!
//! Stream a master file to a ZeroMQ PULL consumer:
//! ```bash
//! simplon-sim run /data/lysozyme_master.h5 --series 2 --triggers 3
//! ```
//!
//! Stream synthetic frames, no HDF5 needed:
//! ```bash
//! simplon-sim run --synthetic 512x512x20 --compression none
//! ```
//!
//! Show what a master file would publish:
//! ```bash
//! simplon-sim inspect /data/lysozyme_master.h5
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use simplon_sim::codec::Compression;
use simplon_sim::config::SimulatorConfig;
use simplon_sim::dataset::memory::{MemoryCatalog, SimulatedAcquisition};
use simplon_sim::dataset::{default_opener, DatasetOpener, MetadataIndex, PixelType};
use simplon_sim::logging;
use simplon_sim::messages::build_templates;
use simplon_sim::stream::{DetectorActor, DetectorHandle, LoadRequest, StreamEngine, ZmqPushTransport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "simplon-sim")]
#[command(about = "Simulated photon-counting detector streaming stream2 CBOR over ZeroMQ", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a dataset and stream arm / trigger / disarm series
    Run(RunArgs),

    /// Print the data files and resolved start message of a master file
    Inspect {
        master: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Master file; defaults to stream.hdf5_master_file
    master: Option<PathBuf>,

    /// Synthetic dataset WIDTHxHEIGHTxFRAMES instead of a master file
    #[arg(long, conflicts_with = "master")]
    synthetic: Option<String>,

    /// Element type of synthetic frames (uint16 or uint32)
    #[arg(long, default_value = "uint32")]
    pixel_type: String,

    /// PUSH endpoint to bind
    #[arg(long)]
    address: Option<String>,

    /// bslz4 or none
    #[arg(long)]
    compression: Option<String>,

    /// Number of data files to load
    #[arg(long, conflicts_with = "all_data_files")]
    data_files: Option<usize>,

    /// Load every data file of the master
    #[arg(long)]
    all_data_files: bool,

    /// Pause before each image message, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Images per trigger; defaults to ntrigger x nimages of the dataset
    #[arg(long)]
    frames_per_trigger: Option<u64>,

    /// JSON copied into user_data of each start message
    #[arg(long)]
    header_appendix: Option<String>,

    /// Number of arm / disarm series
    #[arg(long, default_value = "1")]
    series: u32,

    /// Triggers per series
    #[arg(long, default_value = "1")]
    triggers: u32,

    /// Wait before the first series so consumers can connect
    #[arg(long, default_value = "1000")]
    startup_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SimulatorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Inspect { master } => inspect(&master),
    }
}

fn parse_synthetic(shape: &str, pixel_type: PixelType) -> Result<SimulatedAcquisition> {
    let dims: Vec<usize> = shape
        .split('x')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("synthetic dataset '{shape}' must look like 512x512x20"))?;
    let [width, height, frames] = dims[..] else {
        bail!("synthetic dataset '{shape}' must look like 512x512x20");
    };
    if width == 0 || height == 0 || frames == 0 {
        bail!("synthetic dataset dimensions must be non-zero");
    }
    Ok(SimulatedAcquisition::new(width, height, frames, pixel_type))
}

async fn run(mut config: SimulatorConfig, args: RunArgs) -> Result<()> {
    if let Some(address) = args.address {
        config.stream.zmq_address = address;
    }
    if let Some(compression) = args.compression {
        config.stream.compression = compression;
    }
    if let Some(delay) = args.delay_ms {
        config.stream.delay_between_frames_ms = delay;
    }
    if args.all_data_files {
        config.stream.number_of_data_files = None;
    } else if let Some(count) = args.data_files {
        config.stream.number_of_data_files = Some(count);
    }
    if let Some(master) = args.master {
        config.stream.hdf5_master_file = Some(master);
    }
    config.validate().map_err(|e| anyhow!(e))?;
    let compression = config.compression().map_err(|e| anyhow!(e))?;

    let (opener, path): (Arc<dyn DatasetOpener>, PathBuf) = match &args.synthetic {
        Some(shape) => {
            let pixel_type = args.pixel_type.parse::<PixelType>()?;
            let dataset = parse_synthetic(shape, pixel_type)?.build()?;
            let path = PathBuf::from(format!("synthetic://{shape}"));
            let catalog: Arc<dyn DatasetOpener> =
                Arc::new(MemoryCatalog::new().with_dataset(path.clone(), dataset));
            (catalog, path)
        }
        None => {
            let path = config
                .stream
                .hdf5_master_file
                .clone()
                .context("no master file given; pass one or use --synthetic")?;
            let opener: Arc<dyn DatasetOpener> = Arc::from(default_opener());
            (opener, path)
        }
    };

    let transport = ZmqPushTransport::bind(&config.stream.zmq_address).await?;
    let engine = StreamEngine::new(transport, opener)
        .with_frame_delay(config.stream.frame_delay())
        .with_compression(compression);
    let (detector, task) = DetectorActor::spawn(engine);

    info!(
        address = %config.stream.zmq_address,
        path = %path.display(),
        compression = %compression,
        delay_ms = config.stream.delay_between_frames_ms,
        data_files = ?config.stream.number_of_data_files,
        "Starting simulator"
    );

    detector
        .load(LoadRequest::new(&path, compression, config.stream.number_of_data_files))
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(frames) = args.frames_per_trigger {
        detector.set_frames_per_trigger(frames).await?;
    }
    if let Some(appendix) = &args.header_appendix {
        let value: serde_json::Value = serde_json::from_str(appendix).context("parsing --header-appendix")?;
        detector.set_header_appendix(value).await?;
    }

    tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;

    tokio::select! {
        result = run_series(&detector, args.series, args.triggers) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    detector.shutdown().await?;
    task.await.context("detector actor panicked")?;
    Ok(())
}

async fn run_series(detector: &DetectorHandle, series: u32, triggers: u32) -> Result<()> {
    for _ in 0..series {
        let sequence_id = detector.arm().await?;
        for trigger in 0..triggers {
            let summary = detector.trigger().await?;
            info!(
                sequence_id,
                trigger,
                frames = summary.frames_sent,
                frame_rate = summary.frame_rate,
                "Trigger finished"
            );
        }
        detector.disarm().await?;
    }
    Ok(())
}

fn inspect(master: &Path) -> Result<()> {
    let opener = default_opener();
    let source = opener
        .open(master)
        .with_context(|| format!("opening {}", master.display()))?;
    let names = source.data_file_names()?;
    let first = names
        .first()
        .with_context(|| format!("{} references no data files", master.display()))?;
    let block = source.read_frames(first)?;
    let index = MetadataIndex::build(source.as_ref())?;
    let templates = build_templates(&index, block.frame_shape(), block.pixel_type())?;

    println!("Master file: {}", master.display());
    println!("Data files ({}):", names.len());
    for name in &names {
        println!("  {name}");
    }
    println!(
        "Frame shape: {} x {} ({}), {} frames in {first}",
        block.height,
        block.width,
        block.pixel_type(),
        block.frames
    );
    println!("Default compression: {}", Compression::default());
    println!("Start message:");
    println!("{}", serde_json::to_string_pretty(&templates.start)?);
    Ok(())
}
