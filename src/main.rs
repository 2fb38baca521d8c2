use anyhow::{bail, Context, Result};
use clap::Parser;
use confique::Config;
use drs4_daq::*;
use log::{error, info, LevelFilter};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

#[derive(Parser)]
#[command(name = "drs4-daq")]
#[command(about = "Acquire DRS4 waveforms into a chunked HDF5 dataset", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level for the file and terminal loggers
    #[arg(short, long, default_value = "info")]
    log_level: LevelFilter,

    /// Only log to the log file
    #[arg(long)]
    no_stderr: bool,

    /// Calibration table, overriding `calibration_file`
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Output file, overriding the `drs4-<obsid>.h5` default
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Use the simulated board instead of the configured backend
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let conf = Conf::builder()
        .env()
        .file(&cli.config)
        .load()
        .with_context(|| format!("loading {}", cli.config.display()))?;
    set_logger(&conf.run_settings.log_file, cli.log_level, !cli.no_stderr)
        .with_context(|| format!("opening log file {}", conf.run_settings.log_file))?;

    let mut settings = conf.session_settings()?;
    if let Some(output) = cli.output {
        settings.output_file = Some(output);
    }

    let calibration = match cli
        .calibration
        .or_else(|| conf.run_settings.calibration_file.as_ref().map(PathBuf::from))
    {
        Some(path) => CalibrationTable::load(&path)
            .with_context(|| format!("loading calibration {}", path.display()))?,
        None => {
            info!("No calibration table given, using nominal constants");
            CalibrationTable::ideal(&settings.link.channel_mask.channels())
        }
    };

    let backend: Box<dyn Digitizer> = if cli.simulate || conf.link_settings.backend == Backend::Sim
    {
        Box::new(SimulatedDigitizer::new(conf.sim_settings()))
    } else {
        Box::new(UdpDigitizer::new(conf.udp_settings()?))
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing the Ctrl-C handler")?;
    let flag = shutdown.clone();
    thread::spawn(move || {
        if stop_rx.recv().is_ok() {
            info!("Stop received");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let session = Session::new(settings, Arc::new(calibration))?;
    let summary = session.run(backend, shutdown)?;
    println!("{summary}");

    if let Some(fault) = &summary.fatal {
        error!("Run ended on a fault: {}", fault);
        bail!("run {} ended on a fault: {}", summary.obsid, fault);
    }
    Ok(())
}
