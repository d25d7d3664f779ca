//! `optrace` command line
//!
//! ```sh
//! optrace run job.json -o out/
//! optrace rays job.json --rho 0.7
//! optrace validate job.json
//! optrace glasses --agf schott.agf
//! ```

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use optrace::{
    config::JobConfig, Aimer, ChannelSink, GlassCatalog, OpticalSystem, Paraxial, Progress,
};
use simple_logger::SimpleLogger;
use std::{fs, path::PathBuf, process, sync::Arc, thread};

#[derive(Parser)]
#[command(name = "optrace")]
#[command(about = "Ray tracing, wavefront, PSF and MTF analysis of optical systems")]
#[command(version)]
struct Cli {
    /// Verbosity: -v for info, -vv for debug
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the wavefront analysis of a JSON job file
    Run {
        config: PathBuf,
        /// Output directory for the CSV tables (overrides the job file)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Hides the progress bar
        #[arg(long)]
        quiet: bool,
    },
    /// Traces the chief ray and the four edge rays of the job field
    Rays {
        config: PathBuf,
        /// Pupil fraction of the edge rays
        #[arg(long, default_value_t = 1.0)]
        rho: f64,
    },
    /// Checks a job file and its surface table
    Validate { config: PathBuf },
    /// Lists the available glasses
    Glasses {
        #[arg(long)]
        agf: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("logger: {}", e);
    }
    if let Err(e) = run(cli.command) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run(command: Commands) -> optrace::Result<()> {
    match command {
        Commands::Run {
            config,
            output,
            quiet,
        } => {
            let job = JobConfig::from_path(&config)?;
            let catalog = job.catalog()?;
            println!("optrace: {}", config.display());

            let (tx, rx) = crossbeam_channel::unbounded::<Progress>();
            let bar = if quiet {
                ProgressBar::hidden()
            } else {
                ProgressBar::new(100)
            };
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{elapsed_precise} {bar:40.cyan/blue} {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let monitor = thread::spawn(move || {
                for progress in rx {
                    bar.set_position(progress.percent.round() as u64);
                    bar.set_message(format!("{}: {}", progress.phase, progress.message));
                }
                bar.finish_and_clear();
            });
            let report = job
                .analysis()
                .set_progress(Arc::new(ChannelSink(tx)))
                .build(job.system.surfaces.clone(), &catalog)
                .and_then(|analysis| analysis.run());
            // the sender is dropped with the analysis, closing the channel
            if monitor.join().is_err() {
                log::warn!("progress bar thread panicked");
            }
            let report = report?;

            println!("{}", report);
            if let Some(fit) = report.zernike() {
                print!("{}", fit);
            }
            for (r, ee) in report.psf.ee_radii.iter().zip(&report.psf.ee_values) {
                println!("EE({:.3}µm) = {:.4}", r, ee);
            }
            for path in job.write_outputs(&report, output.as_deref())? {
                println!("written: {}", path.display());
            }
            Ok(())
        }
        Commands::Rays { config, rho } => {
            let job = JobConfig::from_path(&config)?;
            let analysis = job
                .analysis()
                .build(job.system.surfaces.clone(), &job.catalog()?)?;
            let rays = Aimer::new(analysis.system(), job.field)?.edge_rays(rho)?;
            for (name, trace) in ["chief", "up", "down", "left", "right"]
                .iter()
                .zip(rays.polylines())
            {
                println!("{}:\n{}", name, trace);
            }
            Ok(())
        }
        Commands::Validate { config } => {
            let job = JobConfig::from_path(&config)?;
            let system = OpticalSystem::new(
                job.system.surfaces.clone(),
                job.wavelengths.primary,
                &job.catalog()?,
            )?;
            println!("{}", system);
            let paraxial = Paraxial::new(&system);
            let first_order = if system.is_infinite_object() {
                paraxial
                    .entrance_pupil_diameter()
                    .map(|d| format!("EPD {:.4}mm", d))
            } else {
                paraxial.object_na().map(|na| format!("object NA {:.5}", na))
            };
            match (paraxial.efl(), paraxial.bfl(), first_order) {
                (Ok(efl), Ok(bfl), Ok(pupil)) => {
                    println!("EFL {:.4}mm BFL {:.4}mm {}", efl, bfl, pupil)
                }
                (efl, bfl, pupil) => log::warn!(
                    "first order properties unavailable: {:?}",
                    efl.err().or(bfl.err()).or(pupil.err())
                ),
            }
            println!("configuration is valid: {}", config.display());
            Ok(())
        }
        Commands::Glasses { agf } => {
            let mut catalog = GlassCatalog::builtin();
            if let Some(path) = agf {
                let text = fs::read_to_string(&path).map_err(|e| {
                    optrace::Error::invalid_input("glasses", format!("{}: {}", path.display(), e))
                })?;
                catalog.merge(GlassCatalog::parse_agf(&text)?);
            }
            println!("{:<16} {:>8} {:>7}", "glass", "nd", "vd");
            for name in catalog.names() {
                if let Some(glass) = catalog.get(name) {
                    println!("{:<16} {:>8.5} {:>7.2}", name, glass.nd, glass.vd);
                }
            }
            Ok(())
        }
    }
}
