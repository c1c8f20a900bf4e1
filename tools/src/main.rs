//! `dynacomp`: left-ventricle model pipeline, PV loops and data organisation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "dynacomp")]
#[command(version, about = "Left-ventricle biomechanics from segmentation to PV loop")]
struct Cli {
    /// Log debug messages (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tag a Gmsh mesh and compute its microstructure.
    Geometry {
        /// Gmsh 4.1 mesh with Epi, Endo and Base surface groups.
        #[arg(short, long)]
        mesh: PathBuf,

        /// Configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the geometry.
        #[arg(short, long, default_value = "geometry.json")]
        out: PathBuf,
    },

    /// Inflate a geometry to end-diastole and follow a load path.
    Simulate {
        /// Geometry written by `dynacomp geometry`.
        #[arg(short, long)]
        geometry: PathBuf,

        /// Configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// End-diastolic pressure in kPa.
        #[arg(long)]
        edp: f64,

        /// CSV of (activation, pressure) pairs to step through after end-diastole.
        #[arg(short, long)]
        load: Option<PathBuf>,

        /// Output directory.
        #[arg(short, long, default_value = "results")]
        outdir: PathBuf,
    },

    /// Extract an averaged PV loop from a multi-beat recording.
    PvLoop {
        /// CSV recording with pressure and volume columns.
        #[arg(short, long)]
        data: PathBuf,

        /// Zero-based column of the pressure channel.
        #[arg(long, default_value_t = 1)]
        p_channel: usize,

        /// Zero-based column of the volume channel.
        #[arg(long, default_value_t = 2)]
        v_channel: usize,

        /// Where to write the loop.
        #[arg(short, long, default_value = "PV_data.csv")]
        out: PathBuf,

        /// Also write a smoothed, resampled loop here.
        #[arg(long)]
        smoothed: Option<PathBuf>,
    },

    /// Sort raw experiment files into the study directory tree.
    Organize {
        /// Master sheet exported as CSV.
        #[arg(short, long)]
        excel: PathBuf,

        /// Sample id, or `all` to process every sample.
        #[arg(short, long, default_value = "all")]
        sample: String,

        /// Root of the directory tree.
        #[arg(short, long, default_value = ".")]
        outdir: PathBuf,

        /// Create the directories and copy the files.
        #[arg(short, long)]
        mkdir: bool,

        /// Directory of the segmentation files.
        #[arg(long, default_value = "Raw Data/Segmentation")]
        segdir: PathBuf,

        /// Directory of the PV files.
        #[arg(long, default_value = "Raw Data/PV")]
        pvdir: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    dynacomp_tools::logging::init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Geometry { mesh, config, out } => {
            commands::geometry(&mesh, config.as_deref(), &out)
        }
        Commands::Simulate {
            geometry,
            config,
            edp,
            load,
            outdir,
        } => commands::simulate(&geometry, config.as_deref(), edp, load.as_deref(), &outdir),
        Commands::PvLoop {
            data,
            p_channel,
            v_channel,
            out,
            smoothed,
        } => commands::pv_loop(&data, p_channel, v_channel, &out, smoothed.as_deref()),
        Commands::Organize {
            excel,
            sample,
            outdir,
            mkdir,
            segdir,
            pvdir,
        } => commands::organize(
            &excel,
            &sample,
            dynacomp_tools::organize::OrganizeOptions {
                outdir,
                mkdir,
                segdir,
                pvdir,
            },
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
