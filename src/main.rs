use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::current_num_threads;
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

mod assemble;
mod fields;
mod geometry;
mod tables;

use fields::{discover_fields, process_field, FieldOptions, FieldOutcome};
use tables::{TableColumns, TableFormat, CENTER_X_COLUMN, CENTER_Y_COLUMN, OUTLINE_COLUMN};

#[derive(Parser, Debug)]
#[command(name = "cellassign")]
#[command(version)]
#[command(about = "Assign segmented nuclei to the cytoplasm outlines containing them, one table pair per image field.")]
struct Args {
    /// Directory of `<id>_nuc-locations` and `<id>_cyto-outlines` tables
    input_dir: PathBuf,

    /// Directory receiving `<well>_<site>_nuc-segmented` and `_cyto-segmented` tables
    output_dir: PathBuf,

    #[arg(long, default_value = CENTER_X_COLUMN)]
    nuclei_x_column: String,

    #[arg(long, default_value = CENTER_Y_COLUMN)]
    nuclei_y_column: String,

    #[arg(long, default_value = OUTLINE_COLUMN)]
    outline_column: String,

    /// Nucleus tables hold outlines; use each outline's mean point as the center
    #[arg(long, default_value_t = false)]
    nuclei_outlines: bool,

    #[arg(long, value_enum, default_value_t = TableFormat::Tsv)]
    output_fmt: TableFormat,

    /// Re-assemble fields whose output already exists
    #[arg(long, default_value_t = false)]
    overwrite: bool,

    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Some(nthreads) = args.nthreads {
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()
        {
            warn!("Unable to set thread count: {}", err);
        }
    }
    info!("Using {} threads", current_num_threads());

    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(nfailed) => {
            error!("{} field(s) failed", nfailed);
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

// Returns the number of fields that failed.
fn run(args: Args) -> Result<usize, Box<dyn std::error::Error>> {
    let jobs = discover_fields(&args.input_dir)?;
    info!("Found {} fields in {}", jobs.len(), args.input_dir.display());
    if jobs.is_empty() {
        return Ok(0);
    }

    fs::create_dir_all(&args.output_dir)?;

    let options = FieldOptions {
        output_dir: args.output_dir,
        output_fmt: args.output_fmt,
        columns: TableColumns {
            nuclei_x: args.nuclei_x_column,
            nuclei_y: args.nuclei_y_column,
            outline: args.outline_column,
            nuclei_from_outlines: args.nuclei_outlines,
        },
        overwrite: args.overwrite,
    };

    let progress = ProgressBar::new(jobs.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} fields [{elapsed_precise}]")?,
    );

    let results: Vec<_> = jobs
        .par_iter()
        .map(|job| {
            let result = process_field(job, &options);
            progress.inc(1);
            (job, result)
        })
        .collect();
    progress.finish_and_clear();

    let mut nassembled = 0;
    let mut nskipped = 0;
    let mut ncells = 0;
    let mut nfailed = 0;
    for (job, result) in results {
        match result {
            Ok(FieldOutcome::Assembled { ncells: n, nnuclei, unmatched_nuclei }) => {
                info!(
                    "{}: {} cells, {} nuclei assigned, {} unassigned",
                    job.id, n, nnuclei, unmatched_nuclei
                );
                nassembled += 1;
                ncells += n;
            }
            Ok(FieldOutcome::AlreadyExists) => nskipped += 1,
            Err(err) => {
                error!("{}", err);
                nfailed += 1;
            }
        }
    }

    info!(
        "Assembled {} cells across {} fields ({} already present, {} failed)",
        ncells, nassembled, nskipped, nfailed
    );

    Ok(nfailed)
}
