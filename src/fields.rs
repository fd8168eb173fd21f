use log::{info, warn};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::assemble::{assemble, AssembleError};
use crate::tables::{
    read_cytoplasm_table, read_nuclei_table, write_cytoplasm_table, write_nucleus_table,
    TableColumns, TableError, TableFormat,
};

pub const NUCLEI_INPUT_SUFFIX: &str = "_nuc-locations";
pub const CYTOPLASM_INPUT_SUFFIX: &str = "_cyto-outlines";
pub const NUCLEI_OUTPUT_SUFFIX: &str = "_nuc-segmented";
pub const CYTOPLASM_OUTPUT_SUFFIX: &str = "_cyto-segmented";

#[derive(Error, Debug)]
pub enum FieldError {
    #[error("'{0}' does not look like well_plate_channel_site")]
    BadIdentifier(String),

    #[error("unable to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("field {field}: {source}")]
    Assemble {
        field: FieldId,
        #[source]
        source: AssembleError,
    },
}

/// One imaged site within one well.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub well: String,
    pub site: String,
}

impl FieldId {
    /// Parse identifiers such as `B7_01_1_3_DAPI_001_illumcorrect`, laid out
    /// as well, plate, channel, site and then anything else.
    pub fn parse(identifier: &str) -> Result<FieldId, FieldError> {
        let parts: Vec<&str> = identifier.split('_').collect();
        if parts.len() < 4 || parts[0].is_empty() || parts[3].is_empty() {
            return Err(FieldError::BadIdentifier(identifier.to_string()));
        }

        Ok(FieldId {
            well: parts[0].to_string(),
            site: parts[3].to_string(),
        })
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.well, self.site)
    }
}

/// Segmentation tables for one field, ready to assemble.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldJob {
    pub id: FieldId,
    pub nuclei_path: PathBuf,
    pub cytoplasm_path: PathBuf,
}

impl FieldJob {
    pub fn nuclei_output(&self, output_dir: &Path, fmt: TableFormat) -> PathBuf {
        output_dir.join(format!("{}{}.{}", self.id, NUCLEI_OUTPUT_SUFFIX, fmt.extension()))
    }

    pub fn cytoplasm_output(&self, output_dir: &Path, fmt: TableFormat) -> PathBuf {
        output_dir.join(format!("{}{}.{}", self.id, CYTOPLASM_OUTPUT_SUFFIX, fmt.extension()))
    }
}

fn nuclei_input_regex() -> &'static Regex {
    static NUCLEI: OnceLock<Regex> = OnceLock::new();
    NUCLEI.get_or_init(|| {
        let pattern = format!(
            r"^(?P<identifier>.+){}\.(?P<ext>(?:csv|tsv|txt)(?:\.gz)?)$",
            regex::escape(NUCLEI_INPUT_SUFFIX)
        );
        Regex::new(&pattern).unwrap()
    })
}

/// Pair every `<identifier>_nuc-locations.<ext>` table in `input_dir` with
/// its `<identifier>_cyto-outlines.<ext>` partner. Fields are returned in
/// filename order; unpaired tables, unparseable identifiers, and repeats of
/// an already seen well and site are skipped with a warning.
pub fn discover_fields(input_dir: &Path) -> Result<Vec<FieldJob>, FieldError> {
    let io_error = |source: std::io::Error| FieldError::Io {
        path: input_dir.display().to_string(),
        source,
    };

    let mut filenames = Vec::new();
    for entry in fs::read_dir(input_dir).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        if entry.file_type().map_err(io_error)?.is_file() {
            filenames.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    filenames.sort();

    let mut jobs = Vec::new();
    let mut seen = HashSet::new();
    for filename in &filenames {
        let Some(caps) = nuclei_input_regex().captures(filename) else {
            continue;
        };
        let identifier = &caps["identifier"];

        let id = match FieldId::parse(identifier) {
            Ok(id) => id,
            Err(err) => {
                warn!("Skipping {}: {}", filename, err);
                continue;
            }
        };

        let cytoplasm_name = format!("{}{}.{}", identifier, CYTOPLASM_INPUT_SUFFIX, &caps["ext"]);
        let cytoplasm_path = input_dir.join(&cytoplasm_name);
        if !cytoplasm_path.is_file() {
            warn!("Skipping {}: no matching {}", filename, cytoplasm_name);
            continue;
        }

        if !seen.insert(id.clone()) {
            warn!("Skipping {}: field {} was already found", filename, id);
            continue;
        }

        jobs.push(FieldJob {
            id,
            nuclei_path: input_dir.join(filename),
            cytoplasm_path,
        });
    }

    Ok(jobs)
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldOutcome {
    AlreadyExists,
    Assembled {
        ncells: usize,
        nnuclei: usize,
        unmatched_nuclei: usize,
    },
}

/// Options shared by every field in a run.
#[derive(Clone, Debug)]
pub struct FieldOptions {
    pub output_dir: PathBuf,
    pub output_fmt: TableFormat,
    pub columns: TableColumns,
    pub overwrite: bool,
}

// Scratch file next to the outputs, so publishing it is a same-filesystem rename.
fn stage_output(output_dir: &Path, fmt: TableFormat) -> Result<NamedTempFile, FieldError> {
    tempfile::Builder::new()
        .prefix(".cellassign-")
        .suffix(&format!(".{}", fmt.extension()))
        .tempfile_in(output_dir)
        .map_err(|source| FieldError::Io {
            path: output_dir.display().to_string(),
            source,
        })
}

fn publish_output(staged: NamedTempFile, path: &Path) -> Result<(), FieldError> {
    staged.persist(path).map_err(|err| FieldError::Io {
        path: path.display().to_string(),
        source: err.error,
    })?;
    Ok(())
}

/// Read one field's segmentation tables, assemble its cells, and write the
/// nucleus and cytoplasm tables.
///
/// Both tables are written to scratch files first and then renamed into
/// place, cytoplasm before nucleus. The nucleus table marks a field as done,
/// so it only appears once its cytoplasm table is already in place.
pub fn process_field(job: &FieldJob, options: &FieldOptions) -> Result<FieldOutcome, FieldError> {
    let nuclei_output = job.nuclei_output(&options.output_dir, options.output_fmt);
    let cytoplasm_output = job.cytoplasm_output(&options.output_dir, options.output_fmt);

    if nuclei_output.is_file() && !options.overwrite {
        info!("{} already exists!", job.id);
        return Ok(FieldOutcome::AlreadyExists);
    }

    let nuclei = read_nuclei_table(&job.nuclei_path, &options.columns)?;
    let cytoplasms = read_cytoplasm_table(&job.cytoplasm_path, &options.columns)?;

    let tables = assemble(&nuclei, &cytoplasms).map_err(|source| FieldError::Assemble {
        field: job.id.clone(),
        source,
    })?;

    if tables.is_empty() {
        warn!(
            "No cells found in {} ({} nuclei, {} cytoplasms)",
            job.id,
            nuclei.len(),
            cytoplasms.len()
        );
    }

    let nuclei_staged = stage_output(&options.output_dir, options.output_fmt)?;
    let cytoplasm_staged = stage_output(&options.output_dir, options.output_fmt)?;
    write_nucleus_table(nuclei_staged.path(), options.output_fmt, &tables.nuclei)?;
    write_cytoplasm_table(cytoplasm_staged.path(), options.output_fmt, &tables.cytoplasm)?;

    publish_output(cytoplasm_staged, &cytoplasm_output)?;
    publish_output(nuclei_staged, &nuclei_output)?;

    Ok(FieldOutcome::Assembled {
        ncells: tables.ncells(),
        nnuclei: tables.nuclei.len(),
        unmatched_nuclei: tables.unmatched_nuclei,
    })
}
