// Reading segmentation tables and writing assembled cell tables.

use clap::ValueEnum;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use json::JsonValue;
use regex::Regex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

use crate::assemble::{CytoplasmRecord, NucleusRecord};
use crate::geometry::{CytoplasmPolygon, NucleusPoint};

pub const CELL_ID_COLUMN: &str = "Cell_ID";
pub const CENTER_X_COLUMN: &str = "Location_Center_X";
pub const CENTER_Y_COLUMN: &str = "Location_Center_Y";
pub const OUTLINE_COLUMN: &str = "Outline";

#[derive(Error, Debug)]
pub enum TableError {
    #[error("unable to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed table '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("column '{column}' not found in '{path}'")]
    MissingColumn { path: String, column: String },

    #[error("'{path}' line {line}: column '{column}' has value '{value}', expected a finite number")]
    BadNumber {
        path: String,
        line: u64,
        column: String,
        value: String,
    },

    #[error("'{path}' line {line}: unreadable outline: {reason}")]
    BadOutline { path: String, line: u64, reason: String },

    #[error("unknown table format for '{0}'")]
    UnknownFormat(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum TableFormat {
    Infer,
    Csv,
    CsvGz,
    Tsv,
    TsvGz,
}

impl TableFormat {
    fn delimiter(self) -> u8 {
        match self {
            TableFormat::Csv | TableFormat::CsvGz => b',',
            _ => b'\t',
        }
    }

    fn is_gzipped(self) -> bool {
        matches!(self, TableFormat::CsvGz | TableFormat::TsvGz)
    }

    /// File extension used when naming outputs. Inferred output is TSV.
    pub fn extension(self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::CsvGz => "csv.gz",
            TableFormat::Tsv | TableFormat::Infer => "tsv",
            TableFormat::TsvGz => "tsv.gz",
        }
    }
}

pub fn determine_format(filename: &Path, fmt: TableFormat) -> Result<TableFormat, TableError> {
    if fmt != TableFormat::Infer {
        return Ok(fmt);
    }

    let name = filename
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.ends_with(".csv.gz") {
        Ok(TableFormat::CsvGz)
    } else if name.ends_with(".csv") {
        Ok(TableFormat::Csv)
    } else if name.ends_with(".tsv.gz") || name.ends_with(".txt.gz") {
        Ok(TableFormat::TsvGz)
    } else if name.ends_with(".tsv") || name.ends_with(".txt") {
        Ok(TableFormat::Tsv)
    } else {
        Err(TableError::UnknownFormat(filename.display().to_string()))
    }
}

/// Column naming for the segmentation tables read per field.
#[derive(Clone, Debug)]
pub struct TableColumns {
    pub nuclei_x: String,
    pub nuclei_y: String,
    pub outline: String,

    // nuclei given as outlines rather than centers
    pub nuclei_from_outlines: bool,
}

impl Default for TableColumns {
    fn default() -> Self {
        TableColumns {
            nuclei_x: String::from(CENTER_X_COLUMN),
            nuclei_y: String::from(CENTER_Y_COLUMN),
            outline: String::from(OUTLINE_COLUMN),
            nuclei_from_outlines: false,
        }
    }
}

fn open_table(path: &Path) -> Result<csv::Reader<Box<dyn Read>>, TableError> {
    let fmt = determine_format(path, TableFormat::Infer)?;
    let file = File::open(path).map_err(|source| TableError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let input: Box<dyn Read> = if fmt.is_gzipped() {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    Ok(csv::ReaderBuilder::new()
        .delimiter(fmt.delimiter())
        .has_headers(true)
        .from_reader(input))
}

fn find_column(path: &Path, headers: &csv::StringRecord, column: &str) -> Result<usize, TableError> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| TableError::MissingColumn {
            path: path.display().to_string(),
            column: column.to_string(),
        })
}

// Applies `f` to each data row along with the row's line number.
fn for_each_row<F>(path: &Path, rdr: &mut csv::Reader<Box<dyn Read>>, mut f: F) -> Result<(), TableError>
where
    F: FnMut(&csv::StringRecord, u64) -> Result<(), TableError>,
{
    for result in rdr.records() {
        let row = result.map_err(|source| TableError::Csv {
            path: path.display().to_string(),
            source,
        })?;
        let line = row.position().map(|pos| pos.line()).unwrap_or(0);
        f(&row, line)?;
    }
    Ok(())
}

fn parse_coord(path: &Path, row: &csv::StringRecord, col: usize, column: &str, line: u64) -> Result<f64, TableError> {
    let value = row.get(col).unwrap_or("").trim();
    match value.parse::<f64>() {
        Ok(x) if x.is_finite() => Ok(x),
        _ => Err(TableError::BadNumber {
            path: path.display().to_string(),
            line,
            column: column.to_string(),
            value: value.to_string(),
        }),
    }
}

pub fn read_nuclei_table(path: &Path, columns: &TableColumns) -> Result<Vec<NucleusPoint>, TableError> {
    let mut rdr = open_table(path)?;
    let headers = rdr
        .headers()
        .map_err(|source| TableError::Csv {
            path: path.display().to_string(),
            source,
        })?
        .clone();

    let mut nuclei = Vec::new();

    if columns.nuclei_from_outlines {
        let outline_col = find_column(path, &headers, &columns.outline)?;
        for_each_row(path, &mut rdr, |row, line| {
            let outline = parse_outline(row.get(outline_col).unwrap_or("")).map_err(|reason| {
                TableError::BadOutline {
                    path: path.display().to_string(),
                    line,
                    reason,
                }
            })?;
            if outline.is_empty() {
                return Err(TableError::BadOutline {
                    path: path.display().to_string(),
                    line,
                    reason: String::from("empty nucleus outline"),
                });
            }
            nuclei.push(NucleusPoint::from_outline(&outline));
            Ok(())
        })?;
    } else {
        let x_col = find_column(path, &headers, &columns.nuclei_x)?;
        let y_col = find_column(path, &headers, &columns.nuclei_y)?;
        for_each_row(path, &mut rdr, |row, line| {
            let x = parse_coord(path, row, x_col, &columns.nuclei_x, line)?;
            let y = parse_coord(path, row, y_col, &columns.nuclei_y, line)?;
            nuclei.push(NucleusPoint::new(x, y));
            Ok(())
        })?;
    }

    Ok(nuclei)
}

pub fn read_cytoplasm_table(path: &Path, columns: &TableColumns) -> Result<Vec<CytoplasmPolygon>, TableError> {
    let mut rdr = open_table(path)?;
    let headers = rdr
        .headers()
        .map_err(|source| TableError::Csv {
            path: path.display().to_string(),
            source,
        })?
        .clone();
    let outline_col = find_column(path, &headers, &columns.outline)?;

    let mut cytoplasms = Vec::new();
    for_each_row(path, &mut rdr, |row, line| {
        let outline = parse_outline(row.get(outline_col).unwrap_or("")).map_err(|reason| {
            TableError::BadOutline {
                path: path.display().to_string(),
                line,
                reason,
            }
        })?;
        cytoplasms.push(CytoplasmPolygon::new(outline));
        Ok(())
    })?;

    Ok(cytoplasms)
}

/// Parse an outline cell. Accepts a JSON array of `[x, y]` pairs, which is
/// also what a Python list of pairs looks like, or the bracketed
/// whitespace-separated layout numpy prints for an `(n, 2)` array.
pub fn parse_outline(text: &str) -> Result<Vec<(f64, f64)>, String> {
    let text = text.trim();
    match json::parse(text) {
        Ok(value) => outline_from_json(&value),
        Err(_) => outline_from_numpy_repr(text),
    }
}

fn outline_from_json(value: &JsonValue) -> Result<Vec<(f64, f64)>, String> {
    if !value.is_array() {
        return Err(String::from("expected an array of [x, y] pairs"));
    }

    value
        .members()
        .enumerate()
        .map(|(i, pair)| {
            let x = pair[0].as_f64();
            let y = pair[1].as_f64();
            match (pair.is_array() && pair.len() == 2, x, y) {
                (true, Some(x), Some(y)) => Ok((x, y)),
                _ => Err(format!("point {} is not an [x, y] pair: {}", i, pair.dump())),
            }
        })
        .collect()
}

fn numpy_pair_regex() -> &'static Regex {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    PAIR.get_or_init(|| Regex::new(r"\[([^\[\]]*)\]").unwrap())
}

fn outline_from_numpy_repr(text: &str) -> Result<Vec<(f64, f64)>, String> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| format!("not a bracketed outline: '{}'", text))?;

    let mut outline = Vec::new();
    for (i, caps) in numpy_pair_regex().captures_iter(inner).enumerate() {
        let values: Vec<&str> = caps[1]
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .collect();
        if values.len() != 2 {
            return Err(format!("point {} is not an [x, y] pair: [{}]", i, &caps[1]));
        }
        let x = values[0]
            .parse::<f64>()
            .map_err(|_| format!("point {} has non-numeric x '{}'", i, values[0]))?;
        let y = values[1]
            .parse::<f64>()
            .map_err(|_| format!("point {} has non-numeric y '{}'", i, values[1]))?;
        outline.push((x, y));
    }

    if outline.is_empty() && !inner.trim().is_empty() {
        return Err(format!("not a list of [x, y] pairs: '{}'", text));
    }

    Ok(outline)
}

pub fn format_outline(outline: &[(f64, f64)]) -> String {
    JsonValue::from(
        outline
            .iter()
            .map(|&(x, y)| JsonValue::from(vec![JsonValue::from(x), JsonValue::from(y)]))
            .collect::<Vec<JsonValue>>(),
    )
    .dump()
}

pub fn write_table(path: &Path, fmt: TableFormat, header: &[&str], rows: &[Vec<String>]) -> Result<(), TableError> {
    let fmt = determine_format(path, fmt)?;
    let io_error = |source: std::io::Error| TableError::Io {
        path: path.display().to_string(),
        source,
    };
    let csv_error = |source: csv::Error| TableError::Csv {
        path: path.display().to_string(),
        source,
    };

    let file = BufWriter::new(File::create(path).map_err(io_error)?);

    if fmt.is_gzipped() {
        let encoder = GzEncoder::new(file, Compression::default());
        let encoder = write_table_csv(encoder, fmt.delimiter(), header, rows).map_err(csv_error)?;
        encoder.finish().map_err(io_error)?.flush().map_err(io_error)?;
    } else {
        write_table_csv(file, fmt.delimiter(), header, rows)
            .map_err(csv_error)?
            .flush()
            .map_err(io_error)?;
    }

    Ok(())
}

fn write_table_csv<W>(output: W, delimiter: u8, header: &[&str], rows: &[Vec<String>]) -> Result<W, csv::Error>
where
    W: Write,
{
    let mut writer = csv::WriterBuilder::new().delimiter(delimiter).from_writer(output);
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|err| err.into_error().into())
}

pub fn write_nucleus_table(path: &Path, fmt: TableFormat, records: &[NucleusRecord]) -> Result<(), TableError> {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| vec![r.cell_id.to_string(), r.center_x.to_string(), r.center_y.to_string()])
        .collect();
    write_table(path, fmt, &[CELL_ID_COLUMN, CENTER_X_COLUMN, CENTER_Y_COLUMN], &rows)
}

pub fn write_cytoplasm_table(path: &Path, fmt: TableFormat, records: &[CytoplasmRecord]) -> Result<(), TableError> {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.cell_id.to_string(),
                r.centroid_x.to_string(),
                r.centroid_y.to_string(),
                format_outline(&r.outline),
            ]
        })
        .collect();
    write_table(
        path,
        fmt,
        &[CELL_ID_COLUMN, CENTER_X_COLUMN, CENTER_Y_COLUMN, OUTLINE_COLUMN],
        &rows,
    )
}
