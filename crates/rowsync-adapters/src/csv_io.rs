//! CSV boundary: header->field mapping, row reading and export writing.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use rowsync_core::InputRow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::{ResourceStrategy, CUSTOM_FIELD_PREFIX};

/// Minimum Jaro-Winkler similarity for a suggested header match.
const SUGGESTION_THRESHOLD: f64 = 0.88;

/// UTF-8 byte-order mark some spreadsheet tools prepend.
const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing mapping: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("column `{header}` maps to unknown {resource} field `{field}`")]
    UnknownField {
        header: String,
        field: String,
        resource: String,
    },
    #[error("column `{0}` is not present in the input file")]
    MissingColumn(String),
}

/// Caller-supplied header -> field mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub columns: BTreeMap<String, String>,
}

fn normalize(name: &str) -> String {
    name.trim()
        .trim_start_matches(UTF8_BOM)
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

impl FieldMapping {
    pub fn from_yaml_str(text: &str) -> Result<Self, MappingError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Match headers to the strategy's fields by normalized name, then by similarity.
    pub fn suggest(headers: &[String], strategy: &dyn ResourceStrategy) -> Self {
        let mut columns = BTreeMap::new();
        let mut taken = Vec::new();
        for header in headers {
            let normalized = normalize(header);
            if strategy.accepts_custom_fields() && normalized.starts_with(CUSTOM_FIELD_PREFIX) {
                columns.insert(header.clone(), normalized);
                continue;
            }
            let best = strategy
                .fields()
                .iter()
                .filter(|f| !taken.contains(&f.name))
                .map(|f| (f.name, strsim::jaro_winkler(&normalized, f.name)))
                .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
                .max_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((name, _)) = best {
                taken.push(name);
                columns.insert(header.clone(), name.to_string());
            }
        }
        Self { columns }
    }

    pub fn check(
        &self,
        strategy: &dyn ResourceStrategy,
        headers: &[String],
    ) -> Result<(), MappingError> {
        for (header, field) in &self.columns {
            if !strategy.knows_field(field) {
                return Err(MappingError::UnknownField {
                    header: header.clone(),
                    field: field.clone(),
                    resource: strategy.resource().to_string(),
                });
            }
            if !headers.iter().any(|h| h.trim_start_matches(UTF8_BOM) == header) {
                return Err(MappingError::MissingColumn(header.clone()));
            }
        }
        Ok(())
    }
}

/// Parsed input with mapped rows; `rows` holds only the requested range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvInput {
    pub headers: Vec<String>,
    pub rows: Vec<InputRow>,
    pub total_rows: usize,
}

fn open_input(path: &Path) -> Result<File, MappingError> {
    File::open(path).map_err(|source| MappingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn csv_reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input)
}

/// Read data rows `[start, end)` (zero-based) through `mapping`.
pub fn read_rows_from<R: Read>(
    input: R,
    mapping: &FieldMapping,
    range: Option<(usize, usize)>,
) -> Result<CsvInput, MappingError> {
    let mut reader = csv_reader(input);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches(UTF8_BOM).to_string())
        .collect();
    let targets: Vec<Option<&String>> = headers.iter().map(|h| mapping.columns.get(h)).collect();

    let (start, end) = range.unwrap_or((0, usize::MAX));
    let mut rows = Vec::new();
    let mut total_rows = 0;
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        total_rows += 1;
        if index < start || index >= end {
            continue;
        }
        let row_num = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(index + 2);
        let fields = record
            .iter()
            .zip(&targets)
            .filter_map(|(value, target)| target.map(|field| (field.clone(), value.to_string())))
            .collect();
        rows.push(InputRow::new(row_num, fields));
    }
    Ok(CsvInput {
        headers,
        rows,
        total_rows,
    })
}

pub fn read_rows(
    path: impl AsRef<Path>,
    mapping: &FieldMapping,
    range: Option<(usize, usize)>,
) -> Result<CsvInput, MappingError> {
    read_rows_from(open_input(path.as_ref())?, mapping, range)
}

pub fn read_headers(path: impl AsRef<Path>) -> Result<Vec<String>, MappingError> {
    let mut reader = csv_reader(open_input(path.as_ref())?);
    Ok(reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches(UTF8_BOM).to_string())
        .collect())
}

/// Appends exported records; the header row is written only for a fresh file.
pub struct CsvExportWriter {
    writer: csv::Writer<File>,
    columns: Vec<String>,
    written: usize,
}

impl CsvExportWriter {
    pub fn create(path: impl AsRef<Path>, columns: &[&str]) -> Result<Self, MappingError> {
        Self::open(path.as_ref(), columns, false)
    }

    /// Continue a file started by an earlier chunk.
    pub fn append(path: impl AsRef<Path>, columns: &[&str]) -> Result<Self, MappingError> {
        Self::open(path.as_ref(), columns, true)
    }

    fn open(path: &Path, columns: &[&str], append: bool) -> Result<Self, MappingError> {
        let io_err = |source| MappingError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let needs_header = !append || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(io_err)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record(columns)?;
        }
        Ok(Self {
            writer,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            written: 0,
        })
    }

    pub fn write_row(&mut self, cells: &BTreeMap<String, String>) -> Result<(), MappingError> {
        let record: Vec<&str> = self
            .columns
            .iter()
            .map(|c| cells.get(c).map(String::as_str).unwrap_or(""))
            .collect();
        self.writer.write_record(&record)?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<usize, MappingError> {
        self.writer.flush().map_err(|e| MappingError::Csv(e.into()))?;
        Ok(self.written)
    }
}
