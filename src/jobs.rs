use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EditJob {
    pub bg_image_path: PathBuf,
    pub object_to_add: String,
    pub filename: String,
}

impl EditJob {
    pub const REQUIRED_COLUMNS: [&'static str; 3] = ["bg_image_path", "object_to_add", "filename"];

    pub fn output_path(&self, output_dir: impl AsRef<Path>) -> PathBuf {
        output_dir.as_ref().join(format!("{}.png", self.filename))
    }
}

pub fn load_jobs(path: impl AsRef<Path>) -> Result<Vec<EditJob>, JobError> {
    let file = File::open(path.as_ref())?;
    read_jobs(io::BufReader::new(file))
}

pub fn read_jobs(reader: impl io::Read) -> Result<Vec<EditJob>, JobError> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    if let Some(missing) = EditJob::REQUIRED_COLUMNS
        .iter()
        .find(|column| !headers.iter().any(|header| header == **column))
    {
        return Err(JobError::MissingColumn(*missing));
    }

    reader
        .deserialize()
        .enumerate()
        .map(|(row, record)| record.map_err(|source| JobError::Row { row: row + 1, source }))
        .collect()
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    #[error("I/O error when reading the job table: {0}")]
    Io(#[from] io::Error),
    #[error("malformed job table: {0}")]
    Csv(#[from] csv::Error),
    #[error("job table is missing the required column {0:?}")]
    MissingColumn(&'static str),
    #[error("malformed job in row {row}: {source}")]
    Row { row: usize, source: csv::Error },
}
