//! Writes sampled sheets to disk and lists earlier exports.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::info;

use crate::domain::{SampleSheets, SampledRecord, TaskError};

const EXPORT_PREFIX: &str = "sample_data_";
const EXPORT_EXTENSION: &str = "json";

#[async_trait]
pub trait ExportWriter: Send + Sync {
    /// Persists one sheet per year and returns where the file landed.
    async fn write(&self, sheets: &SampleSheets) -> Result<PathBuf, TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Serialize)]
struct Workbook<'a> {
    generated_at: DateTime<Utc>,
    sheets: Vec<Sheet<'a>>,
}

#[derive(Serialize)]
struct Sheet<'a> {
    name: String,
    year: i32,
    rows: Vec<ExportRow<'a>>,
}

#[derive(Serialize)]
struct ExportRow<'a> {
    id: i64,
    title: &'a str,
    content: &'a str,
    publish_time: Option<&'a str>,
    answer_url: &'a str,
    author: Option<&'a str>,
    author_url: Option<&'a str>,
    author_field: Option<&'a str>,
    author_cert: Option<&'a str>,
    author_fans: i64,
    year: i32,
    task_id: i64,
    stock_ratio: f64,
    sample_num: u32,
    comment_count: usize,
    comments: &'a str,
}

impl<'a> From<&'a SampledRecord> for ExportRow<'a> {
    fn from(sampled: &'a SampledRecord) -> Self {
        let record = &sampled.record;
        Self {
            id: record.id,
            title: &record.title,
            content: &record.content,
            publish_time: record.publish_time.as_deref(),
            answer_url: &record.answer_url,
            author: record.author.as_deref(),
            author_url: record.author_url.as_deref(),
            author_field: record.author_field.as_deref(),
            author_cert: record.author_cert.as_deref(),
            author_fans: record.author_fans,
            year: record.year,
            task_id: record.task_id,
            stock_ratio: sampled.stock_ratio,
            sample_num: sampled.sample_num,
            comment_count: sampled.comments.len(),
            comments: &sampled.comment_summary,
        }
    }
}

/// Stores each export as a JSON workbook of per-year sheets.
#[derive(Debug, Clone)]
pub struct JsonWorkbookWriter {
    export_dir: PathBuf,
}

impl JsonWorkbookWriter {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Export files in the export dir, newest first. A missing dir is empty.
    pub async fn list_exports(&self) -> Result<Vec<ExportFile>, TaskError> {
        let mut entries = match tokio::fs::read_dir(&self.export_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXPORT_EXTENSION) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(ExportFile {
                filename: entry.file_name().to_string_lossy().into_owned(),
                path,
                size: metadata.len(),
                modified: metadata.modified().map_or_else(|_| Utc::now(), DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.filename.cmp(&a.filename)));
        Ok(files)
    }
}

#[async_trait]
impl ExportWriter for JsonWorkbookWriter {
    async fn write(&self, sheets: &SampleSheets) -> Result<PathBuf, TaskError> {
        tokio::fs::create_dir_all(&self.export_dir).await?;

        let workbook = Workbook {
            generated_at: Utc::now(),
            sheets: sheets
                .iter()
                .map(|(year, rows)| Sheet {
                    name: year.to_string(),
                    year: *year,
                    rows: rows.iter().map(ExportRow::from).collect(),
                })
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&workbook)?;

        let filename = format!(
            "{EXPORT_PREFIX}{}.{EXPORT_EXTENSION}",
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );
        let path = self.export_dir.join(filename);
        tokio::fs::write(&path, body).await?;

        let rows: usize = sheets.values().map(Vec::len).sum();
        info!(path = %path.display(), sheets = sheets.len(), rows, "Export written");
        Ok(path)
    }
}
