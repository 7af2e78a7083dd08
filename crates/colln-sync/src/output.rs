//! Archival gzip JSON and the TSV / Markdown listings of one run.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use colln_core::{ListFormat, News, FILE_DATE_FORMAT, FILE_STAMP_FORMAT, FILE_YEAR_FORMAT};
use colln_storage::{write_atomic, StoredFile};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

pub const LIST_HEADER: [&str; 12] = [
    "No.",
    "NumComment",
    "Author",
    "Publisher",
    "Category",
    "Title",
    "Location",
    "CollectedAt",
    "PostedAt",
    "ModifiedAt",
    "Emotions",
    "URL",
];

const EMPTY_CELL: &str = "-";

/// Output locations of one run under `<save>/<source>/<device>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    platform_root: PathBuf,
    started: DateTime<FixedOffset>,
}

impl OutputLayout {
    pub fn new(platform_root: impl Into<PathBuf>, started: DateTime<FixedOffset>) -> Self {
        Self {
            platform_root: platform_root.into(),
            started,
        }
    }

    fn stamp(&self) -> String {
        self.started.format(FILE_STAMP_FORMAT).to_string()
    }

    fn dated(&self, kind: &str) -> PathBuf {
        self.platform_root
            .join(kind)
            .join(self.started.format(FILE_YEAR_FORMAT).to_string())
            .join(self.started.format(FILE_DATE_FORMAT).to_string())
    }

    /// Root handed to dump-directory allocation for page captures.
    pub fn dump_root(&self) -> PathBuf {
        self.platform_root
            .join("dump")
            .join(self.started.format(FILE_YEAR_FORMAT).to_string())
    }

    pub fn dump_file(&self) -> PathBuf {
        self.dated("dump").join(format!("{}.json.gz", self.stamp()))
    }

    pub fn list_dir(&self) -> PathBuf {
        self.dated("list")
    }

    pub fn list_file(&self, ext: &str) -> PathBuf {
        self.list_dir().join(format!("{}.{ext}", self.stamp()))
    }
}

/// JSON array of every article, gzip'd at the best compression level.
pub fn gzip_json(news: &[News]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(news).context("serializing news list")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json).context("compressing news list")?;
    encoder.finish().context("finishing gzip stream")
}

fn cell(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        EMPTY_CELL.to_string()
    } else {
        value.to_string()
    }
}

pub fn table_rows(news: &[News]) -> Vec<Vec<String>> {
    news.iter()
        .enumerate()
        .map(|(idx, item)| {
            let end = item.end.as_ref();
            let emotions = match end {
                Some(end) if !end.emotions.is_empty() => format!(
                    "[{}]",
                    end.emotions
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
                _ => EMPTY_CELL.to_string(),
            };
            vec![
                (idx + 1).to_string(),
                end.map(|e| e.num_comment.to_string())
                    .unwrap_or_else(|| EMPTY_CELL.to_string()),
                cell(end.map(|e| e.author.as_str()).unwrap_or_default()),
                cell(item.display_publisher()),
                cell(end.map(|e| e.category.as_str()).unwrap_or_default()),
                cell(&item.title),
                cell(item.location.map(|l| l.as_str()).unwrap_or_default()),
                cell(end.map(|e| e.collected_at.as_str()).unwrap_or_default()),
                cell(end.map(|e| e.posted_at.as_str()).unwrap_or_default()),
                cell(end.map(|e| e.modified_at.as_str()).unwrap_or_default()),
                emotions,
                cell(&item.url),
            ]
        })
        .collect()
}

fn write_table(rows: &[Vec<String>], delimiter: u8, separator_row: bool) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(LIST_HEADER)?;
    if separator_row {
        writer.write_record(LIST_HEADER.map(|_| "---"))?;
    }
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing table: {}", err.error()))
}

pub fn render_tsv(rows: &[Vec<String>]) -> Result<Vec<u8>> {
    write_table(rows, b'\t', false)
}

/// Markdown table; `|` inside cells is escaped as `&vert;`.
pub fn render_markdown(rows: &[Vec<String>]) -> Result<Vec<u8>> {
    let escaped: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|c| c.replace('|', "&vert;")).collect())
        .collect();
    write_table(&escaped, b'|', true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenOutput {
    pub dump: StoredFile,
    pub lists: Vec<PathBuf>,
}

/// Writes the listings (best effort) and then the gzip dump, whose failure is
/// returned.
pub async fn write_outputs(
    layout: &OutputLayout,
    news: &[News],
    format: ListFormat,
) -> Result<WrittenOutput> {
    let rows = table_rows(news);
    let mut lists = Vec::new();
    if format.writes_tsv() {
        lists.extend(write_list(&layout.list_file("tsv"), render_tsv(&rows)).await);
    }
    if format.writes_markdown() {
        lists.extend(write_list(&layout.list_file("md"), render_markdown(&rows)).await);
    }

    let bytes = gzip_json(news)?;
    let dump = write_atomic(&layout.dump_file(), &bytes)
        .await
        .with_context(|| format!("writing news dump {}", layout.dump_file().display()))?;
    Ok(WrittenOutput { dump, lists })
}

async fn write_list(path: &Path, rendered: Result<Vec<u8>>) -> Option<PathBuf> {
    let result = match rendered {
        Ok(bytes) => write_atomic(path, &bytes).await.map(|stored| stored.path),
        Err(err) => Err(err),
    };
    match result {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(path = %path.display(), error = %format!("{err:#}"), "failed to write news list");
            None
        }
    }
}
