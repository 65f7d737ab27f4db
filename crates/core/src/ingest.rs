use crate::extractor::FileKind;
use crate::index::HierarchicalIndex;
use crate::models::{DocumentId, RawFile};
use crate::IngestError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Recursively lists every file with an ingestible extension, sorted.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(FileKind::is_supported_extension);

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Document ids are derived from the filename so re-uploading a file
/// replaces its tree instead of duplicating it. Folder ingestion passes
/// the path relative to the folder, so same-named files in different
/// subfolders stay distinct.
pub fn document_id_for(filename: &str) -> DocumentId {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub async fn read_raw_file(path: &Path) -> Result<RawFile, IngestError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
    let bytes = tokio::fs::read(path).await?;
    Ok(RawFile::new(filename, bytes))
}

/// `path` relative to `root` with `/` separators, e.g. `a/readme.txt`.
pub fn relative_name(root: &Path, path: &Path) -> Result<String, IngestError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts = relative
        .components()
        .map(|part| part.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
    Ok(parts.join("/"))
}

pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestionReport {
    pub ingested: Vec<DocumentId>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Ingests every supported file under `folder`, collecting failures
/// instead of stopping at the first one.
pub async fn ingest_folder_best_effort(
    index: &HierarchicalIndex,
    folder: &Path,
) -> Result<IngestionReport, IngestError> {
    let files = discover_documents(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no supported documents found in {}",
            folder.display()
        )));
    }

    let report = ingest_files(index, folder, files).await;

    info!(
        ingested = report.ingested.len(),
        skipped = report.skipped_files.len(),
        folder = %folder.display(),
        "folder ingestion finished"
    );

    Ok(report)
}

async fn ingest_files(
    index: &HierarchicalIndex,
    root: &Path,
    files: Vec<PathBuf>,
) -> IngestionReport {
    let mut queued = Vec::with_capacity(files.len());
    let mut skipped_files = Vec::new();

    for path in files {
        match relative_name(root, &path) {
            Ok(name) => {
                index.enqueue(&name);
                queued.push((path, name));
            }
            Err(error) => skipped_files.push(skip(path, &error)),
        }
    }

    let mut ingested = Vec::new();

    for (path, name) in queued {
        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => RawFile::new(name, bytes),
            Err(error) => {
                index.mark_failed(&document_id_for(&name));
                skipped_files.push(skip(path, &IngestError::from(error)));
                continue;
            }
        };

        match index.ingest(file).await {
            Ok(document_id) => ingested.push(document_id),
            Err(error) => skipped_files.push(skip(path, &error)),
        }
    }

    IngestionReport {
        ingested,
        skipped_files,
    }
}

fn skip(path: PathBuf, error: &IngestError) -> SkippedFile {
    warn!(path = %path.display(), reason = %error, "skipped document");
    SkippedFile {
        path,
        reason: error.to_string(),
    }
}
