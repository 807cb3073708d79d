//! Dumplog export engine
//!
//! A dump streams a user's (or, for the admin sentinel, everyone's) quote
//! and command rows into one XML document:
//!
//! ```text
//! <?xml version="1.0"?>
//! <log>
//! <userCommand>...</userCommand>
//! <quoteServer>...</quoteServer>
//! </log>
//! ```
//!
//! The document is always closed. [`DumplogDocument`] writes the footer in
//! [`DumplogDocument::finish`], or in `Drop` when an export bails out early,
//! so a failed export leaves a truncated but well-formed file.
//!
//! File I/O stays off the async workers: [`ExportEngine`] streams rows from
//! the store and hands each fragment over a bounded channel to a writer on
//! the blocking pool, which owns the document.

use crate::error::{AuditError, Result};
use crate::store::{AuditStore, LogFilter, StoreConnection};
use crate::types::DumplogRequest;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;

/// Opening of every dumplog document
pub const DOCUMENT_HEADER: &str = "<?xml version=\"1.0\"?>\n<log>\n";

/// Closing of every dumplog document
pub const DOCUMENT_FOOTER: &str = "</log>\n";

/// Hint used when a per-user request names no file
pub const DEFAULT_HINT: &str = "dump";

const FILE_TIME_FORMAT: &str = "%Y-%m-%dT%H%M%S";

/// Fragments in flight between the row stream and the file writer
const WRITE_QUEUE: usize = 256;

/// Create the output directory if it does not exist yet
pub fn ensure_output_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Replace anything outside `[A-Za-z0-9_.-]` with `_`
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Output path for a dump request
///
/// Per-request documents are `{dir}/{user}_{time}_{hint}.xml`; an admin
/// request without a hint produces the system-level `{dir}/{time}.xml`.
pub fn dumplog_path(dir: &Path, request: &DumplogRequest, at: DateTime<Utc>) -> PathBuf {
    let stamp = at.format(FILE_TIME_FORMAT);
    let hint = request.filename.trim();

    let name = if request.is_admin() && hint.is_empty() {
        format!("{}.xml", stamp)
    } else {
        let hint = if hint.is_empty() { DEFAULT_HINT } else { hint };
        format!(
            "{}_{}_{}.xml",
            sanitize_component(&request.user_id),
            stamp,
            sanitize_component(hint.trim_end_matches(".xml"))
        )
    };
    dir.join(name)
}

/// An open dumplog document
///
/// The header is written on creation. The footer is written exactly once,
/// by `finish` or by `Drop`. All methods block on file I/O; async callers
/// go through [`ExportEngine`].
pub struct DumplogDocument {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows: usize,
}

impl DumplogDocument {
    /// Create the file and write the header
    ///
    /// An existing file is never overwritten; a numeric suffix is added
    /// instead.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let (path, file) = create_unique(path.into())?;
        let mut writer = BufWriter::new(file);
        writer.write_all(DOCUMENT_HEADER.as_bytes())?;

        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fragments written so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append one fragment on its own line
    pub fn write_fragment(&mut self, fragment: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "document already finalized"))?;
        writer.write_all(fragment.as_bytes())?;
        writer.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    /// Write the footer, flush and close
    pub fn finish(mut self) -> Result<PathBuf> {
        if let Some(writer) = self.writer.take() {
            finalize(writer)?;
        }
        Ok(std::mem::take(&mut self.path))
    }
}

impl Drop for DumplogDocument {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        match finalize(writer) {
            Ok(()) => tracing::warn!(
                path = %self.path.display(),
                rows = self.rows,
                "Dumplog closed before completion"
            ),
            Err(e) => tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to finalize dumplog"
            ),
        }
    }
}

fn finalize(mut writer: BufWriter<File>) -> io::Result<()> {
    writer.write_all(DOCUMENT_FOOTER.as_bytes())?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

fn create_unique(path: PathBuf) -> Result<(PathBuf, File)> {
    let mut candidate = path.clone();
    for attempt in 1..=100u32 {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("dump");
                candidate = path.with_file_name(format!("{}-{}.xml", stem, attempt));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(AuditError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {}", path.display()),
    )))
}

/// Outcome of a completed export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub rows: usize,
}

/// Runs dump requests against the audit store
///
/// Cheap to clone. Every export acquires its own store connection, so
/// exports never share a connection with each other or with the insert
/// workers.
#[derive(Clone)]
pub struct ExportEngine {
    store: Arc<dyn AuditStore>,
    output_dir: PathBuf,
}

impl ExportEngine {
    pub fn new(store: Arc<dyn AuditStore>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Export the rows a request covers
    ///
    /// Connection, query and row errors are logged and returned; the
    /// document is still closed with its footer.
    pub async fn export(&self, request: &DumplogRequest) -> Result<ExportReport> {
        let path = dumplog_path(&self.output_dir, request, Utc::now());
        let document = joined(tokio::task::spawn_blocking(move || DumplogDocument::create(path)).await)?;
        let path = document.path().to_path_buf();
        let filter = LogFilter::for_request(request);

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let writer = tokio::task::spawn_blocking(move || write_document(document, rx));
        let streamed = self.fill(&filter, tx).await;
        let written = joined(writer.await);

        match (streamed, written) {
            (Ok(()), Ok(report)) => {
                tracing::info!(
                    user_id = %request.user_id,
                    path = %report.path.display(),
                    rows = report.rows,
                    "Dumplog written"
                );
                Ok(report)
            }
            (_, Err(e)) | (Err(e), Ok(_)) => {
                tracing::error!(
                    user_id = %request.user_id,
                    path = %path.display(),
                    error = %e,
                    "Dumplog export failed"
                );
                Err(e)
            }
        }
    }

    async fn fill(&self, filter: &LogFilter, tx: mpsc::Sender<String>) -> Result<()> {
        let mut conn = self.store.connect().await?;
        let streamed = stream_rows(&mut conn, filter, &tx).await;
        if let Err(e) = conn.close().await {
            tracing::warn!(error = %e, "Failed to release export connection");
        }
        streamed
    }
}

async fn stream_rows(
    conn: &mut Box<dyn StoreConnection>,
    filter: &LogFilter,
    tx: &mpsc::Sender<String>,
) -> Result<()> {
    let mut rows = conn.fetch_logs(filter);
    while let Some(row) = rows.next().await {
        tx.send(row?.content).await.map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "dumplog writer stopped")
        })?;
    }
    Ok(())
}

/// Runs on the blocking pool until the sender is dropped
fn write_document(mut document: DumplogDocument, mut rx: mpsc::Receiver<String>) -> Result<ExportReport> {
    while let Some(fragment) = rx.blocking_recv() {
        document.write_fragment(&fragment)?;
    }
    let rows = document.rows();
    let path = document.finish()?;
    Ok(ExportReport { path, rows })
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.map_err(|e| AuditError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{EventType, LogItem};
    use chrono::TimeZone;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    fn single_file(dir: &Path) -> PathBuf {
        let entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1, "expected one document, got {:?}", entries);
        entries.into_iter().next().unwrap()
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        for (user, tx, kind) in [
            ("u1", 1, EventType::Command),
            ("u2", 2, EventType::Quote),
            ("u1", 3, EventType::Quote),
        ] {
            let item = LogItem {
                user_id: user.to_string(),
                tx_id: tx,
                log_type: kind,
                content: format!("<row user=\"{}\" tx=\"{}\"/>", user, tx),
            };
            conn.insert(&item).await.unwrap();
        }
        conn.close().await.unwrap();
        store
    }

    #[test]
    fn test_dumplog_path_per_user() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        let path = dumplog_path(Path::new("/out"), &DumplogRequest::new("u1", "mine"), at);
        assert_eq!(path, PathBuf::from("/out/u1_2024-03-09T070502_mine.xml"));
    }

    #[test]
    fn test_dumplog_path_system_level() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        let path = dumplog_path(Path::new("/out"), &DumplogRequest::new("admin", ""), at);
        assert_eq!(path, PathBuf::from("/out/2024-03-09T070502.xml"));

        let path = dumplog_path(Path::new("/out"), &DumplogRequest::new("u1", ""), at);
        assert_eq!(path, PathBuf::from("/out/u1_2024-03-09T070502_dump.xml"));
    }

    #[test]
    fn test_dumplog_path_cannot_escape_dir() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request = DumplogRequest::new("../../etc", "x/../../passwd.xml");
        let path = dumplog_path(Path::new("/out"), &request, at);
        assert_eq!(path.parent(), Some(Path::new("/out")));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            ".._.._etc_2024-01-01T000000_x_.._.._passwd.xml"
        );
    }

    #[test]
    fn test_document_finish_writes_footer_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = DumplogDocument::create(dir.path().join("a.xml")).unwrap();
        doc.write_fragment("<a/>").unwrap();
        let path = doc.finish().unwrap();

        assert_eq!(read(&path), "<?xml version=\"1.0\"?>\n<log>\n<a/>\n</log>\n");
    }

    #[test]
    fn test_document_drop_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.xml");
        {
            let mut doc = DumplogDocument::create(&path).unwrap();
            doc.write_fragment("<b/>").unwrap();
        }
        assert_eq!(read(&path), "<?xml version=\"1.0\"?>\n<log>\n<b/>\n</log>\n");
    }

    #[test]
    fn test_document_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.xml");
        let first = DumplogDocument::create(&path).unwrap().finish().unwrap();
        let second = DumplogDocument::create(&path).unwrap().finish().unwrap();

        assert_eq!(first, path);
        assert_eq!(second, dir.path().join("c-1.xml"));
    }

    #[tokio::test]
    async fn test_admin_export_covers_everyone_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        let engine = ExportEngine::new(Arc::new(store.clone()), dir.path());

        let report = engine
            .export(&DumplogRequest::new("admin", "all"))
            .await
            .unwrap();
        assert_eq!(report.rows, 3);

        let body = read(&report.path);
        let u1 = body.find("tx=\"1\"").unwrap();
        let u2 = body.find("tx=\"2\"").unwrap();
        let u1_late = body.find("tx=\"3\"").unwrap();
        assert!(u1 < u2 && u2 < u1_late);
        assert!(body.starts_with(DOCUMENT_HEADER));
        assert!(body.ends_with(DOCUMENT_FOOTER));
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_user_export_only_has_own_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        let engine = ExportEngine::new(Arc::new(store), dir.path());

        let report = engine
            .export(&DumplogRequest::new("u1", "mine"))
            .await
            .unwrap();
        assert_eq!(report.rows, 2);

        let body = read(&report.path);
        assert!(body.contains("user=\"u1\""));
        assert!(!body.contains("user=\"u2\""));
        assert!(report
            .path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("u1_"));
    }

    #[tokio::test]
    async fn test_query_failure_still_closes_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        store.fail_fetch_after(Some(0));
        let engine = ExportEngine::new(Arc::new(store.clone()), dir.path());

        let result = engine.export(&DumplogRequest::new("admin", "all")).await;
        assert!(matches!(result, Err(AuditError::Store(_))));

        let body = read(&single_file(dir.path()));
        assert_eq!(body, format!("{}{}", DOCUMENT_HEADER, DOCUMENT_FOOTER));
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_rows_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        store.fail_fetch_after(Some(2));
        let engine = ExportEngine::new(Arc::new(store), dir.path());

        assert!(engine.export(&DumplogRequest::new("admin", "all")).await.is_err());

        let body = read(&single_file(dir.path()));
        assert!(body.starts_with(DOCUMENT_HEADER));
        assert!(body.ends_with(DOCUMENT_FOOTER));
        assert_eq!(body.lines().count(), 2 + 2 + 1);
    }

    #[tokio::test]
    async fn test_connect_failure_still_closes_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let engine = ExportEngine::new(Arc::new(store), dir.path());

        assert!(engine.export(&DumplogRequest::new("u1", "x")).await.is_err());
        let body = read(&single_file(dir.path()));
        assert_eq!(body, format!("{}{}", DOCUMENT_HEADER, DOCUMENT_FOOTER));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_exports_get_separate_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        let engine = ExportEngine::new(Arc::new(store.clone()), dir.path());

        let request = DumplogRequest::new("u1", "same");
        let (a, b) = tokio::join!(engine.export(&request), engine.export(&request));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.path, b.path);
        for report in [a, b] {
            assert_eq!(report.rows, 2);
            let body = read(&report.path);
            assert!(body.starts_with(DOCUMENT_HEADER) && body.ends_with(DOCUMENT_FOOTER));
        }
        assert_eq!(store.open_connections(), 0);
    }

    #[test]
    fn test_ensure_output_dir_nested() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_output_dir(&nested).unwrap();
        ensure_output_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
