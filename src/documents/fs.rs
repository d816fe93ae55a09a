//! Documents stored on the local filesystem.
//!
//! A [`DocumentId`] is a path relative to the source's root directory. It
//! may name:
//!
//! - a directory, where each PNG or JPEG file (in lexical order) is a page,
//! - a single PNG or JPEG image, which has exactly one page,
//! - a multipage TIFF, with one page per IFD,
//! - a PDF, which is rasterized one page at a time.
//!
//! Each document is inspected once, the first time it is asked for, and what
//! we learn is kept for later calls. Failed lookups are not kept.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    async_utils::spawn_blocking_propagating_panics, error::OcrError, jobs::DocumentId,
    prelude::*,
};

use super::{
    DocumentSource, PDF_MIME_TYPE, PageImage, SUPPORTED_IMAGE_TYPES, TIFF_MIME_TYPE,
    get_mime_type, multipage_tiff, pdf,
};

/// What kind of file a document turned out to be.
#[derive(Debug)]
enum DocumentKind {
    /// A directory of page images, already sorted.
    ImageDir(Vec<(PathBuf, String)>),
    /// One image file with the given MIME type.
    Image(PathBuf, String),
    /// A TIFF which may hold several pages.
    Tiff(PathBuf),
    /// A PDF.
    Pdf(PathBuf),
}

/// A document we have already looked at.
#[derive(Debug)]
struct ResolvedDocument {
    kind: DocumentKind,
    page_count: usize,
}

/// A [`DocumentSource`] backed by local files.
#[derive(Debug)]
pub struct FsDocumentSource {
    /// Document IDs are resolved relative to this directory.
    root: PathBuf,
    /// The DPI to use when rasterizing PDF pages.
    rasterize_dpi: u32,
    /// Documents we have already resolved.
    resolved: Mutex<HashMap<DocumentId, Arc<ResolvedDocument>>>,
}

impl FsDocumentSource {
    /// Create a new filesystem source.
    pub fn new(root: impl Into<PathBuf>, rasterize_dpi: u32) -> Self {
        Self {
            root: root.into(),
            rasterize_dpi,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Work out what `document_id` refers to and how many pages it has,
    /// reusing an earlier answer if we have one.
    async fn resolve(
        &self,
        document_id: &DocumentId,
    ) -> Result<Arc<ResolvedDocument>, OcrError> {
        let cached = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .cloned();
        if let Some(resolved) = cached {
            return Ok(resolved);
        }

        // Concurrent lookups of one document may both get here; the last
        // insert wins.
        let resolved = Arc::new(self.resolve_uncached(document_id).await?);
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.clone(), resolved.clone());
        Ok(resolved)
    }

    #[instrument(level = "trace", skip_all, fields(document_id = %document_id))]
    async fn resolve_uncached(
        &self,
        document_id: &DocumentId,
    ) -> Result<ResolvedDocument, OcrError> {
        let path = self.root.join(document_id.as_str());
        let document_error = |error: anyhow::Error| OcrError::Document {
            document_id: document_id.clone(),
            error,
        };
        let kind = spawn_blocking_propagating_panics(move || classify_path(path))
            .await
            .map_err(document_error)?
            .ok_or_else(|| OcrError::document_not_found(document_id))?;
        let page_count = match &kind {
            DocumentKind::ImageDir(pages) => pages.len(),
            DocumentKind::Image(..) => 1,
            DocumentKind::Tiff(path) => {
                let path = path.clone();
                spawn_blocking_propagating_panics(move || multipage_tiff::count_tiff_pages(&path))
                    .await
                    .map_err(document_error)?
            }
            DocumentKind::Pdf(path) => pdf::get_pdf_page_count(path)
                .await
                .map_err(document_error)?,
        };
        debug!(page_count, "Resolved document");
        Ok(ResolvedDocument { kind, page_count })
    }
}

/// Look at a path on disk. Returns `None` if nothing is there.
fn classify_path(path: PathBuf) -> Result<Option<DocumentKind>> {
    if !path.exists() {
        return Ok(None);
    }
    if path.is_dir() {
        return list_image_dir(&path).map(|pages| Some(DocumentKind::ImageDir(pages)));
    }
    let mime_type = get_mime_type(&path)?;
    let kind = if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
        DocumentKind::Image(path, mime_type)
    } else if mime_type == TIFF_MIME_TYPE {
        DocumentKind::Tiff(path)
    } else if mime_type == PDF_MIME_TYPE {
        DocumentKind::Pdf(path)
    } else {
        return Err(anyhow!(
            "unsupported MIME type {} for {:?} (supported: PNG, JPEG, TIFF, PDF)",
            mime_type,
            path.display()
        ));
    };
    Ok(Some(kind))
}

/// List the page images in a directory, in lexical order. Files which are
/// not PNG or JPEG are skipped.
fn list_image_dir(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut paths = dir
        .read_dir()
        .with_context(|| format!("failed to read directory {:?}", dir.display()))?
        .map(|entry| {
            let entry = entry.with_context(|| {
                format!("failed to read entry in directory {:?}", dir.display())
            })?;
            Ok(entry.path())
        })
        .collect::<Result<Vec<_>>>()?;
    paths.sort();

    let mut pages = Vec::new();
    for path in paths {
        if !path.is_file() {
            continue;
        }
        match infer::get_from_path(&path)? {
            Some(kind) if SUPPORTED_IMAGE_TYPES.contains(&kind.mime_type()) => {
                pages.push((path, kind.mime_type().to_owned()));
            }
            _ => trace!(path = %path.display(), "Skipping non-image file"),
        }
    }
    Ok(pages)
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    #[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
    async fn page_count(&self, document_id: &DocumentId) -> Result<usize, OcrError> {
        Ok(self.resolve(document_id).await?.page_count)
    }

    #[instrument(level = "debug", skip_all, fields(document_id = %document_id, page = page_idx))]
    async fn page_image(
        &self,
        document_id: &DocumentId,
        page_idx: usize,
    ) -> Result<PageImage, OcrError> {
        let resolved = self.resolve(document_id).await?;
        if page_idx >= resolved.page_count {
            return Err(OcrError::page_not_found(document_id, page_idx));
        }
        let document_error = |error: anyhow::Error| OcrError::Document {
            document_id: document_id.clone(),
            error,
        };
        match &resolved.kind {
            DocumentKind::ImageDir(pages) => {
                let (path, mime_type) = &pages[page_idx];
                read_image_file(path, mime_type.clone())
                    .await
                    .map_err(document_error)
            }
            DocumentKind::Image(path, mime_type) => read_image_file(path, mime_type.clone())
                .await
                .map_err(document_error),
            DocumentKind::Tiff(path) => {
                let path = path.clone();
                spawn_blocking_propagating_panics(move || {
                    multipage_tiff::tiff_page_as_png(&path, page_idx)
                })
                .await
                .map_err(document_error)
            }
            DocumentKind::Pdf(path) => pdf::rasterize_pdf_page(path, page_idx, self.rasterize_dpi)
                .await
                .map_err(document_error),
        }
    }
}

/// Read an image file from disk.
async fn read_image_file(path: &Path, mime_type: String) -> Result<PageImage> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read file {:?}", path.display()))?;
    Ok(PageImage::new(mime_type, data))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, RgbImage};

    use super::*;

    fn write_png(path: &Path, width: u32, height: u32) {
        let mut bytes = Vec::new();
        RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn image_directories_have_one_page_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("scan");
        std::fs::create_dir(&doc).unwrap();
        write_png(&doc.join("p2.png"), 2, 2);
        write_png(&doc.join("p1.png"), 1, 1);
        std::fs::write(doc.join("notes.txt"), "not a page").unwrap();

        let source = FsDocumentSource::new(dir.path(), 300);
        let id = DocumentId::new("scan");
        assert_eq!(source.page_count(&id).await.unwrap(), 2);

        let first = source.page_image(&id, 0).await.unwrap();
        assert_eq!(first.mime_type, "image/png");
        assert_eq!(
            first.data,
            std::fs::read(doc.join("p1.png")).unwrap(),
            "pages should be sorted by file name"
        );
        assert!(matches!(
            source.page_image(&id, 2).await,
            Err(OcrError::NotFound { what: "page", .. })
        ));
    }

    #[tokio::test]
    async fn single_images_have_one_page() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("page.png"), 3, 3);
        let source = FsDocumentSource::new(dir.path(), 300);
        let id = DocumentId::new("page.png");
        assert_eq!(source.page_count(&id).await.unwrap(), 1);
        assert!(source.page_image(&id, 0).await.is_ok());
        assert!(source.page_image(&id, 1).await.is_err());
    }

    #[tokio::test]
    async fn documents_are_resolved_once() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("scan");
        std::fs::create_dir(&doc).unwrap();
        write_png(&doc.join("p1.png"), 1, 1);

        let source = FsDocumentSource::new(dir.path(), 300);
        let id = DocumentId::new("scan");
        assert_eq!(source.page_count(&id).await.unwrap(), 1);

        // Pages added after the first lookup don't change the document.
        write_png(&doc.join("p2.png"), 2, 2);
        assert_eq!(source.page_count(&id).await.unwrap(), 1);
        assert!(matches!(
            source.page_image(&id, 1).await,
            Err(OcrError::NotFound { what: "page", .. })
        ));
        assert!(source.page_image(&id, 0).await.is_ok());
    }

    #[tokio::test]
    async fn missing_documents_are_not_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsDocumentSource::new(dir.path(), 300);
        let id = DocumentId::new("late.png");
        assert!(source.page_count(&id).await.is_err());

        write_png(&dir.path().join("late.png"), 4, 4);
        assert_eq!(source.page_count(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_documents_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsDocumentSource::new(dir.path(), 300);
        assert!(matches!(
            source.page_count(&DocumentId::new("nope.pdf")).await,
            Err(OcrError::NotFound { what: "document", .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_files_are_document_errors() {
        let dir = tempfile::tempdir().unwrap();
        // A ZIP header, which `infer` recognizes but we don't support.
        std::fs::write(dir.path().join("archive.zip"), b"PK\x03\x04rest").unwrap();
        let source = FsDocumentSource::new(dir.path(), 300);
        assert!(matches!(
            source.page_count(&DocumentId::new("archive.zip")).await,
            Err(OcrError::Document { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn pdf_pages_are_rasterized() {
        let source = FsDocumentSource::new("tests/fixtures", 72);
        let id = DocumentId::new("two_pages.pdf");
        assert_eq!(source.page_count(&id).await.unwrap(), 2);
        let page = source.page_image(&id, 1).await.unwrap();
        assert_eq!(page.mime_type, "image/png");
    }
}
