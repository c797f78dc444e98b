//! Document extraction: page text and embedded figures via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which keeps
//! thread-local state and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so
//! the runtime's worker threads keep driving other jobs.

use crate::artifact::{ExtractedDocument, FigureRef, Section};
use crate::error::StageError;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

/// Turns a stored PDF into structured text plus figure files.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract `pdf_path`, writing any figure images under `media_dir`.
    ///
    /// Unreadable, encrypted or empty documents are [`StageError::FatalInput`].
    async fn extract(&self, pdf_path: &Path, media_dir: &Path) -> Result<ExtractedDocument, StageError>;
}

/// Default extractor backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumExtractor {
    /// Images smaller than this on either edge are icons or rules, not figures.
    pub min_figure_px: u32,
    /// Upper bound on figures saved per document.
    pub max_figures: usize,
}

impl Default for PdfiumExtractor {
    fn default() -> Self {
        Self {
            min_figure_px: 96,
            max_figures: 24,
        }
    }
}

#[async_trait]
impl Extractor for PdfiumExtractor {
    async fn extract(&self, pdf_path: &Path, media_dir: &Path) -> Result<ExtractedDocument, StageError> {
        let path = pdf_path.to_path_buf();
        let out = media_dir.to_path_buf();
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.extract_blocking(&path, &out))
            .await
            .map_err(|e| StageError::resource(format!("Extraction task panicked: {e}")))?
    }
}

impl PdfiumExtractor {
    fn extract_blocking(&self, pdf_path: &Path, media_dir: &Path) -> Result<ExtractedDocument, StageError> {
        let pdfium = bind_pdfium()?;

        let document = pdfium.load_pdf_from_file(pdf_path, None).map_err(|e| {
            let detail = format!("{e:?}");
            if detail.to_lowercase().contains("password") {
                StageError::fatal_input(format!("{} is password-protected", pdf_path.display()))
            } else {
                StageError::fatal_input(format!("{} is corrupt or unreadable: {detail}", pdf_path.display()))
            }
        })?;

        let title = document
            .metadata()
            .get(PdfDocumentMetadataTagType::Title)
            .map(|t| t.value().trim().to_string())
            .filter(|t| !t.is_empty());

        let pages = document.pages();
        let page_count = pages.len() as usize;
        info!("PDF loaded: {} pages", page_count);

        let mut sections = Vec::with_capacity(page_count);
        let mut figures = Vec::new();

        for (idx, page) in pages.iter().enumerate() {
            let page_num = idx + 1;

            match page.text() {
                Ok(text) => {
                    if let Some(section) = page_section(&text.all(), page_num) {
                        sections.push(section);
                    }
                }
                Err(e) => warn!("Page {}: no text layer ({:?})", page_num, e),
            }

            if figures.len() >= self.max_figures {
                continue;
            }
            for object in page.objects().iter() {
                let Some(image_obj) = object.as_image_object() else {
                    continue;
                };
                let image = match image_obj.get_raw_image() {
                    Ok(img) => img,
                    Err(e) => {
                        debug!("Page {}: skipping unreadable image ({:?})", page_num, e);
                        continue;
                    }
                };
                if image.width() < self.min_figure_px || image.height() < self.min_figure_px {
                    continue;
                }
                let id = format!("fig-{:02}", figures.len() + 1);
                let path = media_dir.join(format!("{id}.png"));
                if let Err(e) = image.save(&path) {
                    warn!("Page {}: could not save {}: {}", page_num, id, e);
                    continue;
                }
                figures.push(FigureRef {
                    id,
                    page: page_num,
                    path,
                    width: image.width(),
                    height: image.height(),
                });
                if figures.len() >= self.max_figures {
                    break;
                }
            }
        }

        let title = title.or_else(|| sections.first().map(|s| s.heading.clone()));
        debug!(
            "Extracted {} sections, {} figures",
            sections.len(),
            figures.len()
        );

        Ok(ExtractedDocument {
            title,
            page_count,
            sections,
            figures,
        })
    }
}

/// Bind to the pdfium library fetched by `pdfium-auto`, or a system copy.
fn bind_pdfium() -> Result<Pdfium, StageError> {
    if let Some(path) = pdfium_auto::cached_pdfium_path() {
        return pdfium_auto::bind_pdfium_from_path(&path)
            .map_err(|e| StageError::resource(format!("Failed to bind pdfium: {e}")));
    }
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| StageError::resource(format!("pdfium library not available: {e:?}")))
}

/// One section per page: the first meaningful line is the heading.
fn page_section(raw: &str, page: usize) -> Option<Section> {
    let text = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        return None;
    }
    let heading = text
        .lines()
        .find(|l| l.chars().filter(|c| c.is_alphabetic()).count() >= 3)
        .unwrap_or("")
        .chars()
        .take(80)
        .collect::<String>();
    Some(Section {
        heading: if heading.is_empty() {
            format!("Page {page}")
        } else {
            heading
        },
        text,
        page,
    })
}
