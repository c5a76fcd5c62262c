//! Building the enrolled gallery from a directory of reference images.
//!
//! One image per identity; the file stem is the identity name. Entries
//! whose face or embedding cannot be extracted are skipped with a warning;
//! only an unreadable directory is fatal (startup error).

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{FaceEncoder, FaceLocator, FrameView, Gallery, GalleryEntry};

const REFERENCE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("reference directory unreadable: {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whether a path looks like a reference image: not a dotfile, with one of
/// the supported extensions (case-insensitive).
pub fn is_reference_image(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| REFERENCE_EXTENSIONS.contains(&e.as_str()))
}

/// Load a gallery from a directory of reference images.
pub fn load_reference_dir(
    dir: &Path,
    locator: &mut dyn FaceLocator,
    encoder: &mut dyn FaceEncoder,
) -> Result<Gallery, GalleryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| GalleryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut gallery = Gallery::default();

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() || !is_reference_image(&path) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        match encode_reference(&path, locator, encoder) {
            Ok(embedding) => {
                tracing::debug!(identity = name, path = %path.display(), "reference enrolled");
                gallery.push(GalleryEntry {
                    name: name.to_string(),
                    embedding,
                });
            }
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "skipping reference image");
            }
        }
    }

    tracing::info!(dir = %dir.display(), entries = gallery.len(), "gallery loaded");
    Ok(gallery)
}

/// Decode one reference image and extract the embedding of its primary face.
fn encode_reference(
    path: &Path,
    locator: &mut dyn FaceLocator,
    encoder: &mut dyn FaceEncoder,
) -> Result<crate::types::Embedding, String> {
    let img = image::open(path).map_err(|e| format!("decode failed: {e}"))?;
    let gray = img.to_luma8();
    let frame = FrameView::new(gray.as_raw(), gray.width(), gray.height());

    let faces = locator
        .locate_faces(frame)
        .map_err(|e| format!("detection failed: {e}"))?;
    let face = faces.first().ok_or_else(|| "no face found".to_string())?;

    encoder
        .encode_face(frame, face)
        .map_err(|e| format!("embedding failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapabilityError, Embedding, Face, FaceRegion};

    struct StubLocator {
        found: bool,
    }

    impl FaceLocator for StubLocator {
        fn locate_faces(&mut self, _frame: FrameView<'_>) -> Result<Vec<Face>, CapabilityError> {
            if self.found {
                Ok(vec![Face::from_region(FaceRegion::new(0, 8, 8, 0))])
            } else {
                Ok(vec![])
            }
        }
    }

    struct StubEncoder;

    impl FaceEncoder for StubEncoder {
        fn encode_face(
            &mut self,
            _frame: FrameView<'_>,
            _face: &Face,
        ) -> Result<Embedding, CapabilityError> {
            Ok(Embedding {
                values: vec![1.0, 0.0],
                model_version: None,
            })
        }
    }

    #[test]
    fn test_reference_extension_filter() {
        assert!(is_reference_image(Path::new("alice.jpg")));
        assert!(is_reference_image(Path::new("bob.JPEG")));
        assert!(is_reference_image(Path::new("eve.Png")));
        assert!(is_reference_image(Path::new("dan.bmp")));
        assert!(!is_reference_image(Path::new(".hidden.jpg")));
        assert!(!is_reference_image(Path::new("readme.txt")));
        assert!(!is_reference_image(Path::new("noext")));
    }

    #[test]
    fn test_unreadable_directory_is_fatal() {
        let mut locator = StubLocator { found: true };
        let mut encoder = StubEncoder;
        let result = load_reference_dir(
            Path::new("/nonexistent/facegate-refs"),
            &mut locator,
            &mut encoder,
        );
        assert!(matches!(result, Err(GalleryError::ReadDir { .. })));
    }

    #[test]
    fn test_loads_named_entries_and_skips_faceless() {
        let dir = std::env::temp_dir().join(format!("facegate-gallery-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        // A decodable grayscale reference image plus files the loader
        // must ignore.
        let img = image::GrayImage::from_pixel(16, 16, image::Luma([128u8]));
        img.save(dir.join("ALICE.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        std::fs::write(dir.join(".hidden.png"), b"ignored").unwrap();

        let mut encoder = StubEncoder;

        let gallery =
            load_reference_dir(&dir, &mut StubLocator { found: true }, &mut encoder).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.entries()[0].name, "ALICE");

        // Same directory, but no face found in any image: empty gallery,
        // no error.
        let gallery =
            load_reference_dir(&dir, &mut StubLocator { found: false }, &mut encoder).unwrap();
        assert!(gallery.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
