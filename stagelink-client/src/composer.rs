//! On-disk layer files and the composed root document
//!
//! Layer `/a/b` lives at `<output>/layers/a/b.usda`; the root path `/` maps to
//! `<output>/layers/root.usda`. The composed document `<output>/stage.usda`
//! lists every cached layer as a sublayer. All writes go through a sibling
//! temporary file and a rename so a viewer reading the directory never sees a
//! half-written file.

use std::io;
use std::path::{Path, PathBuf};

use stagelink_utils::{Result, StagelinkError};
use tracing::{debug, info, warn};

use crate::cache::LayerCache;

/// Directory under the output root holding layer files
const LAYERS_DIR: &str = "layers";

/// File name of the composed document
pub const DOCUMENT_FILE: &str = "stage.usda";

/// Extension of every written layer
const LAYER_EXT: &str = "usda";

/// File stem standing in for the root layer path `/`
const ROOT_LAYER_STEM: &str = "root";

/// Maps logical layer paths to files below an output directory
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a layer file relative to the output directory
    ///
    /// The result always stays below the output directory: paths must be
    /// absolute, and empty, `.`, `..` or backslash-bearing segments are rejected.
    pub fn relative_path(layer_path: &str) -> Result<PathBuf> {
        let rest = layer_path.strip_prefix('/').ok_or_else(|| {
            StagelinkError::malformed(format!("layer path '{}' is not absolute", layer_path))
        })?;

        let mut relative = PathBuf::from(LAYERS_DIR);
        if rest.is_empty() {
            relative.push(format!("{}.{}", ROOT_LAYER_STEM, LAYER_EXT));
            return Ok(relative);
        }

        let segments: Vec<&str> = rest.split('/').collect();
        for segment in &segments {
            if segment.is_empty() || *segment == "." || *segment == ".." || segment.contains('\\') {
                return Err(StagelinkError::malformed(format!(
                    "layer path '{}' has invalid segment '{}'",
                    layer_path, segment
                )));
            }
        }

        if let Some((last, parents)) = segments.split_last() {
            for parent in parents {
                relative.push(parent);
            }
            relative.push(format!("{}.{}", last, LAYER_EXT));
        }
        Ok(relative)
    }

    /// Absolute location of a layer file
    pub fn file_path(&self, layer_path: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::relative_path(layer_path)?))
    }

    /// Location of the composed document
    pub fn document_path(&self) -> PathBuf {
        self.root.join(DOCUMENT_FILE)
    }

    /// Write a layer payload, creating directories as needed
    pub fn write(&self, layer_path: &str, payload: &[u8]) -> Result<PathBuf> {
        let path = self.file_path(layer_path)?;
        write_atomic(&path, payload).map_err(|e| StagelinkError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
        debug!(layer = layer_path, file = %path.display(), bytes = payload.len(), "Layer written");
        Ok(path)
    }

    /// Delete a layer file; a file that is already gone is not an error
    pub fn remove(&self, layer_path: &str) -> Result<()> {
        let path = self.file_path(layer_path)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(layer = layer_path, file = %path.display(), "Layer file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagelinkError::FileRemove { path, source: e }),
        }
    }
}

/// Write `contents` to `path` through a temporary sibling and a rename
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    stagelink_utils::ensure_dir(dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Render the composed document for the given layer paths
pub fn render_document(layer_paths: &[String]) -> Result<String> {
    let mut out = String::from("#usda 1.0\n(\n");
    if layer_paths.is_empty() {
        out.push_str("    subLayers = []\n");
    } else {
        out.push_str("    subLayers = [\n");
        let last = layer_paths.len() - 1;
        for (i, layer_path) in layer_paths.iter().enumerate() {
            let relative = LayerStore::relative_path(layer_path)?;
            // Asset paths always use forward slashes
            let asset = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push_str("        @./");
            out.push_str(&asset);
            out.push('@');
            if i != last {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str("    ]\n");
    }
    out.push_str(")\n");
    Ok(out)
}

/// Callback run after each successful rebuild
pub trait StageObserver {
    /// `document` is the composed file, `layers` the number of sublayers in it
    fn stage_updated(&mut self, document: &Path, layers: usize);
}

impl<F> StageObserver for F
where
    F: FnMut(&Path, usize),
{
    fn stage_updated(&mut self, document: &Path, layers: usize) {
        (self)(document, layers)
    }
}

/// Summary of one rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebuild {
    pub document: PathBuf,
    pub sublayers: usize,
}

/// Owns the composed document and regenerates its sublayer list from the cache
#[derive(Debug)]
pub struct DocumentComposer {
    store: LayerStore,
    sublayers: Vec<String>,
}

impl DocumentComposer {
    /// Create the composed document with an empty sublayer list
    pub fn create(store: LayerStore) -> Result<Self> {
        let composer = Self {
            store,
            sublayers: Vec::new(),
        };
        composer.persist(&[])?;
        info!(document = %composer.document_path().display(), "Composed document created");
        Ok(composer)
    }

    /// Adopt an existing document without touching it; the first rebuild overwrites it
    pub fn open(store: LayerStore) -> Self {
        Self {
            store,
            sublayers: Vec::new(),
        }
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    pub fn document_path(&self) -> PathBuf {
        self.store.document_path()
    }

    /// Layer paths referenced by the last persisted document
    pub fn sublayers(&self) -> &[String] {
        &self.sublayers
    }

    /// Regenerate the sublayer list if the cache is dirty
    ///
    /// Returns `Ok(None)` when nothing changed. On a failed write the dirty
    /// flag stays set so the next cycle tries again.
    pub fn rebuild(&mut self, cache: &mut LayerCache) -> Result<Option<Rebuild>> {
        if !cache.is_dirty() {
            return Ok(None);
        }

        let sublayers: Vec<String> = cache.paths().map(str::to_string).collect();
        if let Err(e) = self.persist(&sublayers) {
            warn!(error = %e, "Failed to persist composed document, will retry");
            return Err(e);
        }

        self.sublayers = sublayers;
        cache.mark_clean();

        let rebuild = Rebuild {
            document: self.document_path(),
            sublayers: self.sublayers.len(),
        };
        debug!(sublayers = rebuild.sublayers, "Composed document rebuilt");
        Ok(Some(rebuild))
    }

    fn persist(&self, sublayers: &[String]) -> Result<()> {
        let text = render_document(sublayers)?;
        let path = self.document_path();
        write_atomic(&path, text.as_bytes()).map_err(|e| StagelinkError::FileWrite { path, source: e })
    }
}
