use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use slidemark_core::annotation::{AnnotationSet, AnnotationStore};
use slidemark_core::geometry::Vector2;

mod asap;
pub mod geojson;
pub mod save;
mod xml;

pub use geojson::GeoJson;
pub use save::{
    AutosaveThrottle, InlineSubmitter, SaveOutcome, TaskSubmitter, ThreadSubmitter, save_async,
    save_snapshot,
};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

/// 从文件读出完整的标注数据。坐标按 `mpp` 换算到世界坐标。
pub trait AnnotationLoader {
    fn load(&self, path: &Path, mpp: Vector2) -> Result<AnnotationStore, IoError>;
}

pub trait AnnotationSaver {
    fn save(&self, store: &AnnotationStore, path: &Path) -> Result<(), IoError>;
}

/// ASAP XML 读写入口。
#[derive(Debug, Clone, Copy, Default)]
pub struct AsapXml;

impl AsapXml {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, source: &str, mpp: Vector2) -> Result<AnnotationStore, IoError> {
        asap::parse(source, mpp).map_err(|err| IoError::InvalidDocument(err.to_string()))
    }

    pub fn to_xml_string(&self, store: &AnnotationStore) -> String {
        asap::write(store)
    }
}

impl AnnotationLoader for AsapXml {
    fn load(&self, path: &Path, mpp: Vector2) -> Result<AnnotationStore, IoError> {
        let data = fs::read_to_string(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_str(&data, mpp)
    }
}

impl AnnotationSaver for AsapXml {
    fn save(&self, store: &AnnotationStore, path: &Path) -> Result<(), IoError> {
        fs::write(path, self.to_xml_string(store)).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// 加载文件并整体替换集合内容。失败时集合保持原样，调用方可继续使用或回退到空集合。
pub fn load_into(
    set: &mut AnnotationSet,
    path: &Path,
    loader: &impl AnnotationLoader,
) -> Result<(), IoError> {
    match loader.load(path, set.store().mpp()) {
        Ok(store) => {
            info!(
                path = %path.display(),
                annotations = store.annotation_count(),
                groups = store.group_count(),
                "标注文件已加载"
            );
            set.replace_store(store, Some(path.to_path_buf()));
            Ok(())
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "标注文件加载失败");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_load_leaves_set_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xml");
        fs::write(&path, "<ASAP_Annotations><Annotations>").unwrap();

        let mut set = AnnotationSet::new(Vector2::new(1.0, 1.0));
        set.store_mut().add_group("Keep");
        let err = load_into(&mut set, &path, &AsapXml::new()).unwrap_err();
        assert!(matches!(err, IoError::InvalidDocument(_)));
        assert_eq!(set.store().group_count(), 2);
        assert!(!set.is_loaded_from_disk());

        let missing = dir.path().join("missing.xml");
        assert!(matches!(
            load_into(&mut set, &missing, &AsapXml::new()),
            Err(IoError::ReadError { .. })
        ));
    }
}
