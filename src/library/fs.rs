//! Directory-backed photo library.
//!
//! Files that share a stem in one directory form a single asset: an image
//! plus an optional RAW sibling (`IMG_0001.HEIC` + `IMG_0001.DNG`). Videos are
//! assets of their own. A `<stem>.favorite` marker flags the asset as a
//! favorite. The asset id is the primary file's path relative to the root.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::LibraryError;
use super::exif;
use super::{LocalAsset, LocalResource, MediaKind, PhotoInventory};
use crate::state::ResourceKind;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "heic", "heif", "png", "tif", "tiff", "webp", "gif", "avif",
];
const RAW_EXTENSIONS: &[&str] = &[
    "dng", "cr2", "cr3", "nef", "arw", "raf", "orf", "rw2", "pef", "srw",
];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "m4v", "avi", "mkv", "3gp", "webm"];
const FAVORITE_MARKER: &str = "favorite";

#[derive(Debug, Clone)]
struct ScannedFile {
    path: PathBuf,
    filename: String,
    extension: String,
    size: u64,
    modified_at: DateTime<Utc>,
}

#[derive(Debug)]
struct IndexedAsset {
    asset: LocalAsset,
    paths: Vec<(ResourceKind, PathBuf)>,
}

#[derive(Debug, Default)]
struct LibraryIndex {
    by_id: HashMap<String, IndexedAsset>,
    /// Ids sorted newest first.
    images: Vec<String>,
    videos: Vec<String>,
}

pub struct FsLibrary {
    root: PathBuf,
    index: RwLock<Arc<LibraryIndex>>,
}

impl std::fmt::Debug for FsLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsLibrary")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FsLibrary {
    /// Open a library rooted at `root` and scan it.
    pub async fn open(root: &Path) -> Result<Self, LibraryError> {
        if !root.is_dir() {
            return Err(LibraryError::InvalidRoot(root.to_path_buf()));
        }
        let library = Self {
            root: root.to_path_buf(),
            index: RwLock::new(Arc::new(LibraryIndex::default())),
        };
        library.rescan().await?;
        Ok(library)
    }

    /// Rebuild the in-memory index from disk. Returns the asset count.
    pub async fn rescan(&self) -> Result<usize, LibraryError> {
        let root = self.root.clone();
        let index = tokio::task::spawn_blocking(move || build_index(&root)).await??;
        let count = index.by_id.len();
        tracing::debug!(
            root = %self.root.display(),
            assets = count,
            images = index.images.len(),
            videos = index.videos.len(),
            "Scanned library"
        );
        *self
            .index
            .write()
            .map_err(|e| LibraryError::io(&self.root, std::io::Error::other(e.to_string())))? =
            Arc::new(index);
        Ok(count)
    }

    fn snapshot(&self) -> Result<Arc<LibraryIndex>, LibraryError> {
        self.index
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|e| LibraryError::io(&self.root, std::io::Error::other(e.to_string())))
    }
}

#[async_trait]
impl PhotoInventory for FsLibrary {
    async fn asset(&self, asset_id: &str) -> Result<Option<LocalAsset>, LibraryError> {
        let index = self.snapshot()?;
        Ok(index.by_id.get(asset_id).map(|entry| entry.asset.clone()))
    }

    async fn assets_newest_first(
        &self,
        media: MediaKind,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<LocalAsset>, LibraryError> {
        let index = self.snapshot()?;
        let ids = match media {
            MediaKind::Image => &index.images,
            MediaKind::Video => &index.videos,
        };
        Ok(ids
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| index.by_id.get(id).map(|entry| entry.asset.clone()))
            .collect())
    }

    async fn all_asset_ids(&self) -> Result<Vec<String>, LibraryError> {
        let index = self.snapshot()?;
        Ok(index
            .images
            .iter()
            .chain(index.videos.iter())
            .cloned()
            .collect())
    }

    fn open_resource(
        &self,
        asset_id: &str,
        kind: ResourceKind,
    ) -> Result<Box<dyn Read + Send>, LibraryError> {
        let index = self.snapshot()?;
        let entry = index
            .by_id
            .get(asset_id)
            .ok_or_else(|| LibraryError::AssetNotFound {
                asset_id: asset_id.to_string(),
            })?;
        let path = entry
            .paths
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| LibraryError::ResourceMissing {
                asset_id: asset_id.to_string(),
                kind,
            })?;
        let file = std::fs::File::open(&path).map_err(|e| LibraryError::io(&path, e))?;
        Ok(Box::new(file))
    }
}

fn build_index(root: &Path) -> Result<LibraryIndex, LibraryError> {
    let mut groups: BTreeMap<(PathBuf, String), Vec<ScannedFile>> = BTreeMap::new();
    walk(root, root, &mut groups)?;

    let mut by_id = HashMap::new();
    for files in groups.into_values() {
        for entry in assets_from_group(root, files) {
            by_id.insert(entry.asset.id.clone(), entry);
        }
    }

    let mut images: Vec<&LocalAsset> = Vec::new();
    let mut videos: Vec<&LocalAsset> = Vec::new();
    for entry in by_id.values() {
        match entry.asset.media {
            MediaKind::Image => images.push(&entry.asset),
            MediaKind::Video => videos.push(&entry.asset),
        }
    }
    let newest_first = |list: &mut Vec<&LocalAsset>| {
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    };
    newest_first(&mut images);
    newest_first(&mut videos);
    let images = images.into_iter().map(|a| a.id.clone()).collect();
    let videos = videos.into_iter().map(|a| a.id.clone()).collect();

    Ok(LibraryIndex {
        by_id,
        images,
        videos,
    })
}

fn walk(
    root: &Path,
    dir: &Path,
    groups: &mut BTreeMap<(PathBuf, String), Vec<ScannedFile>>,
) -> Result<(), LibraryError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if dir == root => return Err(LibraryError::io(dir, e)),
        Err(e) => {
            tracing::warn!("Skipping unreadable directory {}: {}", dir.display(), e);
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if filename.starts_with('.') {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if metadata.is_dir() {
            walk(root, &path, groups)?;
            continue;
        }
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|e| e.to_str()),
        ) else {
            continue;
        };
        let extension = ext.to_ascii_lowercase();
        if !is_known_extension(&extension) {
            continue;
        }
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);
        groups
            .entry((dir.to_path_buf(), stem.to_string()))
            .or_default()
            .push(ScannedFile {
                path: path.clone(),
                filename,
                extension,
                size: metadata.len(),
                modified_at,
            });
    }
    Ok(())
}

fn is_known_extension(ext: &str) -> bool {
    ext == FAVORITE_MARKER
        || IMAGE_EXTENSIONS.contains(&ext)
        || RAW_EXTENSIONS.contains(&ext)
        || VIDEO_EXTENSIONS.contains(&ext)
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn resource(kind: ResourceKind, file: &ScannedFile) -> LocalResource {
    LocalResource {
        kind,
        filename: file.filename.clone(),
        size: file.size,
    }
}

fn assets_from_group(root: &Path, mut files: Vec<ScannedFile>) -> Vec<IndexedAsset> {
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    let is_favorite = files.iter().any(|f| f.extension == FAVORITE_MARKER);
    let of_kind = |exts: &[&str]| -> Vec<&ScannedFile> {
        files
            .iter()
            .filter(|f| exts.contains(&f.extension.as_str()))
            .collect()
    };
    let images = of_kind(IMAGE_EXTENSIONS);
    let raws = of_kind(RAW_EXTENSIONS);
    let videos = of_kind(VIDEO_EXTENSIONS);

    let mut assets = Vec::new();

    // An image with a RAW sibling is one asset; a lone RAW is its own primary.
    let (primary, raw) = match (images.first(), raws.first()) {
        (Some(image), raw) => (Some(*image), raw.copied()),
        (None, Some(raw)) => (Some(*raw), None),
        (None, None) => (None, None),
    };
    if let Some(primary) = primary {
        let summary = exif::read_summary(&primary.path).unwrap_or_else(|e| {
            tracing::debug!("Could not read EXIF from {}: {}", primary.path.display(), e);
            exif::ExifSummary::default()
        });
        let mut resources = vec![resource(ResourceKind::Primary, primary)];
        let mut paths = vec![(ResourceKind::Primary, primary.path.clone())];
        if let Some(raw) = raw {
            resources.push(resource(ResourceKind::Raw, raw));
            paths.push((ResourceKind::Raw, raw.path.clone()));
        }
        assets.push(IndexedAsset {
            asset: LocalAsset {
                id: relative_id(root, &primary.path),
                media: MediaKind::Image,
                created_at: summary.taken_at.unwrap_or(primary.modified_at),
                modified_at: primary.modified_at,
                is_favorite,
                latitude: summary.latitude,
                longitude: summary.longitude,
                cross_device_id: summary.unique_id,
                resources,
            },
            paths,
        });
    }

    for video in videos {
        assets.push(IndexedAsset {
            asset: LocalAsset {
                id: relative_id(root, &video.path),
                media: MediaKind::Video,
                created_at: video.modified_at,
                modified_at: video.modified_at,
                is_favorite,
                latitude: None,
                longitude: None,
                cross_device_id: None,
                resources: vec![resource(ResourceKind::Video, video)],
            },
            paths: vec![(ResourceKind::Video, video.path.clone())],
        });
    }

    assets
}
