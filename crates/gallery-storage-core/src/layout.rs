//! Fixed remote directory layout and remote path helpers.

use std::fmt;

use crate::error::StorageError;

/// Root directory used when a connection does not name one.
pub const DEFAULT_ROOT: &str = "sd_web_ui";

/// Extensions the browser treats as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp"];

/// Suffix of in-flight uploads, renamed into place once complete.
pub const PARTIAL_SUFFIX: &str = ".part";

/// The five sub-directories created under every remote root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GallerySubdir {
    Txt2ImgImages,
    Txt2ImgGrids,
    Img2ImgImages,
    Img2ImgGrids,
    ExtrasImages,
}

impl GallerySubdir {
    pub const ALL: [GallerySubdir; 5] = [
        Self::Txt2ImgImages,
        Self::Txt2ImgGrids,
        Self::Img2ImgImages,
        Self::Img2ImgGrids,
        Self::ExtrasImages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Txt2ImgImages => "txt2img-images",
            Self::Txt2ImgGrids => "txt2img-grids",
            Self::Img2ImgImages => "img2img-images",
            Self::Img2ImgGrids => "img2img-grids",
            Self::ExtrasImages => "extras-images",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    /// Map a gallery tab label to its directory.
    pub fn from_tab(tab: &str) -> Option<Self> {
        match tab {
            "txt2img" => Some(Self::Txt2ImgImages),
            "img2img" => Some(Self::Img2ImgImages),
            "txt2img-grids" => Some(Self::Txt2ImgGrids),
            "img2img-grids" => Some(Self::Img2ImgGrids),
            "Extras" | "extras" => Some(Self::ExtrasImages),
            _ => None,
        }
    }
}

impl fmt::Display for GallerySubdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a stored artifact, derived from the generator's logical name.
///
/// The sub-directory is the last path segment naming one of the fixed layout
/// directories; when none does, the immediate parent segment is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub subdir: String,
    pub basename: String,
}

impl ArtifactName {
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        let segments: Vec<&str> = name
            .split(['/', '\\'])
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if segments.contains(&"..") {
            return Err(StorageError::Transfer(format!(
                "Refusing to store '{}': parent directory references are not allowed",
                name
            )));
        }

        let (last, parents) = segments.split_last().ok_or_else(|| {
            StorageError::Transfer(format!("Cannot derive a file name from '{}'", name))
        })?;

        let basename = strip_png_extension(last);
        if basename.is_empty() {
            return Err(StorageError::Transfer(format!(
                "Cannot derive a file name from '{}'",
                name
            )));
        }

        let subdir = parents
            .iter()
            .rev()
            .find(|s| GallerySubdir::from_dir_name(s).is_some())
            .or_else(|| parents.last())
            .ok_or_else(|| {
                StorageError::Transfer(format!(
                    "Cannot derive a destination sub-directory from '{}'",
                    name
                ))
            })?;

        Ok(Self {
            subdir: (*subdir).to_string(),
            basename: basename.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}.png", self.basename)
    }
}

fn strip_png_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        &name[..name.len() - 4]
    } else {
        name
    }
}

/// Join remote path segments with single slashes, keeping a leading slash if
/// the first segment had one.
pub fn join_remote(segments: &[&str]) -> String {
    let absolute = segments.first().is_some_and(|s| s.starts_with('/'));
    let joined = segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Directories to ensure, parents first: each segment of `root`, then the
/// fixed sub-directories under it. Absolute roots stay absolute.
pub fn bootstrap_chain(root: &str) -> Vec<String> {
    let mut current = if root.starts_with('/') {
        "/".to_string()
    } else {
        String::new()
    };
    let mut chain = Vec::new();
    for segment in root.split('/').filter(|s| !s.is_empty()) {
        current = join_remote(&[&current, segment]);
        chain.push(current.clone());
    }
    for subdir in GallerySubdir::ALL {
        chain.push(join_remote(&[&current, subdir.as_str()]));
    }
    chain
}

/// One entry of a raw directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub name: String,
    pub is_dir: bool,
    /// Modification time in seconds; 0 when the protocol does not report it.
    pub mtime: u64,
}

impl RawEntry {
    pub fn file(name: impl Into<String>, mtime: u64) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            mtime,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            mtime: 0,
        }
    }
}

/// Browsable file names of a raw listing, oldest first.
///
/// Drops `.`/`..`, directories, non-images and in-flight uploads, then sorts
/// by modification time and name so files written within the same second
/// keep their sequence order.
pub fn listing_entries(raw: Vec<RawEntry>) -> Vec<String> {
    let mut entries: Vec<(u64, String)> = raw
        .into_iter()
        .filter(|e| !e.is_dir && e.name != "." && e.name != ".." && is_image_file(&e.name))
        .map(|e| (e.mtime, e.name))
        .collect();
    entries.sort();
    entries.into_iter().map(|(_, name)| name).collect()
}

/// Suffix for a transfer error when a temporary upload could not be removed.
pub fn leftover_note(tmp: &str, removed: bool) -> String {
    if removed {
        String::new()
    } else {
        format!(" (partial file {} left behind)", tmp)
    }
}

/// Drop the synthetic `.` and `..` entries every listing protocol returns.
pub fn strip_synthetic_entries<S: AsRef<str>>(names: Vec<S>) -> Vec<S> {
    names
        .into_iter()
        .filter(|n| {
            let n = n.as_ref();
            n != "." && n != ".."
        })
        .collect()
}

/// Whether a listed file name looks like a browsable image.
pub fn is_image_file(name: &str) -> bool {
    if name.ends_with(PARTIAL_SUFFIX) {
        return false;
    }
    name.rsplit_once('.')
        .map(|(_, ext)| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Temporary name used while an upload is in flight.
pub fn partial_name(file_name: &str, token: &str) -> String {
    format!("{}.{}{}", file_name, token, PARTIAL_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_with_layout_dir() {
        let name = ArtifactName::parse("outputs/txt2img-images/00012-1234").unwrap();
        assert_eq!(name.subdir, "txt2img-images");
        assert_eq!(name.basename, "00012-1234");
        assert_eq!(name.file_name(), "00012-1234.png");
    }

    #[test]
    fn test_parse_name_with_date_folder() {
        let name = ArtifactName::parse("outputs/img2img-images/2024-03-01/00003-99.png").unwrap();
        assert_eq!(name.subdir, "img2img-images");
        assert_eq!(name.basename, "00003-99");
    }

    #[test]
    fn test_parse_name_falls_back_to_parent() {
        let name = ArtifactName::parse(r"outputs\custom\grid-0001").unwrap();
        assert_eq!(name.subdir, "custom");
        assert_eq!(name.basename, "grid-0001");
    }

    #[test]
    fn test_parse_name_without_directory_fails() {
        assert!(ArtifactName::parse("00001-1").is_err());
        assert!(ArtifactName::parse("").is_err());
    }

    #[test]
    fn test_parse_name_rejects_parent_references() {
        for name in [
            "outputs/../00001-1",
            "../../etc/00001-1",
            r"outputs\txt2img-images\..\00001-1",
            "outputs/txt2img-images/../../x/00001-1",
        ] {
            let err = ArtifactName::parse(name).unwrap_err();
            assert!(matches!(err, StorageError::Transfer(_)), "{}", name);
        }
    }

    #[test]
    fn test_bootstrap_chain_nested_absolute_root() {
        let chain = bootstrap_chain("/photos/sd_web_ui");
        assert_eq!(chain[0], "/photos");
        assert_eq!(chain[1], "/photos/sd_web_ui");
        assert_eq!(chain[2], "/photos/sd_web_ui/txt2img-images");
        assert_eq!(chain.len(), 2 + GallerySubdir::ALL.len());
    }

    #[test]
    fn test_bootstrap_chain_relative_root() {
        let chain = bootstrap_chain("sd_web_ui/");
        assert_eq!(chain[0], "sd_web_ui");
        assert_eq!(chain[1], "sd_web_ui/txt2img-images");
        assert!(chain.iter().all(|d| !d.starts_with('/')));
    }

    #[test]
    fn test_bootstrap_chain_at_filesystem_root() {
        let chain = bootstrap_chain("/");
        assert_eq!(chain.len(), GallerySubdir::ALL.len());
        assert_eq!(chain[0], "/txt2img-images");
        assert!(chain.iter().all(|d| d.starts_with('/') && !d.starts_with("//")));
    }

    #[test]
    fn test_listing_entries_filters_and_orders() {
        let raw = vec![
            RawEntry::file(".", 0),
            RawEntry::file("..", 0),
            RawEntry::file("b.png", 200),
            RawEntry::dir("sub"),
            RawEntry::file("x.png.1f.part", 50),
            RawEntry::file("notes.txt", 10),
            RawEntry::file("a2.png", 100),
            RawEntry::file("a1.png", 100),
        ];
        assert_eq!(listing_entries(raw), vec!["a1.png", "a2.png", "b.png"]);
    }

    #[test]
    fn test_listing_entries_without_mtime_sorts_by_name() {
        let raw = vec![
            RawEntry::file("00002-1.png", 0),
            RawEntry::file("00001-9.png", 0),
        ];
        assert_eq!(listing_entries(raw), vec!["00001-9.png", "00002-1.png"]);
    }

    #[test]
    fn test_leftover_note() {
        assert_eq!(leftover_note("/d/a.png.1.part", true), "");
        assert_eq!(
            leftover_note("/d/a.png.1.part", false),
            " (partial file /d/a.png.1.part left behind)"
        );
    }

    #[test]
    fn test_strip_synthetic_entries() {
        let raw = vec![".", "..", "a.png", "b.png"];
        assert_eq!(strip_synthetic_entries(raw), vec!["a.png", "b.png"]);

        let already_clean = vec!["a.png".to_string()];
        assert_eq!(strip_synthetic_entries(already_clean), vec!["a.png".to_string()]);
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote(&["/srv/images/", "txt2img-images", "a.png"]), "/srv/images/txt2img-images/a.png");
        assert_eq!(join_remote(&["sd_web_ui", "extras-images"]), "sd_web_ui/extras-images");
        assert_eq!(join_remote(&["/", "sd_web_ui"]), "/sd_web_ui");
    }

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file("00001-1.png"));
        assert!(is_image_file("photo.JPEG"));
        assert!(!is_image_file("notes.txt"));
        assert!(!is_image_file("00001-1.png.3f2a.part"));
        assert!(!is_image_file("README"));
    }

    #[test]
    fn test_tab_mapping() {
        assert_eq!(GallerySubdir::from_tab("txt2img"), Some(GallerySubdir::Txt2ImgImages));
        assert_eq!(GallerySubdir::from_tab("Extras"), Some(GallerySubdir::ExtrasImages));
        assert_eq!(GallerySubdir::from_tab("unknown"), None);
    }
}
