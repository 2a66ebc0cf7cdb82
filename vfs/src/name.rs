//! File names and file types.

use serde::{Deserialize, Serialize};
use url::Url;

/// The name of a virtual file: its full URI plus the pieces callers
/// usually need.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileName {
    /// URI scheme (`file`, `mem`, ...).
    scheme: String,

    /// Absolute path within the backend, always starting with `/`.
    path: String,
}

impl FileName {
    /// Create a file name from a scheme and an absolute path.
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: normalize_path(&path.into()),
        }
    }

    /// The URI scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The absolute path within the backend.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The full URI, e.g. `mem:///in/order.xml`.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.scheme, self.path)
    }

    /// The last path segment, empty for the root.
    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// The extension of the base name without the dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let base = self.base_name();
        match base.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&base[idx + 1..]),
        }
    }

    /// The parent name, `None` for the root.
    pub fn parent(&self) -> Option<FileName> {
        if self.path == "/" {
            return None;
        }
        let idx = self.path.rfind('/')?;
        let parent = if idx == 0 { "/" } else { &self.path[..idx] };
        Some(Self::new(self.scheme.clone(), parent))
    }

    /// The name of a direct child.
    pub fn child(&self, name: &str) -> FileName {
        let path = if self.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.path)
        };
        Self::new(self.scheme.clone(), path)
    }
}

impl std::fmt::Display for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Split a URI into its scheme and the remainder after `://`.
///
/// Bare paths have no scheme.
pub fn split_scheme(uri: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some((scheme, rest))
}

/// Replace any password in a URI with `***` so it can be logged.
pub fn mask_uri_password(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("***")).is_ok() {
                url.to_string()
            } else {
                uri.to_string()
            }
        }
        _ => uri.to_string(),
    }
}

/// What kind of node a virtual file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Does not exist (yet).
    Imaginary,

    /// Regular file with content.
    File,

    /// Container with children.
    Folder,
}

impl FileType {
    /// Whether files of this type have byte content.
    pub fn has_content(self) -> bool {
        self == Self::File
    }

    /// Whether files of this type carry attributes such as timestamps.
    pub fn has_attributes(self) -> bool {
        matches!(self, Self::File | Self::Folder)
    }

    /// Whether files of this type can contain children.
    pub fn has_children(self) -> bool {
        self == Self::Folder
    }
}
