//! Domain types for the kelp pipeline.
//!
//! All path fields use `PathBuf`; image names are always [`ImageName`].
//! Config-facing types are serializable via serde + serde_yaml.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// The unique key of an artifact: the image name it builds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageName(pub String);

impl ImageName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ImageName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ImageName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Tag to apply per image for one build pass.
pub type ImageTags = HashMap<ImageName, String>;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// An action category the dev loop can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Build,
    Sync,
    Deploy,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Build, Category::Sync, Category::Deploy];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Build => write!(f, "build"),
            Category::Sync => write!(f, "sync"),
            Category::Deploy => write!(f, "deploy"),
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "build" => Ok(Category::Build),
            "sync" => Ok(Category::Sync),
            "deploy" => Ok(Category::Deploy),
            other => Err(format!(
                "unknown category '{other}'; expected: build, sync, deploy"
            )),
        }
    }
}

/// Whether a deploy is followed by a blocking readiness check.
///
/// `Default` means the operator said nothing; it behaves like `Enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCheck {
    #[default]
    Default,
    Enabled,
    Disabled,
}

impl StatusCheck {
    /// Map an optional boolean flag (`--status-check[=true|false]`) onto the tri-state.
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            None => StatusCheck::Default,
            Some(true) => StatusCheck::Enabled,
            Some(false) => StatusCheck::Disabled,
        }
    }

    pub fn is_enabled(self) -> bool {
        match self {
            StatusCheck::Default | StatusCheck::Enabled => true,
            StatusCheck::Disabled => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Docker build settings for an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerArtifact {
    /// Dockerfile path, relative to the artifact context.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build_args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Default for DockerArtifact {
    fn default() -> Self {
        Self {
            dockerfile: default_dockerfile(),
            build_args: BTreeMap::new(),
            target: None,
        }
    }
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

/// Copy files under `src` (relative to the artifact context) into `dest` inside
/// running containers instead of rebuilding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRule {
    pub src: PathBuf,
    pub dest: String,
}

/// Post-build verification commands for an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub commands: Vec<String>,
    /// Paths (relative to the context) whose changes only require a retest.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

/// A buildable unit of the project; maps to one deployable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub image: ImageName,
    /// Build context (workspace). Absolute once the config is loaded.
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default)]
    pub docker: DockerArtifact,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync: Vec<SyncRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestConfig>,
}

impl Artifact {
    pub fn new(image: impl Into<ImageName>, context: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            context: context.into(),
            docker: DockerArtifact::default(),
            sync: Vec::new(),
            test: None,
        }
    }

    /// Whether `path` lives inside this artifact's build context.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.context)
    }

    /// Container destination for a local file covered by a sync rule.
    pub fn sync_destination(&self, path: &Path) -> Option<String> {
        for rule in &self.sync {
            let root = self.context.join(&rule.src);
            let Ok(rel) = path.strip_prefix(&root) else {
                continue;
            };
            let dest = rule.dest.trim_end_matches('/');
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if rel.is_empty() {
                return Some(dest.to_string());
            }
            return Some(format!("{dest}/{rel}"));
        }
        None
    }

    /// Whether `path` only affects this artifact's tests.
    pub fn is_test_path(&self, path: &Path) -> bool {
        self.test.as_ref().is_some_and(|test| {
            test.paths
                .iter()
                .any(|p| path.starts_with(self.context.join(p)))
        })
    }

    pub fn test_commands(&self) -> &[String] {
        self.test
            .as_ref()
            .map(|t| t.commands.as_slice())
            .unwrap_or_default()
    }
}

/// An artifact resolved to a concrete deployable reference (`name:tag` or digest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedArtifact {
    pub image_name: ImageName,
    pub tag: String,
}

impl TaggedArtifact {
    pub fn new(image_name: impl Into<ImageName>, tag: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            tag: tag.into(),
        }
    }
}

/// Files to push into running containers of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    pub image: ImageName,
    /// Local absolute path → container destination.
    pub copy: BTreeMap<PathBuf, String>,
    /// Container paths to remove.
    pub delete: BTreeSet<String>,
}

impl SyncItem {
    pub fn new(image: impl Into<ImageName>) -> Self {
        Self {
            image: image.into(),
            copy: BTreeMap::new(),
            delete: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.delete.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_check_tri_state() {
        assert!(StatusCheck::from_flag(None).is_enabled());
        assert!(StatusCheck::from_flag(Some(true)).is_enabled());
        assert!(!StatusCheck::from_flag(Some(false)).is_enabled());
        assert_eq!(StatusCheck::default(), StatusCheck::Default);
    }

    #[test]
    fn category_parse_and_display() {
        for category in Category::ALL {
            assert_eq!(category.to_string().parse::<Category>(), Ok(category));
        }
        assert_eq!("DEPLOY".parse::<Category>(), Ok(Category::Deploy));
        assert!("test".parse::<Category>().is_err());
    }

    #[test]
    fn sync_destination_maps_relative_path() {
        let mut artifact = Artifact::new("web", "/ws/web");
        artifact.sync.push(SyncRule {
            src: PathBuf::from("static"),
            dest: "/app/static/".to_string(),
        });

        assert_eq!(
            artifact.sync_destination(Path::new("/ws/web/static/css/site.css")),
            Some("/app/static/css/site.css".to_string())
        );
        assert_eq!(artifact.sync_destination(Path::new("/ws/web/src/main.rs")), None);
    }

    #[test]
    fn sync_item_starts_empty_for_its_image() {
        let item = SyncItem::new("web");
        assert_eq!(item.image, ImageName::from("web"));
        assert!(item.copy.is_empty());
        assert!(item.delete.is_empty());
        assert_eq!(item.clone(), item);
    }

    #[test]
    fn test_paths_are_relative_to_context() {
        let mut artifact = Artifact::new("api", "/ws/api");
        artifact.test = Some(TestConfig {
            commands: vec!["make test".to_string()],
            paths: vec![PathBuf::from("tests")],
        });

        assert!(artifact.is_test_path(Path::new("/ws/api/tests/it.rs")));
        assert!(!artifact.is_test_path(Path::new("/ws/api/src/lib.rs")));
        assert_eq!(artifact.test_commands(), ["make test".to_string()]);
    }

    #[test]
    fn image_name_display() {
        assert_eq!(ImageName::from("gcr.io/x/app").to_string(), "gcr.io/x/app");
    }
}
