//! Resource manifest naming the data of an attack.
//!
//! The manifest is a JSON object mapping resource names to paths:
//! ```json
//! { "profile": "data/profile", "attack": "data/attack", "poi": "data/poi" }
//! ```
//! Relative paths are resolved against the directory of the manifest.
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use crate::Error;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Resources {
    paths: HashMap<String, PathBuf>,
}

impl Resources {
    /// Read a manifest file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let resources: Resources = serde_json::from_reader(BufReader::new(file))?;

        let base = path.parent().unwrap_or(Path::new(""));
        Ok(resources.relative_to(base))
    }

    /// Parse a manifest, resolving relative paths against `base`.
    pub fn from_json(json: &str, base: &Path) -> Result<Self, Error> {
        let resources: Resources = serde_json::from_str(json)?;

        Ok(resources.relative_to(base))
    }

    fn relative_to(self, base: &Path) -> Self {
        Self {
            paths: self
                .paths
                .into_iter()
                .map(|(name, path)| (name, base.join(path)))
                .collect(),
        }
    }

    /// Return the path of the named resource.
    pub fn path(&self, name: &str) -> Result<&Path, Error> {
        self.paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::MissingResource(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::Resources;
    use crate::Error;
    use std::path::Path;

    #[test]
    fn test_resources() {
        let resources = Resources::from_json(
            r#"{"profile": "data/profile", "poi": "/srv/poi"}"#,
            Path::new("/home/attack"),
        )
        .unwrap();

        assert_eq!(
            resources.path("profile").unwrap(),
            Path::new("/home/attack/data/profile")
        );
        assert_eq!(resources.path("poi").unwrap(), Path::new("/srv/poi"));
        assert!(matches!(
            resources.path("attack"),
            Err(Error::MissingResource(name)) if name == "attack"
        ));
    }

    #[test]
    fn test_resources_invalid() {
        assert!(matches!(
            Resources::from_json(r#"{"profile": 3}"#, Path::new("")),
            Err(Error::ManifestError(_))
        ));
        assert!(matches!(
            Resources::from_json(r#"["profile"]"#, Path::new("")),
            Err(Error::ManifestError(_))
        ));
    }

    #[test]
    fn test_resources_open() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("resources.json");
        std::fs::write(&manifest, r#"{"attack": "attack"}"#).unwrap();

        let resources = Resources::open(&manifest).unwrap();
        assert_eq!(resources.path("attack").unwrap(), dir.path().join("attack"));

        assert!(matches!(
            Resources::open(dir.path().join("missing.json")),
            Err(Error::IoError(_))
        ));
    }
}
