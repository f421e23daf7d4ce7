//! Global and per-image configuration (part of C8 Session's inputs).
//!
//! Grounded in `moncic/moncic.py`'s `MoncicConfig` (global YAML config,
//! first-found of a search path) and `moncic/imagescan.py`/the per-image
//! YAML descriptors `ConfiguredImages` resolves. The exact search path
//! documented upstream lives outside this corpus; `GlobalConfig::search_paths`
//! follows the XDG convention the rest of this ecosystem uses, falling back
//! to `/etc`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::image::ImageConfig;

/// Global configuration, loaded once per `main()` invocation from the
/// first config file found on [`GlobalConfig::search_paths`], or defaulted
/// if none exists (a missing config file is not an error).
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    pub imagedir: Option<Utf8PathBuf>,
    pub imageconfdirs: Vec<Utf8PathBuf>,
    pub deb_cache_dir: Option<Utf8PathBuf>,
    pub extra_packages_dir: Option<Utf8PathBuf>,
    pub tmpfs: Option<bool>,
    pub compression: Option<String>,
    #[serde(default)]
    pub auto_sudo: bool,
    pub build_artifacts_dir: Option<Utf8PathBuf>,
}

impl GlobalConfig {
    /// Standard search path, in order, for the global config file.
    pub fn search_paths() -> Vec<Utf8PathBuf> {
        let mut paths = Vec::new();
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(Utf8PathBuf::from(xdg).join("monci/monci.yaml"));
        } else if let Ok(home) = std::env::var("HOME") {
            paths.push(Utf8PathBuf::from(home).join(".config/monci/monci.yaml"));
        }
        paths.push(Utf8PathBuf::from("/etc/monci/monci.yaml"));
        paths
    }

    /// Loads the first config file found on [`Self::search_paths`],
    /// defaulting if none exists.
    pub fn load_default() -> Result<Self> {
        for path in Self::search_paths() {
            if path.is_file() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn load(path: &Utf8Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {path}"))?;
        let config: Self =
            serde_yaml::from_reader(BufReader::new(file)).with_context(|| format!("parsing {path} as YAML"))?;
        Ok(config)
    }
}

/// A polymorphic `forward_user` value: either a single user or a list,
/// both normalized to a `Vec<String>`.
fn deserialize_forward_user<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct ForwardUserVisitor;

    impl<'de> serde::de::Visitor<'de> for ForwardUserVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                out.push(item);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(ForwardUserVisitor)
}

/// A per-image YAML descriptor, loaded from one file under an
/// `imageconfdirs` entry, naming the image after the file's stem.
///
/// Grounded in `moncic/images.py`'s image config schema: `distro` and
/// `extends` are mutually exclusive, `forward_user` accepts either a
/// string or a list.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ImageDescriptor {
    pub distro: Option<String>,
    pub extends: Option<String>,
    pub packages: Vec<String>,
    pub maintscript: Option<String>,
    #[serde(deserialize_with = "deserialize_forward_user")]
    pub forward_user: Vec<String>,
    pub backup: bool,
    pub compression: Option<String>,
    pub tmpfs: Option<bool>,
}

impl ImageDescriptor {
    pub fn validate(&self, name: &str) -> Result<()> {
        match (&self.distro, &self.extends) {
            (Some(_), Some(_)) => bail!("image {name:?}: 'distro' and 'extends' are mutually exclusive"),
            (None, None) => bail!("image {name:?}: exactly one of 'distro' or 'extends' is required"),
            _ => Ok(()),
        }
    }

    pub fn to_image_config(&self) -> ImageConfig {
        ImageConfig {
            packages: self.packages.clone(),
            maintscript: self.maintscript.clone(),
            forward_users: self.forward_user.clone(),
            backup: self.backup,
            compression: self.compression.clone(),
            tmpfs: self.tmpfs,
        }
    }
}

/// Recognized top-level keys in an image descriptor, used to warn (not
/// fail) on unknown keys left in the YAML mapping.
const KNOWN_IMAGE_KEYS: &[&str] =
    &["distro", "extends", "packages", "maintscript", "forward_user", "backup", "compression", "tmpfs"];

/// Loads every `*.yaml`/`*.yml` file directly under each of `dirs`, later
/// directories overriding earlier ones for a given image name, as images
/// keyed by filename stem.
pub fn load_image_descriptors(dirs: &[Utf8PathBuf]) -> Result<BTreeMap<String, ImageDescriptor>> {
    let mut descriptors = BTreeMap::new();

    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("reading {dir}")),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
            if !is_yaml {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            warn_unknown_keys(stem, &contents);
            let descriptor: ImageDescriptor =
                serde_yaml::from_str(&contents).with_context(|| format!("parsing {} as an image descriptor", path.display()))?;
            descriptor.validate(stem)?;
            descriptors.insert(stem.to_string(), descriptor);
        }
    }

    Ok(descriptors)
}

fn warn_unknown_keys(image_name: &str, contents: &str) {
    let Ok(serde_yaml::Value::Mapping(map)) = serde_yaml::from_str::<serde_yaml::Value>(contents) else { return };
    for key in map.keys() {
        if let Some(key) = key.as_str() {
            if !KNOWN_IMAGE_KEYS.contains(&key) {
                tracing::warn!("image {image_name:?}: unknown config key {key:?}, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_descriptor_rejects_distro_and_extends_together() {
        let descriptor = ImageDescriptor { distro: Some("debian:sid".into()), extends: Some("base".into()), ..Default::default() };
        assert!(descriptor.validate("x").is_err());
    }

    #[test]
    fn image_descriptor_rejects_neither_distro_nor_extends() {
        let descriptor = ImageDescriptor::default();
        assert!(descriptor.validate("x").is_err());
    }

    #[test]
    fn forward_user_accepts_single_string() {
        let descriptor: ImageDescriptor = serde_yaml::from_str("distro: debian:sid\nforward_user: alice\n").unwrap();
        assert_eq!(descriptor.forward_user, vec!["alice".to_string()]);
    }

    #[test]
    fn forward_user_accepts_list() {
        let descriptor: ImageDescriptor = serde_yaml::from_str("distro: debian:sid\nforward_user: [alice, bob]\n").unwrap();
        assert_eq!(descriptor.forward_user, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn load_image_descriptors_keys_by_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("bookworm.yaml"), "distro: debian:bookworm\n").unwrap();
        let descriptors = load_image_descriptors(&[path]).unwrap();
        assert!(descriptors.contains_key("bookworm"));
    }

    #[test]
    fn global_config_defaults_when_file_missing() {
        let config = GlobalConfig::default();
        assert!(config.imagedir.is_none());
        assert!(!config.auto_sudo);
    }
}
