//! Optional TOML defaults for the CLI.
//!
//! ```toml
//! [image]
//! default = "/var/tmp/vol.img"
//!
//! [format]
//! block_size = 4096
//! blocks = 32768
//!
//! [mount]
//! cache_blocks = 2048
//! ```
//!
//! Command-line flags win over every value found here.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use balfs::{FormatOptions, FsOptions};

#[derive(Debug, Default)]
pub struct CliConfig {
    source: Option<PathBuf>,
    file: ConfigFile,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config {path} does not exist")]
    Missing { path: PathBuf },
}

impl CliConfig {
    /// Reads `explicit` when given (it must exist), otherwise the per-user
    /// config file when there is one.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let file = match explicit {
            Some(path) if !path.exists() => return Err(ConfigError::Missing { path }),
            Some(path) => Some(path),
            None => default_config_path().filter(|path| path.exists()),
        };
        match file {
            Some(path) => Ok(Self {
                file: ConfigFile::parse(&path)?,
                source: Some(path),
            }),
            None => Ok(Self::default()),
        }
    }

    /// The file the settings came from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn default_image(&self) -> Option<&PathBuf> {
        self.file.image.default.as_ref()
    }

    pub fn format_options(&self) -> FormatOptions {
        let mut opts = FormatOptions::default();
        self.file.format.apply(&mut opts);
        opts
    }

    pub fn mount_options(&self) -> FsOptions {
        let mut opts = FsOptions::default();
        self.file.mount.apply(&mut opts);
        opts
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("balfs").join("config.toml"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    image: ImageDefaults,
    format: FormatDefaults,
    mount: MountDefaults,
}

impl ConfigFile {
    fn parse(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Malformed {
            path: path.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ImageDefaults {
    default: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FormatDefaults {
    block_size: Option<usize>,
    blocks: Option<u32>,
    journal_blocks: Option<u32>,
    journal_max_batch: Option<u32>,
    journal_max_age_secs: Option<u32>,
    label: Option<String>,
}

impl FormatDefaults {
    fn apply(&self, opts: &mut FormatOptions) {
        opts.block_size = self.block_size.unwrap_or(opts.block_size);
        opts.block_count = self.blocks.unwrap_or(opts.block_count);
        opts.journal_blocks = self.journal_blocks.or(opts.journal_blocks);
        opts.journal_max_batch = self.journal_max_batch.unwrap_or(opts.journal_max_batch);
        opts.journal_max_age_secs = self.journal_max_age_secs.unwrap_or(opts.journal_max_age_secs);
        if let Some(label) = &self.label {
            opts.label.clone_from(label);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MountDefaults {
    cache_blocks: Option<usize>,
    tail_limit: Option<usize>,
    verify_on_read: Option<bool>,
}

impl MountDefaults {
    fn apply(&self, opts: &mut FsOptions) {
        opts.cache_blocks = self.cache_blocks.unwrap_or(opts.cache_blocks);
        opts.tail_limit = self.tail_limit.or(opts.tail_limit);
        opts.verify_on_read = self.verify_on_read.unwrap_or(opts.verify_on_read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "[image]\ndefault = \"vol.img\"\n[format]\nblock_size = 1024\nlabel = \"scratch\"\n[mount]\ntail_limit = 100\n",
        );
        let config = CliConfig::load(Some(path.clone())).unwrap();
        assert_eq!(config.path(), Some(path.as_path()));
        assert_eq!(config.default_image(), Some(&PathBuf::from("vol.img")));
        let fmt = config.format_options();
        assert_eq!(fmt.block_size, 1024);
        assert_eq!(fmt.block_count, FormatOptions::default().block_count);
        assert_eq!(fmt.label, "scratch");
        assert_eq!(config.mount_options().tail_limit, Some(100));
    }

    #[test]
    fn unknown_keys_and_missing_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "[format]\nblocksize = 1024\n");
        assert!(matches!(
            CliConfig::load(Some(path)),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            CliConfig::load(Some(dir.path().join("absent.toml"))),
            Err(ConfigError::Missing { .. })
        ));
    }
}
