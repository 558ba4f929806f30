use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::ValidationError;

/// Where counters files live and how their length is aligned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Directory resolving the names of [`Config::path_for`].
    pub directory: PathBuf,
    /// Alignment of the total region length and stride of the pre-touch. A power of two.
    pub page_size: usize,
}

impl Config {
    /// Overrides the directory.
    pub const DIRECTORY_ENV: &'static str = "SHM_COUNTERS_DIR";
    /// Overrides the page size, in bytes.
    pub const PAGE_SIZE_ENV: &'static str = "SHM_COUNTERS_PAGE_SIZE";

    /// The default configuration with overrides from the process environment.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::default().apply(|name| std::env::var_os(name))
    }

    /// Apply overrides from the variables that `lookup` resolves.
    pub fn apply(mut self, lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, ValidationError> {
        if let Some(directory) = lookup(Self::DIRECTORY_ENV) {
            if directory.is_empty() {
                return Err(ValidationError::InvalidEnv {
                    name: Self::DIRECTORY_ENV,
                    value: String::new(),
                });
            }

            self.directory = PathBuf::from(directory);
        }

        if let Some(page_size) = lookup(Self::PAGE_SIZE_ENV) {
            let invalid = || ValidationError::InvalidEnv {
                name: Self::PAGE_SIZE_ENV,
                value: page_size.to_string_lossy().into_owned(),
            };

            self.page_size = page_size
                .to_str()
                .and_then(|value| value.trim().parse().ok())
                .ok_or_else(invalid)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.page_size.is_power_of_two() {
            return Err(ValidationError::InvalidPageSize(self.page_size));
        }

        Ok(())
    }

    /// The path of the counters file called `name`.
    pub fn path_for(&self, name: impl AsRef<Path>) -> PathBuf {
        self.directory.join(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        let user = std::env::var("USER")
            .ok()
            .filter(|user| !user.is_empty())
            .unwrap_or_else(|| "default".to_string());

        let shm = Path::new("/dev/shm");
        let base = if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        };

        Config {
            directory: base.join(format!("shm-counters-{user}")),
            page_size: host_page_size(),
        }
    }
}

/// The page size of the host, 4096 if it can not be determined.
pub fn host_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    match usize::try_from(size) {
        Ok(size) if size.is_power_of_two() => size,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::error::ValidationError;
    use std::ffi::OsString;
    use std::path::PathBuf;

    fn base() -> Config {
        Config {
            directory: PathBuf::from("/somewhere"),
            page_size: 4096,
        }
    }

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config
            .directory
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with("shm-counters-")));
    }

    #[test]
    fn overrides() {
        let config = base()
            .apply(|name| match name {
                Config::DIRECTORY_ENV => Some(OsString::from("/run/counters")),
                Config::PAGE_SIZE_ENV => Some(OsString::from("16384")),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.directory, PathBuf::from("/run/counters"));
        assert_eq!(config.page_size, 16384);
        assert_eq!(
            config.path_for("service"),
            PathBuf::from("/run/counters/service")
        );
    }

    #[test]
    fn no_overrides() {
        assert_eq!(base().apply(|_| None), Ok(base()));
    }

    #[test]
    fn rejects_bad_page_sizes() {
        let with_page_size = |value: &'static str| {
            base().apply(move |name| (name == Config::PAGE_SIZE_ENV).then(|| value.into()))
        };

        assert_eq!(
            with_page_size("4k"),
            Err(ValidationError::InvalidEnv {
                name: Config::PAGE_SIZE_ENV,
                value: "4k".into(),
            })
        );
        assert_eq!(
            with_page_size("3000"),
            Err(ValidationError::InvalidPageSize(3000))
        );
        assert_eq!(with_page_size("0"), Err(ValidationError::InvalidPageSize(0)));
        assert_eq!(with_page_size("65536").map(|c| c.page_size), Ok(65536));
    }

    #[test]
    fn rejects_empty_directory() {
        let config = base().apply(|name| (name == Config::DIRECTORY_ENV).then(OsString::new));
        assert!(matches!(config, Err(ValidationError::InvalidEnv { .. })));
    }
}
