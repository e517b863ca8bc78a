//! Application directory structure for dockhand.
//!
//! Provides a single `DockhandPaths` struct that resolves all standard
//! directories and ensures they exist on first launch. Follows macOS
//! conventions:
//!
//! - Config:    `~/.config/dockhand/`  (human-editable, XDG-style)
//! - Data:      `~/Library/Application Support/dev.dockhand/`
//! - Cache:     `~/Library/Caches/dev.dockhand/`
//! - Logs:      `~/Library/Logs/dockhand/`
//!
//! On non-macOS, falls back to XDG paths. `XDG_CONFIG_HOME` is honoured on
//! every platform; empty XDG variables are ignored.

use std::path::{Path, PathBuf};

use tracing::debug;
#[cfg(target_os = "macos")]
use tracing::warn;

const BUNDLE_ID: &str = "dev.dockhand";
const APP_NAME: &str = "dockhand";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct DockhandPaths {
    /// Human-editable config: `~/.config/dockhand/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// VM disk images (root + data)
    pub vms: PathBuf,
    /// vfkit sockets and other regenerable runtime files
    pub cache: PathBuf,
    /// Application and guest console logs
    pub logs: PathBuf,
}

impl DockhandPaths {
    /// Resolve all paths from `$HOME` and the XDG environment.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        Some(Self::from_home(&home, |var| std::env::var(var).ok()))
    }

    /// Resolve against `home`, reading XDG overrides through `env`.
    pub fn from_home(home: &Path, env: impl Fn(&str) -> Option<String>) -> Self {
        let base = BaseDirs::for_platform(home, &env);
        Self {
            config: base.config,
            vms: base.data.join("vms"),
            data: base.data,
            cache: base.cache,
            logs: base.logs,
        }
    }

    /// Root every directory under `root`. Used by tests and portable installs.
    pub fn under(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            vms: root.join("data").join("vms"),
            cache: root.join("cache"),
            logs: root.join("logs"),
        }
    }

    /// Default config file location.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("dockhand.toml")
    }

    /// Persisted `{state, pid, timestamp}` session record.
    pub fn state_file(&self) -> PathBuf {
        self.data.join("session.json")
    }

    /// Directory holding the vfkit vsock unix sockets.
    pub fn socket_dir(&self) -> PathBuf {
        self.cache.join("sockets")
    }

    /// Create every directory that is missing. On macOS the disk images and
    /// runtime sockets are kept out of Time Machine backups.
    pub fn ensure(&self) -> std::io::Result<()> {
        let socket_dir = self.socket_dir();
        for dir in [&self.config, &self.data, &self.vms, &self.cache, &socket_dir, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "directory ready");
        }

        #[cfg(target_os = "macos")]
        exclude_from_backups(&[self.vms.as_path(), self.cache.as_path()]);

        Ok(())
    }
}

/// Platform base directories before dockhand's own subdirectories.
struct BaseDirs {
    config: PathBuf,
    data: PathBuf,
    cache: PathBuf,
    logs: PathBuf,
}

impl BaseDirs {
    #[cfg(target_os = "macos")]
    fn for_platform(home: &Path, env: &impl Fn(&str) -> Option<String>) -> Self {
        let library = home.join("Library");
        Self {
            config: xdg_dir(env, "XDG_CONFIG_HOME", home.join(".config")).join(APP_NAME),
            data: library.join("Application Support").join(BUNDLE_ID),
            cache: library.join("Caches").join(BUNDLE_ID),
            logs: library.join("Logs").join(APP_NAME),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn for_platform(home: &Path, env: &impl Fn(&str) -> Option<String>) -> Self {
        let data = xdg_dir(env, "XDG_DATA_HOME", home.join(".local").join("share")).join(APP_NAME);
        Self {
            config: xdg_dir(env, "XDG_CONFIG_HOME", home.join(".config")).join(APP_NAME),
            cache: xdg_dir(env, "XDG_CACHE_HOME", home.join(".cache")).join(APP_NAME),
            logs: data.join("logs"),
            data,
        }
    }
}

fn xdg_dir(env: &impl Fn(&str) -> Option<String>, var: &str, fallback: PathBuf) -> PathBuf {
    env(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or(fallback)
}

/// Best effort: a failed `tmutil` call only costs backup space.
#[cfg(target_os = "macos")]
fn exclude_from_backups(dirs: &[&Path]) {
    for dir in dirs {
        let result = std::process::Command::new("tmutil")
            .arg("addexclusion")
            .arg(dir)
            .output();
        match result {
            Ok(output) if output.status.success() => {
                debug!(dir = %dir.display(), "excluded from Time Machine");
            }
            Ok(output) => warn!(
                dir = %dir.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "tmutil addexclusion failed"
            ),
            Err(e) => warn!(dir = %dir.display(), error = %e, "could not run tmutil"),
        }
    }
}
