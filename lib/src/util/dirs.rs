//! Default storage paths.
//!
//! Lookup order:
//!
//! - XDG base directory (all platforms if the environment variable is set)
//! - Platform-specific well known directory (see [`dirs`])
//! - Dot directory under home
//! - Dot directory under the current directory

use std::env;
use std::io;
use std::path::PathBuf;

const XDG_CONFIG_HOME: &str = "XDG_CONFIG_HOME";
const XDG_DATA_HOME: &str = "XDG_DATA_HOME";

/// Config directory for `name`, created if missing.
///
/// # Errors
///
/// If no candidate exists or it cannot be created.
pub fn config_dir(name: &str) -> io::Result<PathBuf> {
    ensure(lookup(name, XDG_CONFIG_HOME, dirs::config_dir())?)
}

/// Data directory for `name`, created if missing.
///
/// # Errors
///
/// If no candidate exists or it cannot be created.
pub fn data_dir(name: &str) -> io::Result<PathBuf> {
    ensure(lookup(name, XDG_DATA_HOME, dirs::data_dir())?)
}

fn lookup(name: &str, xdg_var: &str, platform: Option<PathBuf>) -> io::Result<PathBuf> {
    if let Ok(path) = env::var(xdg_var) {
        return Ok(PathBuf::from(path).join(name));
    }
    if let Some(path) = platform {
        return Ok(path.join(name));
    }
    if let Some(path) = dirs::home_dir() {
        return Ok(path.join(format!(".{name}")));
    }
    Ok(env::current_dir()?.join(format!(".{name}")))
}

fn ensure(dir: PathBuf) -> io::Result<PathBuf> {
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
