//! Where the server keeps its files

use std::path::{Path, PathBuf};

use arena_core::{Database, Error, Result};
use directories::ProjectDirs;

const CONFIG_FILE: &str = "arena.toml";
const DATABASE_FILE: &str = "arena.db";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "onyx", "arena").ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine data directory",
        ))
    })
}

/// `arena.toml` in the platform config directory
pub fn default_config_file() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
}

pub fn default_data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Open (creating if needed) the session database under `data_dir`
pub fn open_database(data_dir: &Path) -> Result<Database> {
    std::fs::create_dir_all(data_dir)?;
    Database::open(data_dir.join(DATABASE_FILE))
}
