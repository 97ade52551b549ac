// src/profiles.rs - firing profiles by name
use kiln_shared::{ProfileError, ProfileSource, Schedule};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct ProfileFile {
    name: String,
    /// `[seconds, temperature]` pairs.
    data: Vec<(f64, f64)>,
}

/// Directory of `<name>.json` profile files.
#[derive(Debug, Clone)]
pub struct ProfileDirectory {
    root: PathBuf,
}

impl ProfileDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of every profile file in the directory, sorted.
    pub fn names(&self) -> Result<Vec<String>, ProfileError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl ProfileSource for ProfileDirectory {
    fn lookup(&self, name: &str) -> Result<Schedule, ProfileError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        let path = self.root.join(format!("{}.json", name));
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let file: ProfileFile = serde_json::from_str(&text)
            .map_err(|e| ProfileError::Parse(format!("{}: {}", path.display(), e)))?;
        let schedule = Schedule::from_pairs(file.name, &file.data)?;
        tracing::debug!(
            "Loaded profile '{}' ({} points, {:.0}s)",
            schedule.name(),
            schedule.points().len(),
            schedule.duration()
        );
        Ok(schedule)
    }
}
