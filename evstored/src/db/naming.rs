use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// Maps chunk numbers and versions to file names
///
/// A chunk file is named after the first chunk number it covers and
/// a version, bumped every time the chunk gets rewritten (scavenged).
#[derive(Clone, Debug)]
pub struct FileNamingStrategy {
    dir: PathBuf,
}

impl FileNamingStrategy {
    pub const PREFIX: &'static str = "chunk-";
    pub const TEMP_SUFFIX: &'static str = ".tmp";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for(number: u32, version: u32) -> String {
        format!("{}{number:06}.{version:06}", Self::PREFIX)
    }

    pub fn path_for(&self, number: u32, version: u32) -> PathBuf {
        self.dir.join(Self::file_name_for(number, version))
    }

    /// Parse `(number, version)` out of a chunk file name
    pub fn parse_file_name(name: &str) -> Option<(u32, u32)> {
        let rest = name.strip_prefix(Self::PREFIX)?;
        let (number, version) = rest.split_once('.')?;
        if number.len() != 6 || version.len() != 6 {
            return None;
        }
        Some((number.parse().ok()?, version.parse().ok()?))
    }

    /// All chunk files: `(number, version, path)`, sorted
    pub fn all_chunk_files(&self) -> io::Result<Vec<(u32, u32, PathBuf)>> {
        let mut files = vec![];
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((number, version)) = Self::parse_file_name(name) {
                files.push((number, version, path));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Paths of all versions of chunk `number`, newest first
    pub fn versions_for(&self, number: u32) -> io::Result<Vec<(u32, PathBuf)>> {
        let mut versions: Vec<_> = self
            .all_chunk_files()?
            .into_iter()
            .filter(|(n, _, _)| *n == number)
            .map(|(_, version, path)| (version, path))
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions)
    }

    pub fn next_version_for(&self, number: u32) -> io::Result<u32> {
        Ok(self
            .versions_for(number)?
            .first()
            .map(|(version, _)| version + 1)
            .unwrap_or_default())
    }

    pub fn new_temp_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}", Uuid::new_v4(), Self::TEMP_SUFFIX))
    }

    pub fn remove_temp_files(&self) -> io::Result<()> {
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .to_str()
                .map(|s| s.ends_with(Self::TEMP_SUFFIX))
                .unwrap_or(false)
            {
                debug!(path = %path.display(), "Removing temporary file");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Could not remove temporary file");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_file_names() {
        assert_eq!(FileNamingStrategy::file_name_for(3, 1), "chunk-000003.000001");
        assert_eq!(
            FileNamingStrategy::parse_file_name("chunk-000003.000001"),
            Some((3, 1))
        );
        assert_eq!(FileNamingStrategy::parse_file_name("chunk-3.1"), None);
        assert_eq!(FileNamingStrategy::parse_file_name("writer.chk"), None);
    }

    #[test]
    fn versions_newest_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let naming = FileNamingStrategy::new(dir.path());
        for (n, v) in [(0, 0), (1, 0), (1, 2), (1, 1)] {
            std::fs::write(naming.path_for(n, v), [])?;
        }
        std::fs::write(naming.new_temp_path(), [])?;

        let versions: Vec<_> = naming.versions_for(1)?.into_iter().map(|v| v.0).collect();
        assert_eq!(versions, [2, 1, 0]);
        assert_eq!(naming.next_version_for(1)?, 3);
        assert_eq!(naming.next_version_for(7)?, 0);

        naming.remove_temp_files()?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 4);
        Ok(())
    }
}
