//! Lump providers
//!
//! [`MemoryResources`] keeps lumps in memory (handy for tests and for the CLI
//! demo), [`LumpDirectory`] reads `<NAME>.lmp` files from a directory.

use soundscape_core::domain::resource::{
    ResourceError, ResourceHandle, ResourceProvider, Result, DMXGUS, DMXGUSC, GENMIDI,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Size of a generated instrument bank: header plus 175 OPL instruments
const GENMIDI_SIZE: usize = 8 + 175 * 36 + 175 * 32;

/// In-memory lump table
#[derive(Debug, Default)]
pub struct MemoryResources {
    lumps: Vec<(String, Vec<u8>)>,
    loaded: BTreeSet<ResourceHandle>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding placeholder instrument bank and patch maps
    pub fn with_default_patches() -> Self {
        let mut bank = vec![0u8; GENMIDI_SIZE];
        bank[..8].copy_from_slice(b"#OPL_II#");
        Self::new()
            .with_lump(GENMIDI, bank)
            .with_lump(DMXGUS, b"0, 2, 1, 0, 0, acpiano\n".to_vec())
            .with_lump(DMXGUSC, b"0, 2, 1, 0, 0, acpiano\n".to_vec())
    }

    pub fn with_lump(mut self, name: &str, data: Vec<u8>) -> Self {
        self.insert(name, data);
        self
    }

    /// Add or replace a lump
    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        let name = name.to_ascii_uppercase();
        match self.lumps.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = data,
            None => self.lumps.push((name, data)),
        }
    }

    /// Handles loaded and not yet released
    pub fn outstanding(&self) -> usize {
        self.loaded.len()
    }
}

impl ResourceProvider for MemoryResources {
    fn lookup(&self, name: &str) -> Result<ResourceHandle> {
        self.lumps
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(ResourceHandle)
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }

    fn load(&mut self, handle: ResourceHandle) -> Result<Vec<u8>> {
        let (name, data) = self
            .lumps
            .get(handle.0)
            .ok_or_else(|| ResourceError::NotFound(format!("lump #{}", handle.0)))?;
        debug!(lump = %name, bytes = data.len(), "Lump loaded");
        self.loaded.insert(handle);
        Ok(data.clone())
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.loaded.remove(&handle);
    }
}

/// Lumps stored as individual files in a directory
#[derive(Debug)]
pub struct LumpDirectory {
    root: PathBuf,
    /// Paths handed out so far; a handle indexes into this
    known: Vec<PathBuf>,
    loaded: BTreeSet<ResourceHandle>,
}

impl LumpDirectory {
    /// Open `root`, listing the `.lmp` files it holds
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let entries = fs::read_dir(&root).map_err(|e| ResourceError::Io(format!("{}: {}", root.display(), e)))?;

        let mut known: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let is_lump = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("lmp"))
                .unwrap_or(false);
            if is_lump {
                known.push(path);
            }
        }
        known.sort();

        info!(path = %root.display(), lumps = known.len(), "Lump directory opened");
        Ok(Self {
            root,
            known,
            loaded: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.loaded.len()
    }
}

fn lump_name(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

impl ResourceProvider for LumpDirectory {
    fn lookup(&self, name: &str) -> Result<ResourceHandle> {
        self.known
            .iter()
            .position(|p| lump_name(p).map_or(false, |n| n.eq_ignore_ascii_case(name)))
            .map(ResourceHandle)
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }

    fn load(&mut self, handle: ResourceHandle) -> Result<Vec<u8>> {
        let path = self
            .known
            .get(handle.0)
            .ok_or_else(|| ResourceError::NotFound(format!("lump #{}", handle.0)))?;
        let data = fs::read(path).map_err(|e| ResourceError::Io(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), bytes = data.len(), "Lump loaded");
        self.loaded.insert(handle);
        Ok(data)
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.loaded.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_lookup_is_case_insensitive() {
        let resources = MemoryResources::new().with_lump("genmidi", vec![1, 2, 3]);
        assert_eq!(resources.lookup("GENMIDI"), Ok(ResourceHandle(0)));
        assert_eq!(
            resources.lookup("DMXGUS"),
            Err(ResourceError::NotFound("DMXGUS".to_string()))
        );
    }

    #[test]
    fn test_memory_load_and_release() {
        let mut resources = MemoryResources::with_default_patches();
        let handle = resources.lookup(GENMIDI).unwrap();

        let bank = resources.load(handle).unwrap();
        assert_eq!(bank.len(), GENMIDI_SIZE);
        assert_eq!(&bank[..8], b"#OPL_II#");
        assert_eq!(resources.outstanding(), 1);

        resources.release(handle);
        assert_eq!(resources.outstanding(), 0);
    }

    #[test]
    fn test_insert_replaces() {
        let mut resources = MemoryResources::new();
        resources.insert("DMXGUS", vec![1]);
        resources.insert("dmxgus", vec![2, 2]);
        let handle = resources.lookup(DMXGUS).unwrap();
        assert_eq!(resources.load(handle).unwrap(), vec![2, 2]);
    }

    #[test]
    fn test_lump_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("GENMIDI.lmp"), b"#OPL_II#bank").unwrap();
        fs::write(dir.path().join("readme.txt"), b"not a lump").unwrap();

        let mut lumps = LumpDirectory::open(dir.path()).unwrap();
        assert_eq!(lumps.len(), 1);

        let handle = lumps.lookup("genmidi").unwrap();
        assert_eq!(lumps.load(handle).unwrap(), b"#OPL_II#bank".to_vec());
        assert_eq!(lumps.outstanding(), 1);
        lumps.release(handle);
        assert_eq!(lumps.outstanding(), 0);

        assert!(matches!(lumps.lookup("readme"), Err(ResourceError::NotFound(_))));
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(LumpDirectory::open(&missing), Err(ResourceError::Io(_))));
    }
}
