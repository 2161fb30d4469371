//! Persistent artifact store
//!
//! Directory layout under the configured prefix:
//!
//! - `m_<hast>.meta`: [`ArtifactMetadata`] for one source unit
//! - `<hast>_<offset>_<context>.bc` / `.pool`: native code and constant pool
//!
//! Blobs are written under a temporary name and renamed into place only
//! after the metadata write succeeded. The directory is owned by a single
//! process; there is no locking. Storing a tree whose digest differs from
//! the one on disk replaces the whole entry.

use super::metadata::{ArtifactMetadata, BinaryUnit, ContextUnit, OffsetUnit};
use super::registry::HastRegistry;
use super::Hast;
use crate::context::ContextFingerprint;
use crate::dispatch::NativeCode;
use crate::error::SerializerError;
use crate::Result;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_PREFIX: &str = "m_";
const META_EXT: &str = "meta";
const CODE_EXT: &str = "bc";
const POOL_EXT: &str = "pool";
const TEMP_SUFFIX: &str = "tmp";

/// How far a blacklisted hast taints the entries depending on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupMode {
    /// Only entries listing a blacklisted hast among their own requests
    #[default]
    Direct,
    /// Everything reachable from the blacklist through the dependency graph
    Transitive,
}

/// One variant to persist
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    pub hast: Hast,
    /// Full structural digest of the source unit
    pub digest: u64,
    pub name: &'a str,
    pub offset: u32,
    pub context: ContextFingerprint,
    pub mask: u64,
    pub code: &'a NativeCode,
    pub requests: BTreeSet<Hast>,
    pub tf_slots: Vec<u32>,
    pub tv_data: Vec<u32>,
    pub fb_slots: Vec<u32>,
    pub fb_data: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<Hast>,
    pub kept: usize,
    /// Files deleted, metadata and blobs together
    pub files: usize,
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} entries ({} files), kept {}",
            self.removed.len(),
            self.files,
            self.kept
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelinkReport {
    pub entries: usize,
    pub contexts: usize,
    /// Unreadable metadata files removed during the scan
    pub corrupt: usize,
}

impl fmt::Display for RelinkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} contexts, {} corrupt",
            self.entries, self.contexts, self.corrupt
        )
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    prefix: PathBuf,
}

impl ArtifactStore {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn meta_path(&self, hast: Hast) -> PathBuf {
        self.prefix.join(format!("{}{}.{}", META_PREFIX, hast, META_EXT))
    }

    pub fn blob_stem(hast: Hast, offset: u32, context: ContextFingerprint) -> String {
        format!("{}_{}_{}", hast, offset, context.bits())
    }

    fn blob_path(&self, stem: &str, ext: &str) -> PathBuf {
        self.prefix.join(format!("{}.{}", stem, ext))
    }

    fn temp_path(&self, stem: &str, ext: &str) -> PathBuf {
        self.prefix.join(format!("{}.{}.{}", stem, ext, TEMP_SUFFIX))
    }

    /// Metadata stored for `hast`. A file that cannot be decoded is removed
    /// and reported as absent.
    pub fn lookup(&self, hast: Hast) -> Option<ArtifactMetadata> {
        let path = self.meta_path(hast);
        if !path.exists() {
            return None;
        }
        match ArtifactMetadata::load(&path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(hast = %hast, error = %e, "corrupted metadata removed");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Persist one variant. Returns the version assigned to the stored unit.
    pub fn store(&self, request: StoreRequest<'_>) -> std::result::Result<u32, SerializerError> {
        let write_err = |path: &Path, e: &dyn fmt::Display| SerializerError::Write {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        fs::create_dir_all(&self.prefix).map_err(|e| write_err(&self.prefix, &e))?;

        let mut meta = match self.lookup(request.hast) {
            Some(meta) if meta.digest == request.digest => meta,
            Some(meta) => {
                warn!(
                    hast = %request.hast,
                    previous = %meta.name,
                    "stored artifact compiled from a different tree, replacing"
                );
                self.remove(request.hast)
                    .map_err(|e| write_err(&self.meta_path(request.hast), &e))?;
                ArtifactMetadata::new(request.hast, request.digest, request.name)
            }
            None => ArtifactMetadata::new(request.hast, request.digest, request.name),
        };

        let stem = Self::blob_stem(request.hast, request.offset, request.context);
        let code_tmp = self.temp_path(&stem, CODE_EXT);
        let pool_tmp = self.temp_path(&stem, POOL_EXT);
        fs::write(&code_tmp, &request.code.code).map_err(|e| write_err(&code_tmp, &e))?;
        fs::write(&pool_tmp, &request.code.pool).map_err(|e| write_err(&pool_tmp, &e))?;

        let context = request.context.bits();
        let version = meta.next_version(request.offset, context);
        let unit = ContextUnit {
            version,
            tf_slots: request.tf_slots,
            fb_slots: request.fb_slots,
            binary: BinaryUnit {
                epoch: stem.clone(),
                requests: request.requests,
                tv_data: request.tv_data,
                fb_data: request.fb_data,
            },
        };
        let mut incoming = ArtifactMetadata::new(request.hast, request.digest, request.name);
        incoming.offsets.insert(
            request.offset,
            OffsetUnit {
                mask: request.mask,
                contexts: [(context, unit)].into_iter().collect(),
            },
        );
        meta.merge(incoming);

        let meta_path = self.meta_path(request.hast);
        if let Err(e) = meta.save(&meta_path) {
            let _ = fs::remove_file(&code_tmp);
            let _ = fs::remove_file(&pool_tmp);
            return Err(write_err(&meta_path, &e));
        }

        for (tmp, ext) in [(&code_tmp, CODE_EXT), (&pool_tmp, POOL_EXT)] {
            let dest = self.blob_path(&stem, ext);
            fs::rename(tmp, &dest).map_err(|e| SerializerError::Rename {
                from: tmp.clone(),
                to: dest.clone(),
                message: e.to_string(),
            })?;
        }

        info!(
            hast = %request.hast,
            offset = request.offset,
            context = %request.context,
            version,
            "artifact stored"
        );
        Ok(version)
    }

    /// Read the blob pair named `stem`.
    pub fn read_blobs(&self, stem: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let code = fs::read(self.blob_path(stem, CODE_EXT))?;
        let pool = fs::read(self.blob_path(stem, POOL_EXT))?;
        Ok((code, pool))
    }

    fn meta_files(&self) -> Result<Vec<(Hast, PathBuf)>> {
        let mut out = Vec::new();
        if !self.prefix.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.prefix)?.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != META_EXT) {
                continue;
            }
            let hast = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(META_PREFIX))
                .and_then(|s| s.parse::<Hast>().ok());
            if let Some(hast) = hast {
                out.push((hast, path));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Read every metadata entry without touching the directory. Returns
    /// the readable entries and the hasts whose files failed to decode,
    /// both sorted by hast.
    pub fn scan(&self) -> Result<(Vec<ArtifactMetadata>, Vec<Hast>)> {
        let mut entries = Vec::new();
        let mut unreadable = Vec::new();
        for (hast, path) in self.meta_files()? {
            match ArtifactMetadata::load(&path) {
                Ok(meta) => entries.push(meta),
                Err(e) => {
                    debug!(hast = %hast, error = %e, "unreadable metadata");
                    unreadable.push(hast);
                }
            }
        }
        Ok((entries, unreadable))
    }

    /// Every readable metadata entry, sorted by hast. Unreadable files are
    /// removed; the second value counts them.
    pub fn entries(&self) -> Result<(Vec<ArtifactMetadata>, usize)> {
        let (entries, unreadable) = self.scan()?;
        for hast in &unreadable {
            warn!(hast = %hast, "corrupted metadata removed");
            let _ = fs::remove_file(self.meta_path(*hast));
        }
        Ok((entries, unreadable.len()))
    }

    /// Delete the metadata of `hast` and every blob carrying its prefix.
    /// Returns the number of files removed.
    pub fn remove(&self, hast: Hast) -> Result<usize> {
        let mut files = 0;
        if !self.prefix.exists() {
            return Ok(files);
        }
        let meta = self.meta_path(hast);
        if meta.exists() {
            fs::remove_file(&meta)?;
            files += 1;
        }
        let blob_prefix = format!("{}_", hast);
        for entry in fs::read_dir(&self.prefix)?.flatten() {
            let path = entry.path();
            let is_blob = path
                .extension()
                .map_or(false, |e| e == CODE_EXT || e == POOL_EXT);
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(&blob_prefix));
            if is_blob && owned {
                fs::remove_file(&path)?;
                files += 1;
            }
        }
        Ok(files)
    }

    /// Remove every entry tainted by `blacklist`.
    pub fn cleanup(&self, blacklist: &BTreeSet<Hast>, mode: CleanupMode) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let (entries, _) = self.entries()?;
        if blacklist.is_empty() {
            report.kept = entries.len();
            return Ok(report);
        }

        let deps: Vec<(Hast, BTreeSet<Hast>)> =
            entries.iter().map(|m| (m.hast, m.dependencies())).collect();

        let mut tainted = blacklist.clone();
        match mode {
            CleanupMode::Direct => {
                for (hast, d) in &deps {
                    if d.iter().any(|h| blacklist.contains(h)) {
                        tainted.insert(*hast);
                    }
                }
            }
            CleanupMode::Transitive => loop {
                let mut grew = false;
                for (hast, d) in &deps {
                    if !tainted.contains(hast) && d.iter().any(|h| tainted.contains(h)) {
                        tainted.insert(*hast);
                        grew = true;
                    }
                }
                if !grew {
                    break;
                }
            },
        }

        for (hast, _) in &deps {
            if tainted.contains(hast) {
                report.files += self.remove(*hast)?;
                report.removed.push(*hast);
                warn!(hast = %hast, "blacklisted artifact deleted");
            } else {
                report.kept += 1;
            }
        }
        debug!(mode = ?mode, "{}", report);
        Ok(report)
    }

    /// Scan the directory and feed what it holds into `registry`: the
    /// dependency map and the set of linkable (hast, offset, context) triples.
    pub fn relink(&self, registry: &mut HastRegistry) -> Result<RelinkReport> {
        let (entries, corrupt) = self.entries()?;
        let mut report = RelinkReport {
            corrupt,
            ..Default::default()
        };
        for meta in entries {
            registry.set_dependencies(meta.hast, meta.dependencies());
            for (offset, bits, _) in meta.units() {
                match ContextFingerprint::from_bits(bits) {
                    Some(context) => {
                        registry.record_available(meta.hast, offset, context);
                        report.contexts += 1;
                    }
                    None => warn!(hast = %meta.hast, bits, "skipping unknown context encoding"),
                }
            }
            report.entries += 1;
        }
        info!("relinked {}", report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn code() -> NativeCode {
        NativeCode {
            symbol: "f_0".to_string(),
            code: vec![0xc3],
            pool: vec![1, 2, 3],
        }
    }

    fn request<'a>(code: &'a NativeCode, hast: u64, requests: &[u64]) -> StoreRequest<'a> {
        StoreRequest {
            hast: Hast(hast),
            digest: 42,
            name: "f",
            offset: 0,
            context: ContextFingerprint::new().set_eager(0),
            mask: 0,
            code,
            requests: requests.iter().map(|h| Hast(*h)).collect(),
            tf_slots: Vec::new(),
            tv_data: Vec::new(),
            fb_slots: Vec::new(),
            fb_data: Vec::new(),
        }
    }

    #[test]
    fn test_store_writes_layout() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = code();
        assert_eq!(store.store(request(&code, 7, &[])).unwrap(), 0);

        let stem = ArtifactStore::blob_stem(Hast(7), 0, ContextFingerprint::new().set_eager(0));
        assert!(store.meta_path(Hast(7)).exists());
        assert!(dir.path().join(format!("{}.bc", stem)).exists());
        assert!(dir.path().join(format!("{}.pool", stem)).exists());
        assert!(!dir.path().join(format!("{}.bc.tmp", stem)).exists());
        assert_eq!(store.read_blobs(&stem).unwrap(), (vec![0xc3], vec![1, 2, 3]));
    }

    #[test]
    fn test_corrupt_meta_is_removed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        fs::write(store.meta_path(Hast(1)), b"garbage").unwrap();
        assert!(store.lookup(Hast(1)).is_none());
        assert!(!store.meta_path(Hast(1)).exists());
    }

    #[test]
    fn test_remove_only_own_blobs() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = code();
        store.store(request(&code, 0x10, &[])).unwrap();
        store.store(request(&code, 0x11, &[])).unwrap();
        assert_eq!(store.remove(Hast(0x10)).unwrap(), 3);
        assert!(store.lookup(Hast(0x11)).is_some());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_empty_blacklist_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = code();
        store.store(request(&code, 1, &[2])).unwrap();
        let report = store.cleanup(&BTreeSet::new(), CleanupMode::Transitive).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 1);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("absent"));
        let mut reg = HastRegistry::new();
        assert_eq!(store.relink(&mut reg).unwrap(), RelinkReport::default());
    }

    #[test]
    fn test_store_bumps_version_and_accumulates_mask() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = code();
        let mut first = request(&code, 7, &[]);
        first.mask = 0b01;
        let mut second = request(&code, 7, &[3]);
        second.mask = 0b10;
        assert_eq!(store.store(first).unwrap(), 0);
        assert_eq!(store.store(second).unwrap(), 1);
        let meta = store.lookup(Hast(7)).unwrap();
        assert_eq!(meta.offsets[&0].mask, 0b11);
        assert_eq!(meta.dependencies(), [Hast(3)].into_iter().collect());
    }

    #[test]
    fn test_store_replaces_entry_of_other_tree() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = code();
        let mut other = request(&code, 7, &[]);
        other.offset = 4;
        other.digest = 41;
        store.store(other).unwrap();
        assert_eq!(store.store(request(&code, 7, &[])).unwrap(), 0);
        let meta = store.lookup(Hast(7)).unwrap();
        assert_eq!(meta.digest, 42);
        assert_eq!(meta.context_count(), 1);
        assert!(meta.get(4, ContextFingerprint::new().set_eager(0).bits()).is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_scan_leaves_unreadable_files() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = code();
        store.store(request(&code, 2, &[])).unwrap();
        fs::write(store.meta_path(Hast(1)), b"garbage").unwrap();

        let (entries, unreadable) = store.scan().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(unreadable, vec![Hast(1)]);
        assert!(store.meta_path(Hast(1)).exists());

        let (_, corrupt) = store.entries().unwrap();
        assert_eq!(corrupt, 1);
        assert!(!store.meta_path(Hast(1)).exists());
    }
}
