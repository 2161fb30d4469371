//! On-disk artifact metadata
//!
//! One metadata file per hast. Its nesting mirrors the store layout:
//! offsets inside the source unit, then calling contexts, then the blob
//! unit describing the native code persisted for that pair.
//!
//! Files are written under a `.tmp` name and renamed over the live one, so
//! a failed write leaves the previous metadata readable.

use super::Hast;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Metadata file magic bytes
const META_MAGIC: &[u8; 4] = b"TJM\x01";

/// Metadata format version; files of any other version are rejected
const META_VERSION: u32 = 2;

/// Persisted native code for one (offset, context) pair
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BinaryUnit {
    /// Stem of the `.bc`/`.pool` blob pair
    pub epoch: String,
    /// Hasts this code assumes are defined compatibly
    pub requests: BTreeSet<Hast>,
    /// Encoded type feedback the code speculated on
    pub tv_data: Vec<u32>,
    /// Encoded branch and call-target feedback
    pub fb_data: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextUnit {
    /// Bumped every time this pair is stored again
    pub version: u32,
    pub tf_slots: Vec<u32>,
    pub fb_slots: Vec<u32>,
    pub binary: BinaryUnit,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OffsetUnit {
    /// Context bits the stored code must not assume
    pub mask: u64,
    pub contexts: BTreeMap<u64, ContextUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub hast: Hast,
    /// Full structural digest of the source unit the code was compiled from
    pub digest: u64,
    /// Human-readable name of the source unit
    pub name: String,
    pub offsets: BTreeMap<u32, OffsetUnit>,
}

impl ArtifactMetadata {
    pub fn new(hast: Hast, digest: u64, name: impl Into<String>) -> Self {
        Self {
            hast,
            digest,
            name: name.into(),
            offsets: BTreeMap::new(),
        }
    }

    pub fn get(&self, offset: u32, context: u64) -> Option<&ContextUnit> {
        self.offsets.get(&offset).and_then(|o| o.contexts.get(&context))
    }

    /// Version the next unit stored for `(offset, context)` must carry to
    /// supersede the current one
    pub fn next_version(&self, offset: u32, context: u64) -> u32 {
        self.get(offset, context)
            .map_or(0, |old| old.version.saturating_add(1))
    }

    /// Fold `other` into `self`. A unit replaces ours only if it is at
    /// least as new; masks accumulate.
    pub fn merge(&mut self, other: ArtifactMetadata) {
        for (offset, unit) in other.offsets {
            let slot = self.offsets.entry(offset).or_default();
            slot.mask |= unit.mask;
            for (context, incoming) in unit.contexts {
                let newer = slot
                    .contexts
                    .get(&context)
                    .map_or(true, |ours| incoming.version >= ours.version);
                if newer {
                    slot.contexts.insert(context, incoming);
                }
            }
        }
    }

    /// Union of the requests of every stored unit
    pub fn dependencies(&self) -> BTreeSet<Hast> {
        self.units().flat_map(|(_, _, u)| u.binary.requests.iter().copied()).collect()
    }

    pub fn units(&self) -> impl Iterator<Item = (u32, u64, &ContextUnit)> {
        self.offsets
            .iter()
            .flat_map(|(offset, o)| o.contexts.iter().map(move |(ctx, u)| (*offset, *ctx, u)))
    }

    pub fn context_count(&self) -> usize {
        self.offsets.values().map(|o| o.contexts.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(META_MAGIC);
        out.extend_from_slice(&META_VERSION.to_le_bytes());
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != META_MAGIC {
            return Err(Error::CodecError("invalid metadata file format".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != META_VERSION {
            return Err(Error::CodecError(format!(
                "metadata version {} does not match supported version {}",
                version, META_VERSION
            )));
        }
        Ok(bincode::deserialize(&bytes[8..])?)
    }

    /// Write to `<path>.tmp`, then rename over `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        let written = self.to_bytes().and_then(|bytes| {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&bytes)?;
            writer.flush()?;
            Ok(())
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut bytes = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn single(offset: u32, context: u64, version: u32, requests: &[u64]) -> ArtifactMetadata {
        let mut meta = ArtifactMetadata::new(Hast(1), 42, "f");
        let unit = ContextUnit {
            version,
            binary: BinaryUnit {
                epoch: "e".to_string(),
                requests: requests.iter().map(|h| Hast(*h)).collect(),
                ..Default::default()
            },
            ..Default::default()
        };
        let slot = meta.offsets.entry(offset).or_default();
        slot.mask = 1 << version;
        slot.contexts.insert(context, unit);
        meta
    }

    #[test]
    fn test_merge_supersedes() {
        let mut meta = ArtifactMetadata::new(Hast(1), 42, "f");
        assert_eq!(meta.next_version(0, 5), 0);
        meta.merge(single(0, 5, 0, &[2]));
        assert_eq!(meta.next_version(0, 5), 1);
        meta.merge(single(0, 5, 1, &[3]));
        assert_eq!(meta.context_count(), 1);
        assert_eq!(meta.dependencies(), [Hast(3)].into_iter().collect());
        assert_eq!(meta.offsets[&0].mask, 0b11);
    }

    #[test]
    fn test_merge_keeps_newer() {
        let mut disk = ArtifactMetadata::new(Hast(1), 42, "f");
        disk.merge(single(0, 5, 1, &[3]));

        let mut stale = single(0, 5, 0, &[9]);
        stale.merge(single(4, 5, 0, &[7]));

        disk.merge(stale);
        assert_eq!(disk.get(0, 5).unwrap().binary.requests, [Hast(3)].into_iter().collect());
        assert!(disk.get(4, 5).is_some());
        assert_eq!(disk.dependencies(), [Hast(3), Hast(7)].into_iter().collect());
    }

    #[test]
    fn test_bytes_reject_bad_magic() {
        let meta = ArtifactMetadata::new(Hast(1), 42, "f");
        let mut bytes = meta.to_bytes().unwrap();
        assert_eq!(ArtifactMetadata::from_bytes(&bytes).unwrap(), meta);
        bytes[0] = b'X';
        assert!(matches!(ArtifactMetadata::from_bytes(&bytes), Err(Error::CodecError(_))));
        assert!(ArtifactMetadata::from_bytes(b"TJ").is_err());
    }

    #[test]
    fn test_bytes_reject_other_version() {
        let mut bytes = ArtifactMetadata::new(Hast(1), 42, "f").to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(ArtifactMetadata::from_bytes(&bytes), Err(Error::CodecError(_))));
    }

    #[test]
    fn test_save_replaces_through_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m_1.meta");
        single(0, 5, 0, &[2]).save(&path).unwrap();
        single(0, 5, 1, &[3]).save(&path).unwrap();
        assert!(!dir.path().join("m_1.meta.tmp").exists());
        assert_eq!(ArtifactMetadata::load(&path).unwrap(), single(0, 5, 1, &[3]));
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m_1.meta");
        single(0, 5, 0, &[2]).save(&path).unwrap();
        std::fs::create_dir(dir.path().join("m_1.meta.tmp")).unwrap();
        assert!(single(0, 5, 1, &[3]).save(&path).is_err());
        assert_eq!(ArtifactMetadata::load(&path).unwrap(), single(0, 5, 0, &[2]));
    }
}
