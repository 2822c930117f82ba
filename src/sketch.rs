//src/sketch.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use crate::error::{LcaError, Result};
use crate::files::{create_writer, open_reader};

/// What the LCA code needs from a genome sketch.
pub trait Sketch: Sized {
    fn name(&self) -> &str;
    fn ksize(&self) -> u32;
    /// Current downsampling factor.
    fn scaled(&self) -> u64;
    fn hash_values(&self) -> &BTreeSet<u64>;
    /// Coarser copy of this sketch at `scaled`. Must be idempotent and must
    /// only ever drop hashes.
    fn downsample(&self, scaled: u64) -> Result<Self>;
}

/// A scaled hash sketch: keeps the hashes `h` with `h % scaled == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSketch {
    name: String,
    ksize: u32,
    scaled: u64,
    hashes: BTreeSet<u64>,
}

impl HashSketch {
    /// Builds a sketch, discarding hashes that `scaled` would not retain.
    pub fn new<I>(name: impl Into<String>, ksize: u32, scaled: u64, hashes: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let scaled = scaled.max(1);
        Self {
            name: name.into(),
            ksize,
            scaled,
            hashes: hashes.into_iter().filter(|h| h % scaled == 0).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl Sketch for HashSketch {
    fn name(&self) -> &str {
        &self.name
    }

    fn ksize(&self) -> u32 {
        self.ksize
    }

    fn scaled(&self) -> u64 {
        self.scaled
    }

    fn hash_values(&self) -> &BTreeSet<u64> {
        &self.hashes
    }

    fn downsample(&self, scaled: u64) -> Result<Self> {
        if scaled < self.scaled {
            return Err(LcaError::ScaledMismatch {
                name: self.name.clone(),
                current: self.scaled,
                requested: scaled,
            });
        }
        Ok(Self::new(self.name.clone(), self.ksize, scaled, self.hashes.iter().copied()))
    }
}

/// One `{ksize, scaled, mins}` record of a signature file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchRecord {
    pub ksize: u32,
    pub scaled: u64,
    pub mins: Vec<u64>,
}

/// On-disk signature document: one name, sketches at several k-sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub signatures: Vec<SketchRecord>,
}

impl SignatureFile {
    pub fn sketch_for_ksize(&self, ksize: u32) -> Option<HashSketch> {
        self.signatures
            .iter()
            .find(|r| r.ksize == ksize)
            .map(|r| HashSketch::new(self.name.clone(), r.ksize, r.scaled, r.mins.iter().copied()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(SignatureFile),
    Many(Vec<SignatureFile>),
}

/// Loads every signature in `path` (a single document or a JSON list).
pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<Vec<SignatureFile>> {
    let reader = open_reader(path)?;
    let parsed: OneOrMany = serde_json::from_reader(reader)?;
    Ok(match parsed {
        OneOrMany::One(sig) => vec![sig],
        OneOrMany::Many(sigs) => sigs,
    })
}

/// Loads the `ksize` sketch of every signature in `path`; signatures without
/// one are skipped with a warning. A file with no `ksize` sketch at all is
/// `KsizeNotFound`.
pub fn load_sketches<P: AsRef<Path>>(path: P, ksize: u32) -> Result<Vec<HashSketch>> {
    let path = path.as_ref();
    let sigs = load_signatures(path)?;
    let mut sketches = Vec::with_capacity(sigs.len());
    for sig in &sigs {
        match sig.sketch_for_ksize(ksize) {
            Some(sketch) => sketches.push(sketch),
            None => log::warn!("{}: no ksize={} sketch for {}", path.display(), ksize, sig.name),
        }
    }
    if sketches.is_empty() && !sigs.is_empty() {
        return Err(LcaError::KsizeNotFound {
            name: path.display().to_string(),
            ksize,
        });
    }
    Ok(sketches)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, sigs: &[SignatureFile]) -> Result<()> {
    let mut writer = create_writer(path)?;
    serde_json::to_writer(&mut writer, sigs)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_keeps_only_scaled_hashes() {
        let s = HashSketch::new("q", 31, 10, [10, 15, 20, 33, 40]);
        assert_eq!(s.hash_values().iter().copied().collect::<Vec<_>>(), vec![10, 20, 40]);
    }

    #[test]
    fn test_downsample_is_subset_and_idempotent() {
        let s = HashSketch::new("q", 31, 10, (0..200).map(|i| i * 10));
        let d1 = s.downsample(30).unwrap();
        let d2 = d1.downsample(30).unwrap();
        assert_eq!(d1, d2);
        assert!(d1.hash_values().is_subset(s.hash_values()));
        assert!(d1.hash_values().iter().all(|h| h % 30 == 0));
        assert_eq!(d1.scaled(), 30);
    }

    #[test]
    fn test_downsample_to_finer_scaled_fails() {
        let s = HashSketch::new("q", 31, 100, [100, 200]);
        assert!(matches!(s.downsample(10), Err(LcaError::ScaledMismatch { .. })));
    }

    #[test]
    fn test_load_signatures_single_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.sig");
        std::fs::write(
            &one,
            r#"{"name": "GCA_000005845.2 Escherichia coli", "signatures": [
                 {"ksize": 21, "scaled": 10, "mins": [10, 20]},
                 {"ksize": 31, "scaled": 10, "mins": [30, 40, 45]}]}"#,
        )
        .unwrap();

        let sketches = load_sketches(&one, 31).unwrap();
        assert_eq!(sketches.len(), 1);
        assert_eq!(sketches[0].name(), "GCA_000005845.2 Escherichia coli");
        assert_eq!(sketches[0].len(), 2);
        assert!(matches!(load_sketches(&one, 51), Err(LcaError::KsizeNotFound { ksize: 51, .. })));

        let many = dir.path().join("many.sig.gz");
        let sigs = load_signatures(&one).unwrap();
        save_signatures(&many, &[sigs[0].clone(), sigs[0].clone()]).unwrap();
        assert_eq!(load_sketches(&many, 21).unwrap().len(), 2);
    }
}
