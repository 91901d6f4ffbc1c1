//! Fingerprint over the files that influence upgrade computation.
//!
//! The digest mirrors the shell pipeline
//! `sha256sum /dev/null <inputs> | cut -d' ' -f1 | sort -u | sha256sum`:
//! every readable input is hashed, duplicate hashes collapse, the sorted hex
//! digests are joined one per line and hashed once more. Inputs that vanish or
//! cannot be read are skipped.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const SENTINEL: &str = "/dev/null";
const CHUNK_SIZE: usize = 8192;

pub trait ChecksumSource: Send + Sync {
    fn compute(&self) -> String;
}

/// Every non-hidden entry of `dir` whose name ends with `suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirPattern {
    pub dir: PathBuf,
    pub suffix: Option<String>,
}

impl DirPattern {
    pub fn new(dir: impl Into<PathBuf>, suffix: Option<&str>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.map(str::to_string),
        }
    }

    fn expand(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut matched: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    return false;
                };
                !name.starts_with('.')
                    && self
                        .suffix
                        .as_deref()
                        .map_or(true, |suffix| name.ends_with(suffix))
            })
            .map(|entry| entry.path())
            .collect();
        matched.sort();
        matched
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumInputs {
    pub files: Vec<PathBuf>,
    pub patterns: Vec<DirPattern>,
}

impl Default for ChecksumInputs {
    fn default() -> Self {
        Self {
            files: vec![
                PathBuf::from("/etc/apt/preferences"),
                PathBuf::from("/var/lib/dpkg/status"),
                PathBuf::from("/var/lib/synaptic/preferences"),
            ],
            patterns: vec![
                DirPattern::new("/var/lib/apt/lists", Some("Release")),
                DirPattern::new("/etc/apt/preferences.d", None),
            ],
        }
    }
}

pub struct ReleaseChecksum {
    inputs: ChecksumInputs,
}

impl ReleaseChecksum {
    pub fn new(inputs: ChecksumInputs) -> Self {
        Self { inputs }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(SENTINEL)];
        candidates.extend(self.inputs.files.iter().cloned());
        for pattern in &self.inputs.patterns {
            candidates.extend(pattern.expand());
        }
        candidates
    }
}

impl ChecksumSource for ReleaseChecksum {
    fn compute(&self) -> String {
        tracing::debug!("Generating apt releases checksum");
        let digests: BTreeSet<String> = self
            .candidates()
            .iter()
            .filter_map(|path| file_digest(path).ok())
            .collect();
        combine_digests(&digests)
    }
}

fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn combine_digests(digests: &BTreeSet<String>) -> String {
    let mut joined = String::new();
    for digest in digests {
        joined.push_str(digest);
        joined.push('\n');
    }
    hex::encode(Sha256::digest(joined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn checksum_for(dir: &Path) -> ReleaseChecksum {
        ReleaseChecksum::new(ChecksumInputs {
            files: vec![dir.join("status"), dir.join("preferences")],
            patterns: vec![DirPattern::new(dir.join("lists"), Some("Release"))],
        })
    }

    fn seed(dir: &Path) {
        fs::create_dir_all(dir.join("lists")).expect("lists dir");
        fs::write(dir.join("status"), "Package: bash\nStatus: install ok installed\n")
            .expect("status");
        fs::write(dir.join("lists").join("deb_dists_bookworm_InRelease"), "Suite: stable\n")
            .expect("release");
    }

    #[test]
    fn sentinel_alone_hashes_empty_digest_line() {
        let temp_dir = TempDir::new().expect("temp dir");
        let checksum = ReleaseChecksum::new(ChecksumInputs {
            files: vec![temp_dir.path().join("missing")],
            patterns: Vec::new(),
        });

        let expected = hex::encode(Sha256::digest(format!("{}\n", EMPTY_SHA256).as_bytes()));
        assert_eq!(checksum.compute(), expected);
    }

    #[test]
    fn unchanged_inputs_give_identical_digest() {
        let temp_dir = TempDir::new().expect("temp dir");
        seed(temp_dir.path());
        let checksum = checksum_for(temp_dir.path());

        assert_eq!(checksum.compute(), checksum.compute());
    }

    #[test]
    fn content_change_changes_digest() {
        let temp_dir = TempDir::new().expect("temp dir");
        seed(temp_dir.path());
        let checksum = checksum_for(temp_dir.path());
        let before = checksum.compute();

        fs::write(
            temp_dir.path().join("lists").join("deb_dists_bookworm_InRelease"),
            "Suite: stable\nDate: today\n",
        )
        .expect("rewrite release");

        assert_ne!(before, checksum.compute());
    }

    #[test]
    fn absent_input_is_skipped() {
        let temp_dir = TempDir::new().expect("temp dir");
        seed(temp_dir.path());
        let checksum = checksum_for(temp_dir.path());
        let before = checksum.compute();

        // "preferences" was never created; a pattern non-match is ignored too.
        fs::write(temp_dir.path().join("lists").join("Packages"), "ignored").expect("packages");

        assert_eq!(before, checksum.compute());
    }

    #[test]
    fn unreadable_input_is_skipped() {
        let temp_dir = TempDir::new().expect("temp dir");
        seed(temp_dir.path());
        let checksum = checksum_for(temp_dir.path());
        let before = checksum.compute();

        // Opening a directory succeeds but reading it fails, even as root.
        fs::create_dir(temp_dir.path().join("preferences")).expect("preferences dir");
        fs::create_dir(temp_dir.path().join("lists").join("stale_Release"))
            .expect("release dir");

        assert_eq!(before, checksum.compute());
    }

    #[test]
    fn duplicate_contents_collapse() {
        let temp_dir = TempDir::new().expect("temp dir");
        seed(temp_dir.path());
        let checksum = checksum_for(temp_dir.path());
        let before = checksum.compute();

        fs::copy(
            temp_dir.path().join("status"),
            temp_dir.path().join("preferences"),
        )
        .expect("copy status");

        assert_eq!(before, checksum.compute());
    }

    #[test]
    fn hidden_entries_do_not_match_patterns() {
        let temp_dir = TempDir::new().expect("temp dir");
        let pattern = DirPattern::new(temp_dir.path(), Some("Release"));
        fs::write(temp_dir.path().join(".partial_Release"), "x").expect("hidden");
        fs::write(temp_dir.path().join("a_Release"), "y").expect("visible");

        assert_eq!(pattern.expand(), vec![temp_dir.path().join("a_Release")]);
    }
}
