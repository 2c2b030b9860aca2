//! One mapped producer file.
//!
//! A `Client` never outlives the scan that created it: every rescan maps
//! files afresh, so nothing holds offsets into a stale region.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use compact_str::CompactString;
use memmap2::Mmap;
use smallvec::SmallVec;

use crate::cursor::ByteCursor;
use crate::error::FetchError;
use crate::header::{GenerationPair, Header};
use crate::process::ProcessProbe;
use crate::toc::Section;

// ============================================================================
// SECTION 19: CLIENT FILES & MAPPED REGIONS
// ============================================================================

/// Backing bytes of a client.
pub enum Region {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl Region {
    /// Map `path` read-only.
    pub fn map(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and every access goes through a
        // bounds-checked cursor. Concurrent producer writes are tolerated by
        // the generation protocol; truncating the file underneath us is not
        // something a well-behaved producer does.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(map))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Region::Mapped(map) => &map[..],
            Region::Heap(bytes) => bytes.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Region::Mapped(_) => "mapped",
            Region::Heap(_) => "heap",
        };
        write!(f, "Region({kind}, {} bytes)", self.len())
    }
}

#[derive(Debug)]
pub struct Client {
    pub name: CompactString,
    pub path: PathBuf,
    pub header: Header,
    pub cluster: u32,
    region: Region,
    /// Accepted value sections, in table-of-contents order.
    values: SmallVec<[Section; 1]>,
}

impl Client {
    pub(crate) fn new(
        name: CompactString,
        path: PathBuf,
        region: Region,
        header: Header,
        cluster: u32,
        values: SmallVec<[Section; 1]>,
    ) -> Self {
        Self { name, path, header, cluster, region, values }
    }

    pub fn cursor(&self) -> ByteCursor<'_> {
        ByteCursor::new(self.region.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn value_sections(&self) -> &[Section] {
        &self.values
    }

    /// Generation pair as the producer has it right now.
    pub fn live_generation(&self) -> Option<GenerationPair> {
        GenerationPair::read(&self.cursor()).ok()
    }

    /// Whether the producer has rewritten the file since it was loaded.
    pub fn generation_changed(&self) -> bool {
        let expected = self.header.generation;
        !matches!(self.live_generation(), Some(g) if g.g1 == expected && g.g2 == expected)
    }

    pub fn owner_alive(&self, probe: &dyn ProcessProbe) -> bool {
        self.header.process.map_or(true, |pid| probe.exists(pid))
    }

    /// Run `read` under the generation check.
    ///
    /// The result is only returned when the pair matched the loaded
    /// generation both before and after the read.
    pub fn read_stable<T>(&self, read: impl FnOnce(&ByteCursor<'_>) -> T) -> Result<T, FetchError> {
        let unstable = || FetchError::Unstable { client: self.name.to_string() };
        if self.generation_changed() {
            return Err(unstable());
        }
        let cursor = self.cursor();
        let out = read(&cursor);
        fence(Ordering::Acquire);
        if self.generation_changed() {
            return Err(unstable());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, MmvFile};
    use crate::header::{self, HeaderStatus};
    use crate::process::SystemProbe;

    fn client(bytes: Vec<u8>) -> Client {
        let header = match header::decode(&ByteCursor::new(&bytes), &SystemProbe) {
            Ok(HeaderStatus::Stable(h)) => h,
            other => panic!("unexpected {other:?}"),
        };
        Client::new("app".into(), PathBuf::from("app"), Region::Heap(bytes), header, 1, SmallVec::new())
    }

    #[test]
    fn test_read_stable() {
        let c = client(MmvFile::new(2).generations(5, 5).build());
        assert_eq!(c.read_stable(|cursor| cursor.len()), Ok(c.len() as u64));
        assert!(!c.generation_changed());
    }

    #[test]
    fn test_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        std::fs::write(&path, MmvFile::new(3).build()).unwrap();
        let region = Region::map(&path).unwrap();
        assert_eq!(&region.as_bytes()[..4], b"MMV\0");
    }

    #[test]
    fn test_generation_change_is_seen_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        std::fs::write(&path, MmvFile::new(2).generations(5, 5).build()).unwrap();

        let region = Region::map(&path).unwrap();
        let header = match header::decode(&ByteCursor::new(region.as_bytes()), &SystemProbe) {
            Ok(HeaderStatus::Stable(h)) => h,
            other => panic!("unexpected {other:?}"),
        };
        let c = Client::new("app".into(), path.clone(), region, header, 1, SmallVec::new());
        assert!(!c.generation_changed());

        // Rewrite in place; a shared mapping sees it without remapping.
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_at(&6u64.to_ne_bytes(), fixture::G1_AT as u64).unwrap();
        assert!(c.generation_changed());
        assert!(c.read_stable(|_| ()).is_err());
    }
}
