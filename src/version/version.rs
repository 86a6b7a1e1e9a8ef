use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::key::InternalKey;
use crate::version::meta::RemoteTableMeta;

/// Number of LSM levels.
pub const NUM_LEVELS: usize = 7;

/// A flushed memtable's output is pushed past level 0 only this far, even
/// when nothing overlaps it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Immutable snapshot of the live table set. Published versions are never
/// mutated; readers pin one with an `Arc` and the engine swings the current
/// pointer on every applied edit.
pub struct Version {
    ucmp: Arc<dyn Comparator>,
    max_file_size: u64,
    /// Per-level file lists. Level 0 is insertion-ordered (newest last)
    /// and may overlap; levels >= 1 are sorted by smallest key and
    /// pairwise disjoint.
    pub(crate) files: Vec<Vec<Arc<RemoteTableMeta>>>,
}

impl Version {
    pub fn new(ucmp: Arc<dyn Comparator>, max_file_size: u64) -> Self {
        Self {
            ucmp,
            max_file_size,
            files: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.ucmp
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.files.get(level).map_or(0, Vec::len)
    }

    pub fn level_files(&self, level: usize) -> &[Arc<RemoteTableMeta>] {
        &self.files[level]
    }

    pub fn level_size(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    pub fn total_file_count(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// Files that may hold `user_key`, in the order a read must probe
    /// them: level-0 newest-first, then one candidate per deeper level.
    pub fn candidates(&self, user_key: &[u8]) -> Vec<Arc<RemoteTableMeta>> {
        let mut result = Vec::new();

        // level 0 files may overlap; newest file number wins first look
        let mut l0: Vec<_> = self.files[0]
            .iter()
            .filter(|f| {
                self.ucmp.compare(user_key, &f.smallest.user_key) != CmpOrdering::Less
                    && self.ucmp.compare(user_key, &f.largest.user_key) != CmpOrdering::Greater
            })
            .cloned()
            .collect();
        l0.sort_by(|a, b| b.number.cmp(&a.number));
        result.extend(l0);

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let idx = find_file(files, user_key, &*self.ucmp);
            if idx < files.len()
                && self.ucmp.compare(user_key, &files[idx].smallest.user_key)
                    != CmpOrdering::Less
            {
                result.push(Arc::clone(&files[idx]));
            }
        }
        result
    }

    /// True iff some file in `level` overlaps the user-key range
    /// [begin, end]; `None` bounds are open.
    pub fn overlap_in_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> bool {
        let files = &self.files[level];
        if level == 0 {
            return files.iter().any(|f| self.range_overlaps_file(f, begin, end));
        }
        // disjoint + sorted: binary search for the first file that could
        // reach past `begin`
        let idx = match begin {
            Some(begin) => find_file(files, begin, &*self.ucmp),
            None => 0,
        };
        match files.get(idx) {
            Some(f) => self.range_overlaps_file(f, begin, end),
            None => false,
        }
    }

    fn range_overlaps_file(
        &self,
        f: &RemoteTableMeta,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> bool {
        if let Some(begin) = begin {
            if self.ucmp.compare(&f.largest.user_key, begin) == CmpOrdering::Less {
                return false;
            }
        }
        if let Some(end) = end {
            if self.ucmp.compare(&f.smallest.user_key, end) == CmpOrdering::Greater {
                return false;
            }
        }
        true
    }

    /// All files in `level` overlapping the range. For level 0 the range
    /// grows to cover every transitively-overlapping file, since level-0
    /// files overlap each other.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<RemoteTableMeta>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<RemoteTableMeta>> = Vec::new();

        let mut i = 0;
        while i < self.files[level].len() {
            let f = &self.files[level][i];
            i += 1;
            if !self.range_overlaps_file(f, begin.as_deref(), end.as_deref()) {
                continue;
            }
            if level == 0 {
                // widen and restart if this file extends the range
                let mut widened = false;
                if let Some(b) = &begin {
                    if self.ucmp.compare(&f.smallest.user_key, b) == CmpOrdering::Less {
                        begin = Some(f.smallest.user_key.clone());
                        widened = true;
                    }
                }
                if let Some(e) = &end {
                    if self.ucmp.compare(&f.largest.user_key, e) == CmpOrdering::Greater {
                        end = Some(f.largest.user_key.clone());
                        widened = true;
                    }
                }
                if widened {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(Arc::clone(f));
        }
        inputs
    }

    /// Level a fresh memtable flush should land on: level 0 when anything
    /// there overlaps, otherwise pushed down while the next level stays
    /// clear and the grandparent overlap stays bounded.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlap_bytes: u64 = self
                    .overlapping_inputs(level + 2, Some(smallest_user_key), Some(largest_user_key))
                    .iter()
                    .map(|f| f.file_size)
                    .sum();
                if overlap_bytes > 10 * self.max_file_size {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Largest total overlap between any single file and its next level,
    /// used by the compaction planner on the memory node.
    pub fn max_next_level_overlapping_bytes(&self) -> u64 {
        let mut worst = 0u64;
        for level in 1..NUM_LEVELS - 1 {
            for f in &self.files[level] {
                let overlap: u64 = self
                    .overlapping_inputs(
                        level + 1,
                        Some(&f.smallest.user_key),
                        Some(&f.largest.user_key),
                    )
                    .iter()
                    .map(|g| g.file_size)
                    .sum();
                worst = worst.max(overlap);
            }
        }
        worst
    }

    /// Approximate byte offset of `key` within this version's total
    /// keyspace: files wholly before it count fully, a containing file
    /// counts half.
    pub fn approximate_offset_of(&self, key: &InternalKey) -> u64 {
        let mut offset = 0u64;
        for level in 0..NUM_LEVELS {
            for f in &self.files[level] {
                if f.largest <= *key {
                    offset += f.file_size;
                } else if f.smallest <= *key {
                    offset += f.file_size / 2;
                } else if level > 0 {
                    // sorted level: every later file is past the key too
                    break;
                }
            }
        }
        offset
    }

    /// One-line-per-level dump for the `sstables` property.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            out.push_str(&format!("--- level {level} ---\n"));
            for f in files {
                out.push_str(&format!(
                    "{}:{}[{:?} .. {:?}]\n",
                    f.number,
                    f.file_size,
                    String::from_utf8_lossy(&f.smallest.user_key),
                    String::from_utf8_lossy(&f.largest.user_key),
                ));
            }
        }
        out
    }
}

/// First index in a sorted, disjoint file list whose largest user key is
/// >= `user_key`; `files.len()` if none.
fn find_file(files: &[Arc<RemoteTableMeta>], user_key: &[u8], ucmp: &dyn Comparator) -> usize {
    let mut low = 0usize;
    let mut high = files.len();
    while low < high {
        let mid = (low + high) / 2;
        if ucmp.compare(&files[mid].largest.user_key, user_key) == CmpOrdering::Less {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}
