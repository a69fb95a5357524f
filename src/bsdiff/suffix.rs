// Suffix array construction and longest-match search.
//
// Implements Larsson & Sadakane's qsufsort: suffixes are bucketed by their
// first byte, then groups are refined by doubling the compared prefix
// length `h` until every group is a singleton. Sorted groups are marked by
// negative run lengths in the index array.
//
// Both working arrays are owned by the `SuffixArray` for the duration of
// one diff call; nothing is shared between calls, so concurrent diffs on
// distinct buffers are safe.

use std::cmp::Ordering;

/// Groups shorter than this are sorted by selection instead of partitioning.
const SMALL_GROUP: i64 = 16;

/// Suffix array over a borrowed buffer.
///
/// Holds `data.len() + 1` entries: the empty suffix sorts first.
pub struct SuffixArray<'a> {
    data: &'a [u8],
    index: Vec<i64>,
}

impl<'a> SuffixArray<'a> {
    /// Sort all suffixes of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        let n = data.len();
        let mut index = vec![0i64; n + 1];
        let mut rank = vec![0i64; n + 1];
        qsufsort(&mut index, &mut rank, data);
        Self { data, index }
    }

    /// Number of sorted suffixes (including the empty one).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Start offset of the `i`-th smallest suffix.
    #[inline]
    pub fn suffix_at(&self, i: usize) -> usize {
        self.index[i] as usize
    }

    /// Find the longest prefix of `target` occurring in the indexed buffer.
    ///
    /// Returns `(length, position)`. With an empty buffer or no common
    /// prefix the length is zero.
    pub fn longest_match(&self, target: &[u8]) -> (usize, usize) {
        let mut st = 0usize;
        let mut en = self.data.len();
        loop {
            if en - st < 2 {
                let x = match_len(&self.data[self.suffix_at(st)..], target);
                let y = match_len(&self.data[self.suffix_at(en)..], target);
                return if x > y {
                    (x, self.suffix_at(st))
                } else {
                    (y, self.suffix_at(en))
                };
            }
            let mid = st + (en - st) / 2;
            let suffix = &self.data[self.suffix_at(mid)..];
            let n = suffix.len().min(target.len());
            if suffix[..n].cmp(&target[..n]) == Ordering::Less {
                st = mid;
            } else {
                en = mid;
            }
        }
    }
}

/// Length of the common prefix of `a` and `b`.
#[inline]
pub fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

// ---------------------------------------------------------------------------
// qsufsort
// ---------------------------------------------------------------------------

fn qsufsort(index: &mut [i64], rank: &mut [i64], data: &[u8]) {
    let n = data.len() as i64;

    // buckets[c] = number of bytes smaller than c.
    let mut buckets = [0i64; 256];
    for &b in data {
        buckets[b as usize] += 1;
    }
    for i in 1..256 {
        buckets[i] += buckets[i - 1];
    }
    for i in (1..256).rev() {
        buckets[i] = buckets[i - 1];
    }
    buckets[0] = 0;

    // Initial order by first byte; slot 0 is the empty suffix.
    for (i, &b) in data.iter().enumerate() {
        buckets[b as usize] += 1;
        index[buckets[b as usize] as usize] = i as i64;
    }
    index[0] = n;
    for (i, &b) in data.iter().enumerate() {
        rank[i] = buckets[b as usize];
    }
    rank[n as usize] = 0;

    // Single-member buckets are already in their final place.
    for i in 1..256 {
        if buckets[i] == buckets[i - 1] + 1 {
            index[buckets[i] as usize] = -1;
        }
    }
    index[0] = -1;

    let mut h = 1i64;
    while index[0] != -(n + 1) {
        let mut len = 0i64;
        let mut i = 0i64;
        while i < n + 1 {
            let v = index[i as usize];
            if v < 0 {
                len -= v;
                i -= v;
            } else {
                if len != 0 {
                    index[(i - len) as usize] = -len;
                }
                len = rank[v as usize] + 1 - i;
                split(index, rank, i, len, h);
                i += len;
                len = 0;
            }
        }
        if len != 0 {
            index[(i - len) as usize] = -len;
        }
        h += h;
    }

    for i in 0..=n as usize {
        index[rank[i] as usize] = i as i64;
    }
}

/// Key of the suffix stored at `index[at]`, compared `h` bytes in.
#[inline]
fn key(index: &[i64], rank: &[i64], at: i64, h: i64) -> i64 {
    rank[(index[at as usize] + h) as usize]
}

fn split(index: &mut [i64], rank: &mut [i64], start: i64, len: i64, h: i64) {
    if len < SMALL_GROUP {
        let mut k = start;
        while k < start + len {
            let mut j = 1i64;
            let mut x = key(index, rank, k, h);
            let mut i = 1i64;
            while k + i < start + len {
                let v = key(index, rank, k + i, h);
                if v < x {
                    x = v;
                    j = 0;
                }
                if v == x {
                    index.swap((k + j) as usize, (k + i) as usize);
                    j += 1;
                }
                i += 1;
            }
            for i in 0..j {
                rank[index[(k + i) as usize] as usize] = k + j - 1;
            }
            if j == 1 {
                index[k as usize] = -1;
            }
            k += j;
        }
        return;
    }

    // Three-way partition around the middle key.
    let x = key(index, rank, start + len / 2, h);
    let mut jj = 0i64;
    let mut kk = 0i64;
    for i in start..start + len {
        let v = key(index, rank, i, h);
        if v < x {
            jj += 1;
        }
        if v == x {
            kk += 1;
        }
    }
    jj += start;
    kk += jj;

    let mut i = start;
    let mut j = 0i64;
    let mut k = 0i64;
    while i < jj {
        let v = key(index, rank, i, h);
        match v.cmp(&x) {
            Ordering::Less => i += 1,
            Ordering::Equal => {
                index.swap(i as usize, (jj + j) as usize);
                j += 1;
            }
            Ordering::Greater => {
                index.swap(i as usize, (kk + k) as usize);
                k += 1;
            }
        }
    }
    while jj + j < kk {
        if key(index, rank, jj + j, h) == x {
            j += 1;
        } else {
            index.swap((jj + j) as usize, (kk + k) as usize);
            k += 1;
        }
    }

    if jj > start {
        split(index, rank, start, jj - start, h);
    }

    for i in 0..kk - jj {
        rank[index[(jj + i) as usize] as usize] = kk - 1;
    }
    if jj == kk - 1 {
        index[jj as usize] = -1;
    }

    if start + len > kk {
        split(index, rank, kk, start + len - kk, h);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
