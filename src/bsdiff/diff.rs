// bsdiff match search.
//
// Scans the new buffer left to right. At every position the suffix array
// yields the longest match against the old buffer; the match is accepted
// only when it beats a blind forward extension of the previous match by
// more than `SLACK` bytes (or ties it exactly). Between two accepted
// matches the previous one is extended forward and the next one backward,
// and whatever neither covers becomes extra bytes.

use super::control::{ControlTriple, DiffRecord};
use super::suffix::SuffixArray;

/// A candidate must out-score the extended previous match by this much.
const SLACK: i64 = 8;

/// Compute the diff record turning `old` into `new`.
pub fn diff(old: &[u8], new: &[u8]) -> DiffRecord {
    let sa = SuffixArray::new(old);
    diff_with_index(&sa, old, new)
}

/// Same as [`diff`] with a prebuilt suffix array of `old`.
pub fn diff_with_index(sa: &SuffixArray<'_>, old: &[u8], new: &[u8]) -> DiffRecord {
    let old_len = old.len() as i64;
    let new_len = new.len() as i64;

    let mut record = DiffRecord::default();
    record.diff.reserve(new.len());

    // Does extending the previous match put `new[i]` on top of an equal old byte?
    let agrees = |i: i64, offset: i64| -> bool {
        let o = i + offset;
        o >= 0 && o < old_len && old[o as usize] == new[i as usize]
    };

    let mut scan = 0i64;
    let mut len = 0i64;
    let mut pos = 0i64;
    let mut last_scan = 0i64;
    let mut last_pos = 0i64;
    let mut last_offset = 0i64;

    while scan < new_len {
        let mut old_score = 0i64;
        scan += len;
        let mut scsc = scan;

        while scan < new_len {
            let (l, p) = sa.longest_match(&new[scan as usize..]);
            len = l as i64;
            pos = p as i64;

            while scsc < scan + len {
                if agrees(scsc, last_offset) {
                    old_score += 1;
                }
                scsc += 1;
            }

            if (len == old_score && len != 0) || len > old_score + SLACK {
                break;
            }

            if agrees(scan, last_offset) {
                old_score -= 1;
            }
            scan += 1;
        }

        // An exact tie means the previous match already covers this one.
        if len == old_score && scan != new_len {
            continue;
        }

        // Forward extension of the previous match.
        let mut s = 0i64;
        let mut best = 0i64;
        let mut lenf = 0i64;
        let mut i = 0i64;
        while last_scan + i < scan && last_pos + i < old_len {
            if old[(last_pos + i) as usize] == new[(last_scan + i) as usize] {
                s += 1;
            }
            i += 1;
            if s * 2 - i > best * 2 - lenf {
                best = s;
                lenf = i;
            }
        }

        // Backward extension of the new match.
        let mut lenb = 0i64;
        if scan < new_len {
            let mut s = 0i64;
            let mut best = 0i64;
            let mut i = 1i64;
            while scan >= last_scan + i && pos >= i {
                if old[(pos - i) as usize] == new[(scan - i) as usize] {
                    s += 1;
                }
                if s * 2 - i > best * 2 - lenb {
                    best = s;
                    lenb = i;
                }
                i += 1;
            }
        }

        // Overlapping extensions: split where agreement is maximal.
        if last_scan + lenf > scan - lenb {
            let overlap = (last_scan + lenf) - (scan - lenb);
            let mut s = 0i64;
            let mut best = 0i64;
            let mut lens = 0i64;
            for i in 0..overlap {
                let fwd = (last_scan + lenf - overlap + i) as usize;
                let fwd_old = (last_pos + lenf - overlap + i) as usize;
                if new[fwd] == old[fwd_old] {
                    s += 1;
                }
                let back = (scan - lenb + i) as usize;
                let back_old = (pos - lenb + i) as usize;
                if new[back] == old[back_old] {
                    s -= 1;
                }
                if s > best {
                    best = s;
                    lens = i + 1;
                }
            }
            lenf += lens - overlap;
            lenb -= lens;
        }

        for i in 0..lenf {
            let n = new[(last_scan + i) as usize];
            let o = old[(last_pos + i) as usize];
            record.diff.push(n.wrapping_sub(o));
        }
        let extra_start = (last_scan + lenf) as usize;
        let extra_end = (scan - lenb) as usize;
        record.extra.extend_from_slice(&new[extra_start..extra_end]);

        record.controls.push(ControlTriple {
            copy_len: lenf,
            extra_len: (scan - lenb) - (last_scan + lenf),
            seek: (pos - lenb) - (last_pos + lenf),
        });

        last_scan = scan - lenb;
        last_pos = pos - lenb;
        last_offset = pos - scan;
    }

    record
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
