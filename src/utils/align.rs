use rust_htslib::bam::{self, record::Cigar};

/// Maps each query position of a record to its 0-based reference position.
///
/// Positions inside insertions and soft-clips have no reference coordinate
/// and are set to -1. Hard clips consume neither query nor reference.
pub fn seq_to_ref_map(rec: &bam::Record) -> Vec<i64> {
    let mut map = vec![-1i64; rec.seq_len()];
    let mut ref_pos = rec.pos();
    let mut seq_pos = 0usize;

    for op in rec.cigar().iter() {
        match *op {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                for _ in 0..len {
                    if seq_pos < map.len() {
                        map[seq_pos] = ref_pos;
                    }
                    seq_pos += 1;
                    ref_pos += 1;
                }
            }
            Cigar::Ins(len) | Cigar::SoftClip(len) => {
                seq_pos += len as usize;
            }
            Cigar::Del(len) | Cigar::RefSkip(len) => {
                ref_pos += i64::from(len);
            }
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }

    map
}

/// Outcome of locating a reference position within a record's alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefPosLookup {
    /// The alignment does not reach the position.
    NotCovered,
    /// The position falls inside a deletion or reference skip.
    InDeletion,
    /// The query offset aligned to the position.
    Query(usize),
}

/// Walks the CIGAR to find the query offset aligned to `ref_pos_0`.
pub fn locate_ref_pos(rec: &bam::Record, ref_pos_0: i64) -> RefPosLookup {
    let mut ref_pos = rec.pos();
    let mut seq_pos = 0usize;

    for op in rec.cigar().iter() {
        match *op {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                let len = i64::from(len);
                if ref_pos <= ref_pos_0 && ref_pos_0 < ref_pos + len {
                    return RefPosLookup::Query(seq_pos + (ref_pos_0 - ref_pos) as usize);
                }
                ref_pos += len;
                seq_pos += len as usize;
            }
            Cigar::Ins(len) | Cigar::SoftClip(len) => {
                seq_pos += len as usize;
            }
            Cigar::Del(len) | Cigar::RefSkip(len) => {
                let len = i64::from(len);
                if ref_pos <= ref_pos_0 && ref_pos_0 < ref_pos + len {
                    return RefPosLookup::InDeletion;
                }
                ref_pos += len;
            }
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }

    RefPosLookup::NotCovered
}

/// Length of the query sequence implied by the CIGAR (M/I/S/=/X operations).
pub fn aligned_query_len(rec: &bam::Record) -> usize {
    rec.cigar()
        .iter()
        .map(|op| match *op {
            Cigar::Match(len)
            | Cigar::Ins(len)
            | Cigar::SoftClip(len)
            | Cigar::Equal(len)
            | Cigar::Diff(len) => len as usize,
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::CigarString;

    fn record_with_cigar(seq: &[u8], cigar: Vec<Cigar>, pos: i64) -> bam::Record {
        let mut rec = bam::Record::new();
        let qual = vec![40; seq.len()];
        rec.set(b"read", Some(&CigarString(cigar)), seq, &qual);
        rec.set_pos(pos);
        rec
    }

    #[test]
    fn simple_match_maps_one_to_one() {
        let rec = record_with_cigar(b"ACGTACG", vec![Cigar::Match(7)], 100);
        let map = seq_to_ref_map(&rec);
        assert_eq!(map, vec![100, 101, 102, 103, 104, 105, 106]);
    }

    #[test]
    fn insertion_has_no_reference_position() {
        // 3M2I3M starting at 10: query positions 3 and 4 are inserted
        let rec = record_with_cigar(
            b"ACGTTACG",
            vec![Cigar::Match(3), Cigar::Ins(2), Cigar::Match(3)],
            10,
        );
        let map = seq_to_ref_map(&rec);
        assert_eq!(map, vec![10, 11, 12, -1, -1, 13, 14, 15]);
    }

    #[test]
    fn deletion_advances_reference_only() {
        let rec = record_with_cigar(
            b"ACGACG",
            vec![Cigar::Match(3), Cigar::Del(4), Cigar::Match(3)],
            10,
        );
        let map = seq_to_ref_map(&rec);
        assert_eq!(map, vec![10, 11, 12, 17, 18, 19]);
    }

    #[test]
    fn soft_clip_consumes_query() {
        let rec = record_with_cigar(
            b"NNACGTA",
            vec![Cigar::SoftClip(2), Cigar::Match(5)],
            50,
        );
        let map = seq_to_ref_map(&rec);
        assert_eq!(map, vec![-1, -1, 50, 51, 52, 53, 54]);
    }

    #[test]
    fn locate_in_match() {
        let rec = record_with_cigar(b"ACGTACG", vec![Cigar::Match(7)], 100);
        assert_eq!(locate_ref_pos(&rec, 103), RefPosLookup::Query(3));
        assert_eq!(locate_ref_pos(&rec, 99), RefPosLookup::NotCovered);
        assert_eq!(locate_ref_pos(&rec, 107), RefPosLookup::NotCovered);
    }

    #[test]
    fn locate_in_deletion() {
        let rec = record_with_cigar(
            b"ACGACG",
            vec![Cigar::Match(3), Cigar::Del(4), Cigar::Match(3)],
            10,
        );
        assert_eq!(locate_ref_pos(&rec, 14), RefPosLookup::InDeletion);
        assert_eq!(locate_ref_pos(&rec, 17), RefPosLookup::Query(3));
    }

    #[test]
    fn locate_after_insertion_shifts_query_offset() {
        let rec = record_with_cigar(
            b"ACGTTACG",
            vec![Cigar::Match(3), Cigar::Ins(2), Cigar::Match(3)],
            10,
        );
        assert_eq!(locate_ref_pos(&rec, 13), RefPosLookup::Query(5));
    }

    #[test]
    fn aligned_length_counts_query_ops() {
        let rec = record_with_cigar(
            b"ACGTTACG",
            vec![Cigar::Match(3), Cigar::Ins(2), Cigar::Match(3)],
            10,
        );
        assert_eq!(aligned_query_len(&rec), 8);
        let rec = record_with_cigar(
            b"ACGACG",
            vec![Cigar::Match(3), Cigar::Del(4), Cigar::Match(3)],
            10,
        );
        assert_eq!(aligned_query_len(&rec), 6);
    }
}
