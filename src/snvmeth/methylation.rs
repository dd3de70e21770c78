use crate::snvmeth::read::{mod_tag, prob_tag};
use crate::utils::seq_to_ref_map;
use rust_htslib::bam;

/// A single 5mC probability mapped to reference coordinates.
///
/// The position is always the C of the CpG dinucleotide on the forward
/// strand, regardless of which strand the read came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MethCall {
    /// 1-based reference position of the forward-strand C.
    pub pos: i64,
    /// Modification probability in [0, 1].
    pub prob: f32,
}

/// One entry of the modification tag, e.g. `C+m?,5,3,0`.
#[derive(Debug, Clone, PartialEq)]
struct ModEntry {
    base: u8,
    orientation: u8,
    codes: String,
    deltas: Vec<u32>,
}

impl ModEntry {
    /// Number of modification codes in this entry. A numeric (ChEBI) code is
    /// a single modification; otherwise each character is one code.
    fn code_count(&self) -> usize {
        if self.codes.bytes().all(|b| b.is_ascii_digit()) {
            1
        } else {
            self.codes.len()
        }
    }

    /// Probability values this entry consumes from the probability array.
    fn prob_count(&self) -> usize {
        self.code_count() * self.deltas.len()
    }

    fn is_cpg_methylation(&self) -> bool {
        self.base == b'C' && self.orientation == b'+' && self.codes == "m"
    }
}

/// Decodes the delta-encoded 5mC calls of one read into reference-anchored
/// CpG probabilities.
///
/// `ref_seq` must cover the region window starting at the 0-based reference
/// position `ref_start_0` and is used to validate CpG context. Reads with
/// missing, malformed or truncated tags yield no calls rather than an error.
pub fn decode_read(rec: &bam::Record, ref_seq: &[u8], ref_start_0: i64) -> Vec<MethCall> {
    let mm = match mod_tag(rec) {
        Some(tag) => tag,
        None => return Vec::new(),
    };
    let ml = match prob_tag(rec) {
        Some(tag) => tag,
        None => return Vec::new(),
    };

    let entries = match parse_mod_string(&mm) {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    // The probability array is shared by all modification types in tag
    // order; our slice starts after every preceding entry's values.
    let mut prob_offset = 0usize;
    let mut target = None;
    for entry in &entries {
        if entry.is_cpg_methylation() {
            target = Some(entry);
            break;
        }
        prob_offset += entry.prob_count();
    }
    let entry = match target {
        Some(entry) => entry,
        None => return Vec::new(),
    };
    if entry.deltas.is_empty() || prob_offset + entry.deltas.len() > ml.len() {
        return Vec::new();
    }

    let seq_to_ref = seq_to_ref_map(rec);
    let seq = rec.seq().as_bytes();
    let is_reverse = rec.is_reverse();

    // The stored sequence of a reverse-strand read is the reverse complement
    // of the sequenced molecule, so the original C appears as G and the
    // deltas count target bases from the far end of the stored sequence.
    let target_base = if is_reverse { b'G' } else { b'C' };
    let positions: Box<dyn Iterator<Item = usize>> = if is_reverse {
        Box::new((0..seq.len()).rev())
    } else {
        Box::new(0..seq.len())
    };

    let mut calls = Vec::new();
    let mut base_count: u32 = 0;
    let mut delta_idx = 0usize;
    let mut next_target = entry.deltas[0];

    for qpos in positions {
        if seq[qpos].to_ascii_uppercase() != target_base {
            continue;
        }
        if base_count == next_target {
            let ref_pos = seq_to_ref[qpos];
            if ref_pos >= 0 {
                let offset = ref_pos - ref_start_0;
                if offset >= 0 && (offset as usize) < ref_seq.len() {
                    let offset = offset as usize;
                    let valid_cpg = if is_reverse {
                        ref_seq[offset] == b'G' && offset > 0 && ref_seq[offset - 1] == b'C'
                    } else {
                        ref_seq[offset] == b'C'
                            && offset + 1 < ref_seq.len()
                            && ref_seq[offset + 1] == b'G'
                    };
                    if valid_cpg {
                        let prob = f32::from(ml[prob_offset + delta_idx]) / 255.0;
                        // Reverse reads sit on the G; the forward-strand C is
                        // one base earlier, which is ref_pos in 1-based terms.
                        let report_pos = if is_reverse { ref_pos } else { ref_pos + 1 };
                        calls.push(MethCall {
                            pos: report_pos,
                            prob,
                        });
                    }
                }
            }
            delta_idx += 1;
            if delta_idx < entry.deltas.len() {
                next_target += entry.deltas[delta_idx] + 1;
            } else {
                break;
            }
        }
        base_count += 1;
    }

    calls
}

/// Parses the semicolon-separated modification tag; `None` means the tag is
/// unreadable and the read contributes no calls.
fn parse_mod_string(mm: &str) -> Option<Vec<ModEntry>> {
    let mut entries = Vec::new();
    for chunk in mm.split(';') {
        if chunk.is_empty() {
            continue;
        }
        entries.push(parse_mod_entry(chunk)?);
    }
    Some(entries)
}

fn parse_mod_entry(chunk: &str) -> Option<ModEntry> {
    let mut tokens = chunk.split(',');
    let prefix = tokens.next()?.as_bytes();
    if prefix.len() < 3 {
        return None;
    }
    let base = prefix[0];
    let orientation = prefix[1];
    if !matches!(base, b'A' | b'C' | b'G' | b'T' | b'U' | b'N')
        || !matches!(orientation, b'+' | b'-')
    {
        return None;
    }
    let mut codes = &prefix[2..];
    // Trailing '.' or '?' encodes how unlisted bases are to be interpreted;
    // it is not part of the code itself.
    if matches!(codes.last(), Some(&b'.') | Some(&b'?')) {
        codes = &codes[..codes.len() - 1];
    }
    if codes.is_empty() {
        return None;
    }

    let mut deltas = Vec::new();
    for token in tokens {
        if token.is_empty() {
            continue;
        }
        deltas.push(token.parse::<u32>().ok()?);
    }

    Some(ModEntry {
        base,
        orientation,
        codes: String::from_utf8_lossy(codes).into_owned(),
        deltas,
    })
}
