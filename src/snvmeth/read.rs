use crate::snvmeth::variant::SomaticSnv;
use crate::utils::{aligned_query_len, locate_ref_pos, RefPosLookup};
use rust_htslib::bam::{self, ext::BamRecordExtensions, record::Aux};
use std::fmt;
use std::str;

/// Strand orientation of a read, from the reverse-complement alignment flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
    Unknown,
}

impl Strand {
    pub fn symbol(self) -> char {
        match self {
            Strand::Forward => '+',
            Strand::Reverse => '-',
            Strand::Unknown => '?',
        }
    }
}

/// Whether a read's base at the variant position matches the alternate or
/// reference allele.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltSupport {
    Ref,
    Alt,
    Unknown,
}

impl fmt::Display for AltSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AltSupport::Ref => "REF",
            AltSupport::Alt => "ALT",
            AltSupport::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Bit-set of reasons a read was excluded from analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterReason(u16);

impl FilterReason {
    pub const NONE: FilterReason = FilterReason(0);
    pub const SECONDARY: FilterReason = FilterReason(1 << 0);
    pub const SUPPLEMENTARY: FilterReason = FilterReason(1 << 1);
    pub const DUPLICATE: FilterReason = FilterReason(1 << 2);
    pub const UNMAPPED: FilterReason = FilterReason(1 << 3);
    pub const LOW_MAPQ: FilterReason = FilterReason(1 << 4);
    pub const SHORT_READ: FilterReason = FilterReason(1 << 5);
    pub const MISSING_MOD_TAG: FilterReason = FilterReason(1 << 6);
    pub const MISSING_PROB_TAG: FilterReason = FilterReason(1 << 7);
    pub const SNV_NOT_COVERED: FilterReason = FilterReason(1 << 8);
    pub const SNV_IN_DELETION: FilterReason = FilterReason(1 << 9);
    pub const LOW_BASE_QUALITY: FilterReason = FilterReason(1 << 10);
    pub const NOT_REF_OR_ALT: FilterReason = FilterReason(1 << 11);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: FilterReason) -> bool {
        self.0 & other.0 != 0
    }

    const LABELS: [(FilterReason, &'static str); 12] = [
        (Self::SECONDARY, "SECONDARY"),
        (Self::SUPPLEMENTARY, "SUPPLEMENTARY"),
        (Self::DUPLICATE, "DUPLICATE"),
        (Self::UNMAPPED, "UNMAPPED"),
        (Self::LOW_MAPQ, "LOW_MAPQ"),
        (Self::SHORT_READ, "SHORT_READ"),
        (Self::MISSING_MOD_TAG, "MISSING_MOD_TAG"),
        (Self::MISSING_PROB_TAG, "MISSING_PROB_TAG"),
        (Self::SNV_NOT_COVERED, "SNV_NOT_COVERED"),
        (Self::SNV_IN_DELETION, "SNV_IN_DELETION"),
        (Self::LOW_BASE_QUALITY, "LOW_BASE_QUALITY"),
        (Self::NOT_REF_OR_ALT, "NOT_REF_OR_ALT"),
    ];
}

impl std::ops::BitOr for FilterReason {
    type Output = FilterReason;
    fn bitor(self, rhs: FilterReason) -> FilterReason {
        FilterReason(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FilterReason {
    fn bitor_assign(&mut self, rhs: FilterReason) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = Self::LABELS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// A read that passed filtering, reduced to the fields the matrix needs.
#[derive(Debug, Clone)]
pub struct ParsedRead {
    /// Region-local row index.
    pub read_id: usize,
    pub read_name: String,
    pub chr_id: u32,
    /// 0-based alignment start.
    pub align_start: i64,
    /// 0-based exclusive alignment end.
    pub align_end: i64,
    pub mapq: u8,
    pub strand: Strand,
    /// Haplotype tag as an opaque string; "0" means unphased.
    pub hp_tag: String,
    pub is_tumor: bool,
    pub alt_support: AltSupport,
}

/// A read that was excluded, kept for the debug channel.
#[derive(Debug, Clone)]
pub struct FilteredRead {
    pub read_name: String,
    pub align_start: i64,
    pub align_end: i64,
    pub mapq: u8,
    pub strand: Strand,
    pub is_tumor: bool,
    pub reasons: FilterReason,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadFilterConfig {
    pub min_mapq: u8,
    pub min_read_length: usize,
    pub min_base_quality: u8,
    pub require_mod_tags: bool,
}

impl Default for ReadFilterConfig {
    fn default() -> Self {
        ReadFilterConfig {
            min_mapq: 20,
            min_read_length: 1000,
            min_base_quality: 20,
            require_mod_tags: true,
        }
    }
}

/// Classifies and parses alignment records against the filter configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReadFilter {
    config: ReadFilterConfig,
}

impl ReadFilter {
    pub fn new(config: ReadFilterConfig) -> Self {
        ReadFilter { config }
    }

    /// Decides whether a record is kept, accumulating every applicable drop
    /// reason so the debug output can name all causes.
    pub fn classify(&self, rec: &bam::Record) -> (bool, FilterReason) {
        let mut reasons = FilterReason::NONE;

        if rec.is_secondary() {
            reasons |= FilterReason::SECONDARY;
        }
        if rec.is_supplementary() {
            reasons |= FilterReason::SUPPLEMENTARY;
        }
        if rec.is_duplicate() {
            reasons |= FilterReason::DUPLICATE;
        }
        if rec.is_unmapped() {
            reasons |= FilterReason::UNMAPPED;
        }

        if rec.mapq() < self.config.min_mapq {
            reasons |= FilterReason::LOW_MAPQ;
        }

        if aligned_query_len(rec) < self.config.min_read_length {
            reasons |= FilterReason::SHORT_READ;
        }

        if self.config.require_mod_tags {
            if mod_tag(rec).is_none() {
                reasons |= FilterReason::MISSING_MOD_TAG;
            }
            if prob_tag(rec).is_none() {
                reasons |= FilterReason::MISSING_PROB_TAG;
            }
        }

        (reasons.is_empty(), reasons)
    }

    /// Populates a `ParsedRead` for a record that passed `classify`.
    pub fn parse(
        &self,
        rec: &bam::Record,
        read_id: usize,
        is_tumor: bool,
        anchor_snv: &SomaticSnv,
    ) -> ParsedRead {
        let (alt_support, _) = self.alt_support(rec, anchor_snv);
        ParsedRead {
            read_id,
            read_name: read_name(rec),
            chr_id: anchor_snv.chr_id,
            align_start: rec.pos(),
            align_end: rec.reference_end(),
            mapq: rec.mapq(),
            strand: strand_of(rec),
            hp_tag: hp_tag(rec),
            is_tumor,
            alt_support,
        }
    }

    pub fn filtered_info(
        &self,
        rec: &bam::Record,
        is_tumor: bool,
        reasons: FilterReason,
    ) -> FilteredRead {
        FilteredRead {
            read_name: read_name(rec),
            align_start: rec.pos(),
            align_end: rec.reference_end(),
            mapq: rec.mapq(),
            strand: strand_of(rec),
            is_tumor,
            reasons,
        }
    }

    /// Determines REF/ALT support at the variant position.
    ///
    /// Walks the alignment to the variant, gates on base quality, then
    /// compares the read base against both alleles.
    pub fn alt_support(&self, rec: &bam::Record, snv: &SomaticSnv) -> (AltSupport, FilterReason) {
        let snv_pos_0 = snv.pos - 1;

        if snv_pos_0 < rec.pos() || snv_pos_0 >= rec.reference_end() {
            return (AltSupport::Unknown, FilterReason::SNV_NOT_COVERED);
        }

        let query_offset = match locate_ref_pos(rec, snv_pos_0) {
            RefPosLookup::Query(offset) => offset,
            RefPosLookup::InDeletion => {
                return (AltSupport::Unknown, FilterReason::SNV_IN_DELETION)
            }
            RefPosLookup::NotCovered => {
                return (AltSupport::Unknown, FilterReason::SNV_NOT_COVERED)
            }
        };

        let quals = rec.qual();
        if query_offset >= quals.len() || quals[query_offset] < self.config.min_base_quality {
            return (AltSupport::Unknown, FilterReason::LOW_BASE_QUALITY);
        }

        let base = rec.seq().as_bytes()[query_offset].to_ascii_uppercase();
        if base == snv.alt_base {
            (AltSupport::Alt, FilterReason::NONE)
        } else if base == snv.ref_base {
            (AltSupport::Ref, FilterReason::NONE)
        } else {
            (AltSupport::Unknown, FilterReason::NOT_REF_OR_ALT)
        }
    }
}

pub fn strand_of(rec: &bam::Record) -> Strand {
    if rec.is_reverse() {
        Strand::Reverse
    } else {
        Strand::Forward
    }
}

/// Read name with `/1` or `/2` suffixes for paired mates, so both mates stay
/// distinct under the per-region name uniqueness rule.
pub fn read_name(rec: &bam::Record) -> String {
    let mut name = str::from_utf8(rec.qname()).unwrap_or("").to_owned();
    if rec.is_paired() {
        if rec.is_first_in_template() {
            name.push_str("/1");
        } else if rec.is_last_in_template() {
            name.push_str("/2");
        }
    }
    name
}

/// Retrieves the HP (haplotype) tag as an opaque string; "0" means unphased.
pub fn hp_tag(rec: &bam::Record) -> String {
    match rec.aux(b"HP") {
        Ok(Aux::String(value)) => value.to_string(),
        Ok(Aux::I8(v)) => v.to_string(),
        Ok(Aux::I16(v)) => v.to_string(),
        Ok(Aux::I32(v)) => v.to_string(),
        Ok(Aux::U8(v)) => v.to_string(),
        Ok(Aux::U16(v)) => v.to_string(),
        Ok(Aux::U32(v)) => v.to_string(),
        _ => "0".to_string(),
    }
}

/// The modification tag, accepting both the current and legacy spellings.
pub fn mod_tag(rec: &bam::Record) -> Option<String> {
    for key in [b"MM", b"Mm"] {
        if let Ok(Aux::String(value)) = rec.aux(key) {
            return Some(value.to_string());
        }
    }
    None
}

/// The modification probability byte array.
pub fn prob_tag(rec: &bam::Record) -> Option<Vec<u8>> {
    for key in [b"ML", b"Ml"] {
        if let Ok(Aux::ArrayU8(values)) = rec.aux(key) {
            return Some(values.iter().collect());
        }
    }
    None
}
