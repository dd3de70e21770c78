use crate::snvmeth::chrom::ChromIndex;
use crate::utils::{open_table_reader, Result};
use rust_htslib::bcf::{self, Read};
use std::{io::BufRead, path::Path};

/// A biallelic somatic single-nucleotide variant.
#[derive(Debug, Clone)]
pub struct SomaticSnv {
    pub snv_id: usize,
    pub chr_id: u32,
    /// 1-based position of the variant.
    pub pos: i64,
    pub ref_base: u8,
    pub alt_base: u8,
    pub qual: f32,
    pub is_pass: bool,
    /// Tumor variant allele fraction where available (VCF AF field).
    pub somatic_conf: f32,
}

/// The ordered set of variants driving region processing.
///
/// Outlives all regions; the final result vector preserves this order.
#[derive(Debug, Default)]
pub struct VariantTable {
    snvs: Vec<SomaticSnv>,
}

impl VariantTable {
    /// Loads variants from a VCF/BCF or a TSV table, chosen by extension.
    pub fn load(path: &Path, chrom_index: &mut ChromIndex) -> Result<Self> {
        let name = path.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".vcf") || name.ends_with(".vcf.gz") || name.ends_with(".bcf") {
            Self::from_vcf(path, chrom_index)
        } else {
            Self::from_tsv(path, chrom_index)
        }
    }

    /// Loads a whitespace-separated table with columns `chr pos ref alt [qual]`.
    ///
    /// A first line mentioning "chr" or "pos" is treated as a header. Lines
    /// starting with '#' are skipped. Only biallelic SNVs survive.
    pub fn from_tsv(path: &Path, chrom_index: &mut ChromIndex) -> Result<Self> {
        let reader = open_table_reader(path)?;
        let table = Self::from_tsv_reader(reader, chrom_index)?;
        log::info!("Loaded {} SNVs from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn from_tsv_reader(reader: impl BufRead, chrom_index: &mut ChromIndex) -> Result<Self> {
        let mut snvs: Vec<SomaticSnv> = Vec::new();
        let mut skipped = 0usize;

        for (line_idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| format!("Error reading line {}: {}", line_idx + 1, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if line_idx == 0 && (trimmed.contains("chr") || trimmed.contains("pos")) {
                // Header line
                continue;
            }

            match parse_tsv_record(trimmed) {
                Some((chr_name, pos, ref_base, alt_base, qual)) => {
                    let snv = SomaticSnv {
                        snv_id: snvs.len(),
                        chr_id: chrom_index.get_or_create_id(chr_name),
                        pos,
                        ref_base,
                        alt_base,
                        qual,
                        is_pass: true,
                        somatic_conf: 0.0,
                    };
                    snvs.push(snv);
                }
                None => {
                    skipped += 1;
                    log::debug!("Skipping unparseable SNV at line {}: {}", line_idx + 1, trimmed);
                }
            }
        }

        if skipped > 0 {
            log::warn!("Skipped {} malformed or non-SNV records", skipped);
        }
        Ok(VariantTable { snvs })
    }

    /// Loads PASS biallelic SNVs from a VCF/BCF file.
    ///
    /// Header contigs seed the chromosome index so ids are stable across the
    /// run; the FORMAT AF value of the first sample becomes the somatic
    /// confidence when present.
    pub fn from_vcf(path: &Path, chrom_index: &mut ChromIndex) -> Result<Self> {
        let mut reader = bcf::Reader::from_path(path)
            .map_err(|e| format!("Failed to open VCF file {}: {}", path.display(), e))?;
        let header = reader.header().clone();

        for rid in 0..header.contig_count() {
            let name = header
                .rid2name(rid)
                .map_err(|e| format!("Invalid contig in VCF header: {}", e))?;
            let name = std::str::from_utf8(name)
                .map_err(|e| format!("Non-UTF8 contig name in VCF header: {}", e))?;
            chrom_index.get_or_create_id(name);
        }
        log::info!("Loaded {} contigs from VCF header", header.contig_count());

        let mut snvs: Vec<SomaticSnv> = Vec::new();
        let mut skipped = 0usize;

        for record in reader.records() {
            let record =
                record.map_err(|e| format!("Failed to read VCF record: {}", e))?;

            if !record_is_pass(&header, &record) {
                skipped += 1;
                continue;
            }

            let alleles = record.alleles();
            if alleles.len() != 2 || alleles[0].len() != 1 || alleles[1].len() != 1 {
                skipped += 1;
                continue;
            }
            let ref_base = alleles[0][0].to_ascii_uppercase();
            let alt_base = alleles[1][0].to_ascii_uppercase();
            if !is_nucleotide(ref_base) || !is_nucleotide(alt_base) || ref_base == alt_base {
                skipped += 1;
                continue;
            }

            let rid = match record.rid() {
                Some(rid) => rid,
                None => {
                    skipped += 1;
                    continue;
                }
            };
            let chr_name = header
                .rid2name(rid)
                .map_err(|e| format!("Invalid contig id in VCF record: {}", e))?;
            let chr_name = std::str::from_utf8(chr_name)
                .map_err(|e| format!("Non-UTF8 contig name: {}", e))?;

            let somatic_conf = record
                .format(b"AF")
                .float()
                .ok()
                .and_then(|af| af.first().and_then(|vals| vals.first().copied()))
                .unwrap_or(0.0);

            let snv = SomaticSnv {
                snv_id: snvs.len(),
                chr_id: chrom_index.get_or_create_id(chr_name),
                pos: record.pos() + 1,
                ref_base,
                alt_base,
                qual: record.qual(),
                is_pass: true,
                somatic_conf,
            };
            snvs.push(snv);
        }

        log::info!(
            "Finished loading VCF {}. Loaded: {}, Skipped: {}",
            path.display(),
            snvs.len(),
            skipped
        );
        Ok(VariantTable { snvs })
    }

    pub fn len(&self) -> usize {
        self.snvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snvs.is_empty()
    }

    pub fn all(&self) -> &[SomaticSnv] {
        &self.snvs
    }
}

fn is_nucleotide(base: u8) -> bool {
    matches!(base, b'A' | b'C' | b'G' | b'T')
}

/// Missing FILTER counts as PASS, matching the htslib convention.
fn record_is_pass(header: &bcf::header::HeaderView, record: &bcf::Record) -> bool {
    let mut filters = record.filters().peekable();
    if filters.peek().is_none() {
        return true;
    }
    filters.any(|id| header.id_to_name(id).as_slice() == b"PASS".as_slice())
}

fn parse_tsv_record(line: &str) -> Option<(&str, i64, u8, u8, f32)> {
    let mut fields = line.split_whitespace();
    let chr_name = fields.next()?;
    let pos: i64 = fields.next()?.parse().ok()?;
    let ref_field = fields.next()?;
    let alt_field = fields.next()?;
    let qual: f32 = fields.next().and_then(|q| q.parse().ok()).unwrap_or(0.0);

    if ref_field.len() != 1 || alt_field.len() != 1 || pos < 1 {
        return None;
    }
    let ref_base = ref_field.as_bytes()[0].to_ascii_uppercase();
    let alt_base = alt_field.as_bytes()[0].to_ascii_uppercase();
    if !is_nucleotide(ref_base) || !is_nucleotide(alt_base) || ref_base == alt_base {
        return None;
    }
    Some((chr_name, pos, ref_base, alt_base, qual))
}
