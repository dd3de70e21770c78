use crate::snvmeth::distance::DistanceMatrix;
use crate::snvmeth::matrix::MethylationMatrix;
use crate::snvmeth::process::RegionResult;
use crate::snvmeth::read::{FilteredRead, ParsedRead, Strand};
use crate::snvmeth::tree::Tree;
use crate::snvmeth::writers::{write_leaf_order, write_linkage_matrix, write_newick};
use crate::snvmeth::variant::SomaticSnv;
use crate::utils::{mean, median, std_dev, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes one region's outputs under
/// `<output-dir>/<variant-stem>/<chr>_<pos>/<chr>_<start>_<end>/`.
#[derive(Debug, Clone)]
pub struct RegionWriter {
    output_dir: PathBuf,
    variant_stem: String,
}

impl RegionWriter {
    pub fn new(output_dir: &Path, variants_path: &Path) -> Result<Self> {
        let variant_stem = variant_file_stem(variants_path);
        let writer = RegionWriter {
            output_dir: output_dir.to_path_buf(),
            variant_stem,
        };
        fs::create_dir_all(writer.output_dir.join(&writer.variant_stem))
            .map_err(|e| format!("Cannot create output directory: {}", e))?;
        Ok(writer)
    }

    /// Creates (if needed) and returns the directory for one region.
    pub fn region_dir(
        &self,
        chr_name: &str,
        snv_pos: i64,
        region_start: i64,
        region_end: i64,
    ) -> Result<PathBuf> {
        let dir = self
            .output_dir
            .join(&self.variant_stem)
            .join(format!("{}_{}", chr_name, snv_pos))
            .join(format!("{}_{}_{}", chr_name, region_start, region_end));
        for sub in ["reads", "methylation", "clustering"] {
            fs::create_dir_all(dir.join(sub))
                .map_err(|e| format!("Cannot create {}: {}", dir.join(sub).display(), e))?;
        }
        Ok(dir)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_metadata(
        &self,
        region_dir: &Path,
        snv: &SomaticSnv,
        chr_name: &str,
        region_id: usize,
        region_start: i64,
        region_end: i64,
        result: &RegionResult,
        elapsed_ms: f64,
    ) -> Result<()> {
        let path = region_dir.join("metadata.txt");
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            writeln!(file, "Region ID: {}", region_id)?;
            writeln!(file, "Region: {}:{}-{}", chr_name, region_start, region_end)?;
            writeln!(file, "Region Size: {} bp", region_end - region_start + 1)?;
            writeln!(file)?;
            writeln!(file, "SNV ID: {}", snv.snv_id)?;
            writeln!(file, "SNV Position: {}:{}", chr_name, snv.pos)?;
            writeln!(
                file,
                "SNV: {} -> {}",
                snv.ref_base as char, snv.alt_base as char
            )?;
            writeln!(file, "SNV Quality: {}", snv.qual)?;
            writeln!(file, "Somatic Confidence: {}", snv.somatic_conf)?;
            writeln!(file)?;
            writeln!(file, "Num Reads: {}", result.num_reads)?;
            writeln!(file, "Forward Reads: {}", result.num_forward_reads)?;
            writeln!(file, "Reverse Reads: {}", result.num_reverse_reads)?;
            writeln!(file, "Filtered Reads: {}", result.num_filtered_reads)?;
            writeln!(file, "Num CpG Sites: {}", result.num_cpgs)?;
            writeln!(
                file,
                "Matrix Dimensions: {} x {}",
                result.num_reads, result.num_cpgs
            )?;
            writeln!(file)?;
            writeln!(file, "Processing Time: {:.2} ms", elapsed_ms)?;
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }

    pub fn write_reads(
        &self,
        region_dir: &Path,
        reads: &[ParsedRead],
        chr_name: &str,
    ) -> Result<()> {
        let path = region_dir.join("reads").join("reads.tsv");
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            writeln!(
                file,
                "read_id\tread_name\tchr\tstart\tend\tmapq\thp\talt_support\tis_tumor\tstrand"
            )?;
            for read in reads {
                writeln!(
                    file,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    read.read_id,
                    read.read_name,
                    chr_name,
                    read.align_start,
                    read.align_end,
                    read.mapq,
                    read.hp_tag,
                    read.alt_support,
                    u8::from(read.is_tumor),
                    read.strand.symbol()
                )?;
            }
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }

    pub fn write_cpg_sites(
        &self,
        region_dir: &Path,
        chr_name: &str,
        cpg_positions: &[i64],
    ) -> Result<()> {
        let path = region_dir.join("methylation").join("cpg_sites.tsv");
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            writeln!(file, "cpg_id\tchr\tposition")?;
            for (cpg_id, pos) in cpg_positions.iter().enumerate() {
                writeln!(file, "{}\t{}\t{}", cpg_id, chr_name, pos)?;
            }
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }

    pub fn write_matrix(&self, region_dir: &Path, matrix: &MethylationMatrix) -> Result<()> {
        let path = region_dir.join("methylation").join("methylation.csv");
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            write!(file, "read_id")?;
            for pos in &matrix.cpg_positions {
                write!(file, ",{}", pos)?;
            }
            writeln!(file)?;
            for row in 0..matrix.n_reads {
                write!(file, "{}", row)?;
                for &value in matrix.raw_row(row) {
                    if value.is_nan() {
                        write!(file, ",NA")?;
                    } else {
                        write!(file, ",{:.4}", value)?;
                    }
                }
                writeln!(file)?;
            }
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }

    /// Methylation matrices restricted per strand, with the originating row
    /// id carried alongside the strand-local one.
    pub fn write_strand_matrices(
        &self,
        region_dir: &Path,
        reads: &[ParsedRead],
        matrix: &MethylationMatrix,
    ) -> Result<()> {
        for (strand, file_name) in [
            (Strand::Forward, "methylation_forward.csv"),
            (Strand::Reverse, "methylation_reverse.csv"),
        ] {
            let path = region_dir.join("methylation").join(file_name);
            let mut file = create(&path)?;
            (|| -> std::io::Result<()> {
                write!(file, "read_id,original_read_id")?;
                for pos in &matrix.cpg_positions {
                    write!(file, ",{}", pos)?;
                }
                writeln!(file)?;
                let mut local_id = 0usize;
                for (row, read) in reads.iter().enumerate() {
                    if read.strand != strand {
                        continue;
                    }
                    write!(file, "{},{}", local_id, row)?;
                    for &value in matrix.raw_row(row) {
                        if value.is_nan() {
                            write!(file, ",NA")?;
                        } else {
                            write!(file, ",{:.4}", value)?;
                        }
                    }
                    writeln!(file)?;
                    local_id += 1;
                }
                Ok(())
            })()
            .map_err(|e| write_error(&path, e))?;
        }
        Ok(())
    }

    /// One symmetric distance matrix as CSV; `suffix` distinguishes the
    /// strand-restricted variants.
    pub fn write_distance_matrix(
        &self,
        region_dir: &Path,
        dist: &DistanceMatrix,
        suffix: Option<&str>,
    ) -> Result<()> {
        let metric = dist.metric;
        let file_name = match suffix {
            Some(suffix) => format!("distance_{}_{}.csv", metric.file_tag(), suffix),
            None => format!("distance_{}.csv", metric.file_tag()),
        };
        let path = region_dir.join(file_name);
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            write!(file, "read_id")?;
            for id in &dist.read_ids {
                write!(file, ",{}", id)?;
            }
            writeln!(file)?;
            for i in 0..dist.size() {
                write!(file, "{}", dist.read_ids[i])?;
                for j in 0..dist.size() {
                    let value = dist.get(i, j);
                    if value.is_nan() {
                        write!(file, ",NA")?;
                    } else {
                        write!(file, ",{:.6}", value)?;
                    }
                }
                writeln!(file)?;
            }
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }

    pub fn write_distance_stats(&self, region_dir: &Path, dist: &DistanceMatrix) -> Result<()> {
        let metric = dist.metric;
        let path = region_dir.join(format!("distance_{}_stats.txt", metric.file_tag()));
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            writeln!(file, "Distance Matrix Statistics")?;
            writeln!(file, "==========================")?;
            writeln!(file)?;
            writeln!(file, "Number of reads: {}", dist.size())?;
            writeln!(file, "Metric: {}", metric)?;
            writeln!(file, "Min common coverage: {}", dist.min_common_coverage)?;
            writeln!(file)?;
            writeln!(file, "Valid pairs: {}", dist.valid_pairs)?;
            writeln!(
                file,
                "Invalid pairs (insufficient overlap): {}",
                dist.invalid_pairs
            )?;
            let total_pairs = dist.valid_pairs + dist.invalid_pairs;
            if total_pairs > 0 {
                writeln!(
                    file,
                    "Valid pair ratio: {:.1}%",
                    100.0 * dist.valid_pairs as f64 / total_pairs as f64
                )?;
            }
            writeln!(
                file,
                "Mean common coverage: {:.2}",
                dist.mean_common_coverage
            )?;

            let distances = dist.valid_distances();
            if !distances.is_empty() {
                let min = distances.iter().copied().fold(f64::INFINITY, f64::min);
                let max = distances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                writeln!(file)?;
                writeln!(file, "Distance Statistics:")?;
                writeln!(file, "  Min: {:.4}", min)?;
                writeln!(file, "  Median: {:.4}", median(&distances).unwrap_or(0.0))?;
                writeln!(file, "  Max: {:.4}", max)?;
                writeln!(file, "  Mean: {:.4}", mean(&distances).unwrap_or(0.0))?;
                writeln!(file, "  Std Dev: {:.4}", std_dev(&distances).unwrap_or(0.0))?;
            }
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }

    /// Tree outputs; the linkage matrix and leaf order accompany the primary
    /// tree only.
    pub fn write_clustering(
        &self,
        region_dir: &Path,
        tree: &Tree,
        file_name: &str,
        with_records: bool,
    ) -> Result<()> {
        let clustering_dir = region_dir.join("clustering");
        write_newick(tree, &clustering_dir.join(file_name))?;
        if with_records {
            write_linkage_matrix(tree, &clustering_dir.join("linkage_matrix.csv"))?;
            write_leaf_order(tree, &clustering_dir.join("leaf_order.txt"))?;
        }
        Ok(())
    }

    pub fn write_filtered_reads(
        &self,
        region_dir: &Path,
        chr_name: &str,
        filtered_reads: &[FilteredRead],
    ) -> Result<()> {
        let path = region_dir.join("filtered_reads.tsv");
        let mut file = create(&path)?;
        (|| -> std::io::Result<()> {
            writeln!(
                file,
                "read_name\tchr\tstart\tend\tmapq\tstrand\tis_tumor\tfilter_reasons"
            )?;
            for read in filtered_reads {
                writeln!(
                    file,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    read.read_name,
                    chr_name,
                    read.align_start,
                    read.align_end,
                    read.mapq,
                    read.strand.symbol(),
                    u8::from(read.is_tumor),
                    read.reasons
                )?;
            }
            Ok(())
        })()
        .map_err(|e| write_error(&path, e))
    }
}

/// File stem of the variant source, with a trailing `.vcf` stripped from
/// `.vcf.gz` inputs.
fn variant_file_stem(path: &Path) -> String {
    let mut stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "variants".to_string());
    if let Some(short) = stem.strip_suffix(".vcf") {
        stem = short.to_string();
    }
    stem
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| format!("Cannot open file for writing {}: {}", path.display(), e))
}

fn write_error(path: &Path, e: std::io::Error) -> String {
    format!("Failed writing {}: {}", path.display(), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snvmeth::distance::{DistanceConfig, DistanceMetric};
    use crate::snvmeth::read::AltSupport;

    fn snv() -> SomaticSnv {
        SomaticSnv {
            snv_id: 3,
            chr_id: 0,
            pos: 1000,
            ref_base: b'C',
            alt_base: b'T',
            qual: 60.0,
            is_pass: true,
            somatic_conf: 0.25,
        }
    }

    fn reads() -> Vec<ParsedRead> {
        vec![
            ParsedRead {
                read_id: 0,
                read_name: "m0/1".into(),
                chr_id: 0,
                align_start: 500,
                align_end: 1500,
                mapq: 60,
                strand: Strand::Forward,
                hp_tag: "1".into(),
                is_tumor: true,
                alt_support: AltSupport::Alt,
            },
            ParsedRead {
                read_id: 1,
                read_name: "m1".into(),
                chr_id: 0,
                align_start: 600,
                align_end: 1600,
                mapq: 55,
                strand: Strand::Reverse,
                hp_tag: "0".into(),
                is_tumor: false,
                alt_support: AltSupport::Ref,
            },
        ]
    }

    fn writer_in(dir: &Path) -> RegionWriter {
        RegionWriter::new(dir, Path::new("somatic.vcf.gz")).unwrap()
    }

    #[test]
    fn variant_stems() {
        assert_eq!(variant_file_stem(Path::new("a/b/somatic.vcf.gz")), "somatic");
        assert_eq!(variant_file_stem(Path::new("somatic.vcf")), "somatic");
        assert_eq!(variant_file_stem(Path::new("snvs.tsv")), "snvs");
    }

    #[test]
    fn region_dir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let dir = writer.region_dir("chr1", 1000, 1, 2000).unwrap();
        assert!(dir.ends_with("somatic/chr1_1000/chr1_1_2000"));
        assert!(dir.join("reads").is_dir());
        assert!(dir.join("methylation").is_dir());
        assert!(dir.join("clustering").is_dir());
    }

    #[test]
    fn metadata_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let dir = writer.region_dir("chr1", 1000, 1, 2000).unwrap();
        let result = RegionResult {
            num_reads: 2,
            num_cpgs: 5,
            num_forward_reads: 1,
            num_reverse_reads: 1,
            ..RegionResult::default()
        };
        writer
            .write_metadata(&dir, &snv(), "chr1", 7, 1, 2000, &result, 12.3)
            .unwrap();
        let text = fs::read_to_string(dir.join("metadata.txt")).unwrap();
        assert!(text.contains("Region ID: 7"));
        assert!(text.contains("Region: chr1:1-2000"));
        assert!(text.contains("SNV Position: chr1:1000"));
        assert!(text.contains("SNV: C -> T"));
        assert!(text.contains("Matrix Dimensions: 2 x 5"));
        assert!(text.contains("Processing Time: 12.30 ms"));
    }

    #[test]
    fn reads_tsv_columns() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let dir = writer.region_dir("chr1", 1000, 1, 2000).unwrap();
        writer.write_reads(&dir, &reads(), "chr1").unwrap();
        let text = fs::read_to_string(dir.join("reads/reads.tsv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "read_id\tread_name\tchr\tstart\tend\tmapq\thp\talt_support\tis_tumor\tstrand"
        );
        assert_eq!(lines.next().unwrap(), "0\tm0/1\tchr1\t500\t1500\t60\t1\tALT\t1\t+");
        assert_eq!(lines.next().unwrap(), "1\tm1\tchr1\t600\t1600\t55\t0\tREF\t0\t-");
    }

    #[test]
    fn methylation_csv_marks_missing_as_na() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let dir = writer.region_dir("chr1", 1000, 1, 2000).unwrap();

        let mut builder = crate::snvmeth::matrix::MatrixBuilder::new(0.2, 0.8);
        let mut rs = reads();
        builder
            .add_read(
                rs.remove(0),
                vec![crate::snvmeth::methylation::MethCall { pos: 900, prob: 0.9 }],
            )
            .unwrap();
        builder
            .add_read(
                rs.remove(0),
                vec![crate::snvmeth::methylation::MethCall { pos: 950, prob: 0.1 }],
            )
            .unwrap();
        let matrix = builder.finalize().clone();

        writer.write_matrix(&dir, &matrix).unwrap();
        let text = fs::read_to_string(dir.join("methylation/methylation.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "read_id,900,950");
        assert_eq!(lines[1], "0,0.9000,NA");
        assert_eq!(lines[2], "1,NA,0.1000");

        writer
            .write_strand_matrices(&dir, &reads(), &matrix)
            .unwrap();
        let fwd = fs::read_to_string(dir.join("methylation/methylation_forward.csv")).unwrap();
        let fwd_lines: Vec<&str> = fwd.lines().collect();
        assert_eq!(fwd_lines[0], "read_id,original_read_id,900,950");
        assert_eq!(fwd_lines[1], "0,0,0.9000,NA");
        assert_eq!(fwd_lines.len(), 2);
        let rev = fs::read_to_string(dir.join("methylation/methylation_reverse.csv")).unwrap();
        assert!(rev.lines().nth(1).unwrap().starts_with("0,1,"));
    }

    #[test]
    fn distance_csv_and_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let dir = writer.region_dir("chr1", 1000, 1, 2000).unwrap();

        let matrix = crate::snvmeth::matrix::MethylationMatrix::from_binary_rows(&[
            vec![1, 1, 0, 0],
            vec![1, 0, 0, 1],
            vec![0, 0, 1, 1],
        ]);
        let dist = DistanceMatrix::compute(
            &matrix,
            &DistanceConfig {
                metric: DistanceMetric::Nhd,
                min_common_coverage: 2,
                ..DistanceConfig::default()
            },
        );

        writer.write_distance_matrix(&dir, &dist, None).unwrap();
        writer.write_distance_stats(&dir, &dist).unwrap();

        let csv = fs::read_to_string(dir.join("distance_nhd.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "read_id,0,1,2");
        assert!(lines[1].starts_with("0,0.000000,0.500000,"));
        assert_eq!(lines.len(), 4);

        let stats = fs::read_to_string(dir.join("distance_nhd_stats.txt")).unwrap();
        assert!(stats.contains("Valid pairs: 3"));
        assert!(stats.contains("Metric: NHD"));
        assert!(stats.contains("Median:"));
    }

    #[test]
    fn filtered_reads_list_reason_names() {
        use crate::snvmeth::read::FilterReason;
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let dir = writer.region_dir("chr1", 1000, 1, 2000).unwrap();

        let filtered = vec![FilteredRead {
            read_name: "bad_read".into(),
            align_start: 10,
            align_end: 20,
            mapq: 3,
            strand: Strand::Forward,
            is_tumor: true,
            reasons: FilterReason::LOW_MAPQ | FilterReason::SHORT_READ,
        }];
        writer
            .write_filtered_reads(&dir, "chr1", &filtered)
            .unwrap();
        let text = fs::read_to_string(dir.join("filtered_reads.tsv")).unwrap();
        assert!(text.contains("bad_read\tchr1\t10\t20\t3\t+\t1\tLOW_MAPQ,SHORT_READ"));
    }
}
