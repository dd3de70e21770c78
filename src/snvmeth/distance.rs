use crate::snvmeth::matrix::MethylationMatrix;
use crate::snvmeth::read::{ParsedRead, Strand};
use clap::ValueEnum;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::fmt;

/// Pairwise read-distance metrics over the methylation matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DistanceMetric {
    /// Normalized Hamming distance over binary calls
    #[value(alias = "hamming")]
    Nhd,
    /// Mean absolute difference of probabilities
    #[value(alias = "manhattan")]
    L1,
    /// Root mean squared difference of probabilities
    #[value(alias = "euclidean")]
    L2,
    /// Normalized Pearson correlation distance
    #[value(alias = "correlation", alias = "pearson")]
    Corr,
    /// Jaccard distance over methylated site sets
    Jaccard,
    /// Confidence-weighted expected disagreement
    Bernoulli,
}

impl DistanceMetric {
    pub fn name(self) -> &'static str {
        match self {
            DistanceMetric::Nhd => "NHD",
            DistanceMetric::L1 => "L1",
            DistanceMetric::L2 => "L2",
            DistanceMetric::Corr => "CORR",
            DistanceMetric::Jaccard => "JACCARD",
            DistanceMetric::Bernoulli => "BERNOULLI",
        }
    }

    /// Lowercase name used in output file names.
    pub fn file_tag(self) -> String {
        self.name().to_ascii_lowercase()
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What to store for pairs whose common coverage is below the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NanStrategy {
    /// Substitute the configured maximum distance
    MaxDist,
    /// Leave the cell as NaN
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct DistanceConfig {
    pub metric: DistanceMetric,
    pub min_common_coverage: usize,
    pub nan_strategy: NanStrategy,
    pub max_distance_value: f64,
    pub pearson_center: bool,
    pub jaccard_include_unmeth: bool,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        DistanceConfig {
            metric: DistanceMetric::Nhd,
            min_common_coverage: 3,
            nan_strategy: NanStrategy::MaxDist,
            max_distance_value: 1.0,
            pearson_center: true,
            jaccard_include_unmeth: false,
        }
    }
}

/// Symmetric pairwise distance matrix with zero diagonal and pair statistics.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    pub metric: DistanceMetric,
    pub min_common_coverage: usize,
    /// Row/column labels: region-local read ids of the included rows.
    pub read_ids: Vec<usize>,
    values: Vec<f64>,
    n: usize,
    pub valid_pairs: usize,
    pub invalid_pairs: usize,
    pub mean_common_coverage: f64,
}

impl DistanceMatrix {
    pub fn size(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }

    /// Computes the full matrix over every row of the methylation matrix.
    pub fn compute(matrix: &MethylationMatrix, config: &DistanceConfig) -> Self {
        let all_rows: Vec<usize> = (0..matrix.n_reads).collect();
        Self::compute_subset(matrix, &all_rows, config)
    }

    /// Computes the matrix restricted to `rows` (indices into the
    /// methylation matrix, which also serve as read ids).
    ///
    /// Every unordered pair is evaluated once in the upper triangle and
    /// mirrored; the pair loop fans out over the rayon pool.
    pub fn compute_subset(
        matrix: &MethylationMatrix,
        rows: &[usize],
        config: &DistanceConfig,
    ) -> Self {
        let n = rows.len();
        let mut result = DistanceMatrix {
            metric: config.metric,
            min_common_coverage: config.min_common_coverage,
            read_ids: rows.to_vec(),
            values: vec![0.0; n * n],
            n,
            valid_pairs: 0,
            invalid_pairs: 0,
            mean_common_coverage: 0.0,
        };
        if n < 2 {
            return result;
        }

        let invalid_value = match config.nan_strategy {
            NanStrategy::MaxDist => config.max_distance_value,
            NanStrategy::Skip => f64::NAN,
        };

        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();

        let computed: Vec<(usize, usize, Option<f64>, usize)> = pairs
            .into_par_iter()
            .map(|(i, j)| {
                let (dist, common) = pair_distance(matrix, rows[i], rows[j], config);
                (i, j, dist, common)
            })
            .collect();

        let mut total_common = 0usize;
        for (i, j, dist, common) in computed {
            let value = match dist {
                Some(d) => {
                    result.valid_pairs += 1;
                    total_common += common;
                    d
                }
                None => {
                    result.invalid_pairs += 1;
                    invalid_value
                }
            };
            result.values[i * n + j] = value;
            result.values[j * n + i] = value;
        }

        if result.valid_pairs > 0 {
            result.mean_common_coverage = total_common as f64 / result.valid_pairs as f64;
        }
        result
    }

    /// Upper-triangle distances that are not NaN, for summary statistics.
    pub fn valid_distances(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for i in 0..self.n {
            for j in (i + 1)..self.n {
                let d = self.get(i, j);
                if !d.is_nan() {
                    out.push(d);
                }
            }
        }
        out
    }
}

/// Row indices partitioned by strand; unknown-strand reads belong to neither.
pub fn strand_indices(reads: &[ParsedRead]) -> (Vec<usize>, Vec<usize>) {
    let mut forward = Vec::new();
    let mut reverse = Vec::new();
    for (i, read) in reads.iter().enumerate() {
        match read.strand {
            Strand::Forward => forward.push(i),
            Strand::Reverse => reverse.push(i),
            Strand::Unknown => {}
        }
    }
    (forward, reverse)
}

/// Distance between two rows under the configured metric.
///
/// Returns `(None, common)` when the pair is invalid: common coverage below
/// the minimum, or the metric undefined on the overlap.
pub fn pair_distance(
    matrix: &MethylationMatrix,
    row_i: usize,
    row_j: usize,
    config: &DistanceConfig,
) -> (Option<f64>, usize) {
    let min_cov = config.min_common_coverage;
    match config.metric {
        DistanceMetric::Nhd => nhd(matrix.binary_row(row_i), matrix.binary_row(row_j), min_cov),
        DistanceMetric::L1 => l1(matrix.raw_row(row_i), matrix.raw_row(row_j), min_cov),
        DistanceMetric::L2 => l2(matrix.raw_row(row_i), matrix.raw_row(row_j), min_cov),
        DistanceMetric::Corr => corr(
            matrix.raw_row(row_i),
            matrix.raw_row(row_j),
            min_cov,
            config.pearson_center,
        ),
        DistanceMetric::Jaccard => jaccard(
            matrix.binary_row(row_i),
            matrix.binary_row(row_j),
            min_cov,
            config.jaccard_include_unmeth,
        ),
        DistanceMetric::Bernoulli => {
            bernoulli(matrix.raw_row(row_i), matrix.raw_row(row_j), min_cov)
        }
    }
}

/// Normalized Hamming distance: disagreement fraction over common binary
/// calls.
fn nhd(row_i: &[i8], row_j: &[i8], min_cov: usize) -> (Option<f64>, usize) {
    let mut common = 0usize;
    let mut diff = 0usize;
    for (&a, &b) in row_i.iter().zip(row_j) {
        if a != -1 && b != -1 {
            common += 1;
            if a != b {
                diff += 1;
            }
        }
    }
    if common < min_cov {
        return (None, common);
    }
    (Some(diff as f64 / common as f64), common)
}

fn l1(row_i: &[f64], row_j: &[f64], min_cov: usize) -> (Option<f64>, usize) {
    let mut common = 0usize;
    let mut sum = 0.0;
    for (&a, &b) in row_i.iter().zip(row_j) {
        if !a.is_nan() && !b.is_nan() {
            common += 1;
            sum += (a - b).abs();
        }
    }
    if common < min_cov {
        return (None, common);
    }
    (Some(sum / common as f64), common)
}

fn l2(row_i: &[f64], row_j: &[f64], min_cov: usize) -> (Option<f64>, usize) {
    let mut common = 0usize;
    let mut sum_sq = 0.0;
    for (&a, &b) in row_i.iter().zip(row_j) {
        if !a.is_nan() && !b.is_nan() {
            common += 1;
            let d = a - b;
            sum_sq += d * d;
        }
    }
    if common < min_cov {
        return (None, common);
    }
    (Some((sum_sq / common as f64).sqrt()), common)
}

/// Pearson correlation distance `(1 - r) / 2`, normalized to [0, 1].
///
/// Needs at least three common sites for a meaningful correlation; a
/// zero-variance row makes the pair maximally distant rather than invalid.
fn corr(row_i: &[f64], row_j: &[f64], min_cov: usize, center: bool) -> (Option<f64>, usize) {
    let mut vals_i = Vec::new();
    let mut vals_j = Vec::new();
    for (&a, &b) in row_i.iter().zip(row_j) {
        if !a.is_nan() && !b.is_nan() {
            vals_i.push(a);
            vals_j.push(b);
        }
    }
    let common = vals_i.len();
    if common < min_cov || common < 3 {
        return (None, common);
    }

    let mean_i = vals_i.iter().sum::<f64>() / common as f64;
    let mean_j = vals_j.iter().sum::<f64>() / common as f64;

    let mut sum_prod = 0.0;
    let mut sum_sq_i = 0.0;
    let mut sum_sq_j = 0.0;
    for k in 0..common {
        let di = if center { vals_i[k] - mean_i } else { vals_i[k] };
        let dj = if center { vals_j[k] - mean_j } else { vals_j[k] };
        sum_prod += di * dj;
        sum_sq_i += di * di;
        sum_sq_j += dj * dj;
    }

    const VAR_EPSILON: f64 = 1e-10;
    if sum_sq_i < VAR_EPSILON || sum_sq_j < VAR_EPSILON {
        return (Some(1.0), common);
    }

    let r = (sum_prod / (sum_sq_i.sqrt() * sum_sq_j.sqrt())).clamp(-1.0, 1.0);
    (Some((1.0 - r) / 2.0), common)
}

/// Jaccard distance over methylated columns; an empty union means the reads
/// are indistinguishable and yields zero distance.
fn jaccard(
    row_i: &[i8],
    row_j: &[i8],
    min_cov: usize,
    include_unmeth: bool,
) -> (Option<f64>, usize) {
    let mut common = 0usize;
    let mut intersection = 0usize;
    let mut union_size = 0usize;
    for (&a, &b) in row_i.iter().zip(row_j) {
        if a == -1 || b == -1 {
            continue;
        }
        common += 1;
        if include_unmeth {
            if a == b {
                intersection += 1;
            }
            union_size += 1;
        } else {
            let in_i = a == 1;
            let in_j = b == 1;
            if in_i || in_j {
                union_size += 1;
                if in_i && in_j {
                    intersection += 1;
                }
            }
        }
    }
    if common < min_cov {
        return (None, common);
    }
    if union_size == 0 {
        return (Some(0.0), common);
    }
    (
        Some(1.0 - intersection as f64 / union_size as f64),
        common,
    )
}

/// Confidence-weighted expected disagreement.
///
/// `delta = p(1-q) + (1-p)q` weighted by `2|p-0.5| * 2|q-0.5|`; sites near
/// 0.5 carry almost no weight, and a pair whose total weight vanishes is
/// invalid.
fn bernoulli(row_i: &[f64], row_j: &[f64], min_cov: usize) -> (Option<f64>, usize) {
    const WEIGHT_EPSILON: f64 = 1e-9;
    let mut common = 0usize;
    let mut sum_weighted = 0.0;
    let mut sum_weights = 0.0;
    for (&p, &q) in row_i.iter().zip(row_j) {
        if !p.is_nan() && !q.is_nan() {
            common += 1;
            let w = (2.0 * (p - 0.5).abs()) * (2.0 * (q - 0.5).abs());
            let delta = p * (1.0 - q) + (1.0 - p) * q;
            sum_weighted += w * delta;
            sum_weights += w;
        }
    }
    if common < min_cov || sum_weights < WEIGHT_EPSILON {
        return (None, common);
    }
    (Some(sum_weighted / sum_weights), common)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snvmeth::matrix::MethylationMatrix;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    // The 4x5 binary matrix used throughout: '-' is missing.
    //   row 0: 1 1 0 0 -
    //   row 1: 1 0 0 - -
    //   row 2: 0 0 1 1 1
    //   row 3: - - 1 1 1
    fn binary_fixture() -> MethylationMatrix {
        MethylationMatrix::from_binary_rows(&[
            vec![1, 1, 0, 0, -1],
            vec![1, 0, 0, -1, -1],
            vec![0, 0, 1, 1, 1],
            vec![-1, -1, 1, 1, 1],
        ])
    }

    fn config(metric: DistanceMetric, min_cov: usize) -> DistanceConfig {
        DistanceConfig {
            metric,
            min_common_coverage: min_cov,
            ..DistanceConfig::default()
        }
    }

    #[test]
    fn nhd_on_binary_fixture() {
        let matrix = binary_fixture();
        let dist = DistanceMatrix::compute(&matrix, &config(DistanceMetric::Nhd, 2));

        assert!((dist.get(0, 1) - 1.0 / 3.0).abs() < 1e-9);
        assert!((dist.get(0, 2) - 1.0).abs() < 1e-9);
        assert!((dist.get(2, 3) - 0.0).abs() < 1e-9);
        // Symmetric with zero diagonal
        for i in 0..4 {
            assert_eq!(dist.get(i, i), 0.0);
            for j in 0..4 {
                assert_eq!(dist.get(i, j), dist.get(j, i));
            }
        }
    }

    #[test]
    fn min_common_coverage_gates_pairs() {
        let matrix = binary_fixture();
        let dist = DistanceMatrix::compute(&matrix, &config(DistanceMetric::Nhd, 4));

        // Rows 0 and 1 share only 3 sites: substituted with MAX_DIST
        assert!((dist.get(0, 1) - 1.0).abs() < 1e-9);
        // Rows 0 and 2 share 4 sites, all disagreeing
        assert!((dist.get(0, 2) - 1.0).abs() < 1e-9);
        assert!(dist.invalid_pairs > 0);
    }

    #[test]
    fn coverage_boundary_is_inclusive() {
        let matrix = binary_fixture();
        // Rows 0 and 1 share exactly 3 sites
        let at_limit = pair_distance(&matrix, 0, 1, &config(DistanceMetric::Nhd, 3));
        assert!(at_limit.0.is_some());
        assert_eq!(at_limit.1, 3);
        let over_limit = pair_distance(&matrix, 0, 1, &config(DistanceMetric::Nhd, 4));
        assert!(over_limit.0.is_none());
    }

    #[test]
    fn skip_strategy_leaves_nan() {
        let matrix = binary_fixture();
        let cfg = DistanceConfig {
            nan_strategy: NanStrategy::Skip,
            ..config(DistanceMetric::Nhd, 4)
        };
        let dist = DistanceMatrix::compute(&matrix, &cfg);
        assert!(dist.get(0, 1).is_nan());
    }

    #[test]
    fn pair_count_invariant() {
        let matrix = binary_fixture();
        let dist = DistanceMatrix::compute(&matrix, &config(DistanceMetric::Nhd, 4));
        let n = dist.size();
        assert_eq!(dist.valid_pairs + dist.invalid_pairs, n * (n - 1) / 2);
    }

    #[test]
    fn strand_split_matches_fixture() {
        use crate::snvmeth::read::{AltSupport, ParsedRead};
        let matrix = binary_fixture();
        let reads: Vec<ParsedRead> = [Strand::Forward, Strand::Forward, Strand::Reverse, Strand::Reverse]
            .iter()
            .enumerate()
            .map(|(i, &strand)| ParsedRead {
                read_id: i,
                read_name: format!("r{}", i),
                chr_id: 0,
                align_start: 0,
                align_end: 10,
                mapq: 60,
                strand,
                hp_tag: "0".into(),
                is_tumor: true,
                alt_support: AltSupport::Unknown,
            })
            .collect();

        let (fwd, rev) = strand_indices(&reads);
        assert_eq!(fwd, vec![0, 1]);
        assert_eq!(rev, vec![2, 3]);

        let cfg = config(DistanceMetric::Nhd, 2);
        let fwd_dist = DistanceMatrix::compute_subset(&matrix, &fwd, &cfg);
        let rev_dist = DistanceMatrix::compute_subset(&matrix, &rev, &cfg);
        assert_eq!(fwd_dist.size(), 2);
        assert!((fwd_dist.get(0, 1) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(rev_dist.size(), 2);
        assert!((rev_dist.get(0, 1) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_strand_is_excluded_from_both() {
        use crate::snvmeth::read::{AltSupport, ParsedRead};
        let reads = vec![ParsedRead {
            read_id: 0,
            read_name: "r0".into(),
            chr_id: 0,
            align_start: 0,
            align_end: 10,
            mapq: 60,
            strand: Strand::Unknown,
            hp_tag: "0".into(),
            is_tumor: true,
            alt_support: AltSupport::Unknown,
        }];
        let (fwd, rev) = strand_indices(&reads);
        assert!(fwd.is_empty());
        assert!(rev.is_empty());
    }

    #[test]
    fn l1_and_l2_on_raw_rows() {
        let rows_i = [0.0, 0.5, 1.0, f64::NAN];
        let rows_j = [1.0, 0.5, 0.0, 0.2];
        let (d1, c1) = l1(&rows_i, &rows_j, 2);
        assert_eq!(c1, 3);
        assert!((d1.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        let (d2, _) = l2(&rows_i, &rows_j, 2);
        assert!((d2.unwrap() - (2.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn identical_rows_have_zero_distance() {
        let row = [0.9, 0.1, 0.8, 0.05];
        assert_eq!(l1(&row, &row, 2).0, Some(0.0));
        assert_eq!(l2(&row, &row, 2).0, Some(0.0));
        let binary = [1i8, 0, 1, 0];
        assert_eq!(nhd(&binary, &binary, 2).0, Some(0.0));
        assert_eq!(jaccard(&binary, &binary, 2, false).0, Some(0.0));
    }

    #[test]
    fn correlation_requires_three_common_sites() {
        let a = [0.1, 0.9, f64::NAN, f64::NAN];
        let b = [0.2, 0.8, f64::NAN, f64::NAN];
        let (d, common) = corr(&a, &b, 1, true);
        assert_eq!(common, 2);
        assert!(d.is_none());
    }

    #[test]
    fn correlation_zero_variance_is_max_distance() {
        let constant = [0.5, 0.5, 0.5, 0.5];
        let varying = [0.1, 0.9, 0.2, 0.8];
        assert_eq!(corr(&constant, &varying, 3, true).0, Some(1.0));
        assert_eq!(corr(&constant, &constant, 3, true).0, Some(1.0));
    }

    #[test]
    fn correlation_is_normalized_to_unit_range() {
        let a = [0.1, 0.5, 0.9, 0.3];
        let b = [0.9, 0.5, 0.1, 0.7]; // perfectly anti-correlated
        let (d, _) = corr(&a, &b, 3, true);
        assert!((d.unwrap() - 1.0).abs() < 1e-9);
        let (d_same, _) = corr(&a, &a, 3, true);
        assert!(d_same.unwrap().abs() < 1e-9);
    }

    #[test]
    fn jaccard_empty_union_is_identical() {
        let a = [0i8, 0, 0, -1];
        let b = [0i8, 0, 0, 0];
        assert_eq!(jaccard(&a, &b, 2, false).0, Some(0.0));
        // Including unmethylated sites makes them share every column
        assert_eq!(jaccard(&a, &b, 2, true).0, Some(0.0));
    }

    #[test]
    fn jaccard_partial_overlap() {
        let a = [1i8, 1, 0, 0];
        let b = [1i8, 0, 1, 0];
        // union {0,1,2}, intersection {0}
        let (d, common) = jaccard(&a, &b, 2, false);
        assert_eq!(common, 4);
        assert!((d.unwrap() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn bernoulli_weights_down_uncertain_sites() {
        // Confident disagreement
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let (d, _) = bernoulli(&a, &b, 1);
        assert!((d.unwrap() - 1.0).abs() < 1e-9);

        // All sites at 0.5 carry no weight at all
        let c = [0.5, 0.5];
        assert!(bernoulli(&c, &c, 1).0.is_none());
    }

    #[test]
    fn bernoulli_confident_agreement_is_near_zero() {
        let a = [0.99, 0.01, 0.95];
        let (d, _) = bernoulli(&a, &a, 2);
        assert!(d.unwrap() < 0.1);
    }

    #[test]
    fn all_metrics_stay_in_unit_range_on_random_input() {
        let mut rng = StdRng::seed_from_u64(7);
        let n_sites = 24;
        let rows: Vec<Vec<i8>> = (0..6)
            .map(|_| {
                (0..n_sites)
                    .map(|_| match rng.random_range(0..4) {
                        0 => -1,
                        1 => 0,
                        _ => 1,
                    })
                    .collect()
            })
            .collect();
        let matrix = MethylationMatrix::from_binary_rows(&rows);

        for metric in [
            DistanceMetric::Nhd,
            DistanceMetric::L1,
            DistanceMetric::L2,
            DistanceMetric::Corr,
            DistanceMetric::Jaccard,
            DistanceMetric::Bernoulli,
        ] {
            let dist = DistanceMatrix::compute(&matrix, &config(metric, 2));
            let n = dist.size();
            assert_eq!(dist.valid_pairs + dist.invalid_pairs, n * (n - 1) / 2);
            for i in 0..n {
                assert_eq!(dist.get(i, i), 0.0);
                for j in 0..n {
                    let d = dist.get(i, j);
                    assert!(
                        (0.0..=1.0).contains(&d),
                        "{} out of range for {:?}",
                        d,
                        metric
                    );
                    assert_eq!(dist.get(i, j), dist.get(j, i));
                }
            }
        }
    }

    #[test]
    fn recomputation_is_identical() {
        let matrix = binary_fixture();
        let cfg = config(DistanceMetric::Nhd, 2);
        let first = DistanceMatrix::compute(&matrix, &cfg);
        let second = DistanceMatrix::compute(&matrix, &cfg);
        for i in 0..first.size() {
            for j in 0..first.size() {
                assert_eq!(first.get(i, j), second.get(i, j));
            }
        }
        assert_eq!(first.valid_pairs, second.valid_pairs);
    }

    #[test]
    fn single_row_matrix_is_all_zero_diagonal() {
        let matrix = MethylationMatrix::from_binary_rows(&[vec![1, 0, 1]]);
        let dist = DistanceMatrix::compute(&matrix, &config(DistanceMetric::Nhd, 2));
        assert_eq!(dist.size(), 1);
        assert_eq!(dist.get(0, 0), 0.0);
        assert_eq!(dist.valid_pairs + dist.invalid_pairs, 0);
    }

    #[test]
    fn empty_matrix_yields_empty_distance() {
        let matrix = MethylationMatrix::default();
        let dist = DistanceMatrix::compute(&matrix, &config(DistanceMetric::Nhd, 2));
        assert!(dist.is_empty());
    }

    #[test]
    fn all_missing_rows_hit_max_dist() {
        let matrix = MethylationMatrix::from_binary_rows(&[
            vec![-1, -1, -1],
            vec![-1, -1, -1],
        ]);
        let dist = DistanceMatrix::compute(&matrix, &config(DistanceMetric::Nhd, 1));
        assert!((dist.get(0, 1) - 1.0).abs() < 1e-9);
        assert_eq!(dist.invalid_pairs, 1);
    }
}
