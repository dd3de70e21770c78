use crate::snvmeth::methylation::MethCall;
use crate::snvmeth::read::ParsedRead;
use crate::utils::Result;
use itertools::Itertools;
use std::collections::HashMap;

/// Read x CpG methylation matrix for one region.
///
/// Rows follow read insertion order; columns are the sorted union of CpG
/// positions across all reads. `raw` holds probabilities with NaN marking
/// missing cells, `binary` holds thresholded calls with -1 for missing or
/// ambiguous cells.
#[derive(Debug, Clone, Default)]
pub struct MethylationMatrix {
    pub n_reads: usize,
    pub n_sites: usize,
    /// 1-based forward-strand C positions, ascending.
    pub cpg_positions: Vec<i64>,
    raw: Vec<f64>,
    binary: Vec<i8>,
}

impl MethylationMatrix {
    pub fn raw_row(&self, row: usize) -> &[f64] {
        &self.raw[row * self.n_sites..(row + 1) * self.n_sites]
    }

    pub fn binary_row(&self, row: usize) -> &[i8] {
        &self.binary[row * self.n_sites..(row + 1) * self.n_sites]
    }

    /// Builds a matrix directly from binary calls; raw cells mirror the
    /// binary ones (missing stays NaN).
    pub fn from_binary_rows(rows: &[Vec<i8>]) -> Self {
        let n_reads = rows.len();
        let n_sites = rows.first().map_or(0, Vec::len);
        let mut raw = Vec::with_capacity(n_reads * n_sites);
        let mut binary = Vec::with_capacity(n_reads * n_sites);
        for row in rows {
            assert_eq!(row.len(), n_sites, "ragged binary rows");
            for &cell in row {
                binary.push(cell);
                raw.push(if cell < 0 { f64::NAN } else { f64::from(cell) });
            }
        }
        MethylationMatrix {
            n_reads,
            n_sites,
            cpg_positions: (1..=n_sites as i64).collect(),
            raw,
            binary,
        }
    }
}

/// Accumulates per-read methylation calls and assembles the region matrix.
#[derive(Debug)]
pub struct MatrixBuilder {
    methyl_low: f64,
    methyl_high: f64,
    reads: Vec<ParsedRead>,
    calls: Vec<Vec<MethCall>>,
    matrix: Option<MethylationMatrix>,
}

impl MatrixBuilder {
    pub fn new(methyl_low: f64, methyl_high: f64) -> Self {
        MatrixBuilder {
            methyl_low,
            methyl_high,
            reads: Vec::new(),
            calls: Vec::new(),
            matrix: None,
        }
    }

    /// Appends a read and its calls, returning the assigned row index.
    pub fn add_read(&mut self, read: ParsedRead, calls: Vec<MethCall>) -> Result<usize> {
        if self.matrix.is_some() {
            return Err("Cannot add reads after finalize()".to_string());
        }
        let read_id = self.reads.len();
        self.reads.push(read);
        self.calls.push(calls);
        Ok(read_id)
    }

    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn reads(&self) -> &[ParsedRead] {
        &self.reads
    }

    /// Assembles the matrix. Idempotent: later calls return the same matrix.
    pub fn finalize(&mut self) -> &MethylationMatrix {
        if self.matrix.is_none() {
            self.matrix = Some(self.build_matrix());
            self.calls.clear();
        }
        self.matrix.as_ref().unwrap()
    }

    pub fn matrix(&self) -> Option<&MethylationMatrix> {
        self.matrix.as_ref()
    }

    fn build_matrix(&self) -> MethylationMatrix {
        let cpg_positions: Vec<i64> = self
            .calls
            .iter()
            .flat_map(|calls| calls.iter().map(|c| c.pos))
            .sorted_unstable()
            .dedup()
            .collect();

        let pos_to_col: HashMap<i64, usize> = cpg_positions
            .iter()
            .enumerate()
            .map(|(col, &pos)| (pos, col))
            .collect();

        let n_reads = self.reads.len();
        let n_sites = cpg_positions.len();
        let mut raw = vec![f64::NAN; n_reads * n_sites];

        for (row, calls) in self.calls.iter().enumerate() {
            for call in calls {
                if let Some(&col) = pos_to_col.get(&call.pos) {
                    raw[row * n_sites + col] = f64::from(call.prob);
                }
            }
        }

        let binary = raw
            .iter()
            .map(|&p| {
                if p.is_nan() {
                    -1
                } else if p >= self.methyl_high {
                    1
                } else if p <= self.methyl_low {
                    0
                } else {
                    -1
                }
            })
            .collect();

        MethylationMatrix {
            n_reads,
            n_sites,
            cpg_positions,
            raw,
            binary,
        }
    }
}
