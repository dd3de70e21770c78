use crate::cli::CutArgs;
use crate::snvmeth::tree::Tree;
use crate::utils::Result;
use std::fs;
use std::io::Write;

/// Re-parses an emitted Newick tree and writes flat cluster assignments.
pub fn cut(args: CutArgs) -> Result<()> {
    let text = fs::read_to_string(&args.tree_path)
        .map_err(|e| format!("Failed to read {}: {}", args.tree_path.display(), e))?;
    let tree = Tree::from_newick(&text)?;
    if tree.is_empty() {
        return Err(format!("Tree is empty: {}", args.tree_path.display()));
    }

    let labels = match (args.distance, args.num_clusters) {
        (Some(distance), _) => tree.cut_by_distance(distance),
        (None, Some(num_clusters)) => tree.cut_by_num_clusters(num_clusters),
        (None, None) => unreachable!("clap enforces one cut point"),
    };

    let names = tree.leaf_labels_in_order();
    let num_clusters = labels.iter().max().map_or(0, |m| m + 1);
    log::info!(
        "Cut tree with {} leaves into {} clusters",
        names.len(),
        num_clusters
    );

    let mut out = String::from("read_name\tcluster\n");
    for (name, label) in names.iter().zip(&labels) {
        out.push_str(&format!("{}\t{}\n", name, label));
    }

    match &args.output {
        Some(path) => fs::write(path, out)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?,
        None => {
            std::io::stdout()
                .write_all(out.as_bytes())
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CutArgs;

    fn args(tree_path: std::path::PathBuf, distance: Option<f64>, k: Option<usize>) -> CutArgs {
        CutArgs {
            tree_path,
            distance,
            num_clusters: k,
            output: None,
        }
    }

    #[test]
    fn cut_written_tree_by_distance() {
        let dir = tempfile::tempdir().unwrap();
        let tree_path = dir.path().join("tree.nwk");
        std::fs::write(
            &tree_path,
            "((A:1.000000,B:1.000000):1.500000,(C:1.000000,D:1.000000):1.500000);\n",
        )
        .unwrap();
        let out_path = dir.path().join("clusters.tsv");
        let mut cut_args = args(tree_path, Some(3.0), None);
        cut_args.output = Some(out_path.clone());
        cut(cut_args).unwrap();

        let text = std::fs::read_to_string(&out_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "read_name\tcluster");
        assert_eq!(lines[1], "A\t0");
        assert_eq!(lines[2], "B\t0");
        assert_eq!(lines[3], "C\t1");
        assert_eq!(lines[4], "D\t1");
    }

    #[test]
    fn missing_tree_is_an_error() {
        let result = cut(args("/nonexistent/tree.nwk".into(), Some(1.0), None));
        assert!(result.is_err());
    }
}
