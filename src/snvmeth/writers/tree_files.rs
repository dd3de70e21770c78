use crate::snvmeth::tree::Tree;
use crate::utils::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub fn write_newick(tree: &Tree, path: &Path) -> Result<()> {
    let mut file = create(path)?;
    writeln!(file, "{}", tree.to_newick()).map_err(|e| write_error(path, e))
}

/// Merge records in scipy linkage order: one row per merge.
pub fn write_linkage_matrix(tree: &Tree, path: &Path) -> Result<()> {
    let mut file = create(path)?;
    writeln!(file, "cluster_i,cluster_j,distance,new_cluster_id,size")
        .map_err(|e| write_error(path, e))?;
    for record in tree.merge_records() {
        writeln!(
            file,
            "{},{},{:.6},{},{}",
            record.cluster_i, record.cluster_j, record.distance, record.new_cluster_id, record.size
        )
        .map_err(|e| write_error(path, e))?;
    }
    Ok(())
}

/// Leaf labels in the tree's in-order traversal, one per line.
pub fn write_leaf_order(tree: &Tree, path: &Path) -> Result<()> {
    let mut file = create(path)?;
    for label in tree.leaf_labels_in_order() {
        writeln!(file, "{}", label).map_err(|e| write_error(path, e))?;
    }
    Ok(())
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
    use crate::snvmeth::tree::MergeRecord;

    fn small_tree() -> Tree {
        let mut tree = Tree::new();
        let a = tree.add_leaf(0, "readA");
        let b = tree.add_leaf(1, "readB");
        let root = tree.add_internal(a, b, 0.5);
        tree.set_root(root);
        tree.set_merge_records(vec![MergeRecord {
            cluster_i: 0,
            cluster_j: 1,
            distance: 1.0,
            new_cluster_id: 2,
            size: 2,
        }]);
        tree
    }

    #[test]
    fn newick_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.nwk");
        let tree = small_tree();
        write_newick(&tree, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed = Tree::from_newick(&text).unwrap();
        assert_eq!(parsed.leaf_labels_in_order(), vec!["readA", "readB"]);
    }

    #[test]
    fn linkage_matrix_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkage_matrix.csv");
        write_linkage_matrix(&small_tree(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "cluster_i,cluster_j,distance,new_cluster_id,size"
        );
        assert_eq!(lines.next().unwrap(), "0,1,1.000000,2,2");
    }

    #[test]
    fn leaf_order_lists_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf_order.txt");
        write_leaf_order(&small_tree(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "readA\nreadB\n");
    }
}
