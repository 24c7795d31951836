//! Legacy VTK (`.vtk`) writer for the locally relevant active cells.
//!
//! Writes an ASCII `UNSTRUCTURED_GRID` with every vertex of the local
//! hierarchy and one quadrilateral or hexahedron per locally owned or ghost
//! active cell. Owner rank and refinement level travel as `FIELD` arrays on
//! the cells.

use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::CellTree;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const FIELD_SUBDOMAIN: &str = "mesh_forest:subdomain";
const FIELD_LEVEL: &str = "mesh_forest:level";

/// Lexicographic corner numbering to VTK corner numbering.
const QUAD_ORDER: [usize; 4] = [0, 1, 3, 2];
const HEX_ORDER: [usize; 8] = [0, 1, 3, 2, 4, 5, 7, 6];

#[derive(Debug, Default, Clone)]
pub struct VtkWriter {
    /// Include ghost cells (owned by other ranks) in the output.
    pub include_ghosts: bool,
}

impl VtkWriter {
    fn vtk_cell_type(dim: usize) -> Option<(i32, &'static [usize])> {
        match dim {
            2 => Some((9, &QUAD_ORDER)),
            3 => Some((12, &HEX_ORDER)),
            _ => None,
        }
    }

    fn write_field_array<W: Write>(
        writer: &mut W,
        name: &str,
        num_components: usize,
        num_tuples: usize,
        data_type: &str,
        values: &[String],
    ) -> std::io::Result<()> {
        writeln!(writer, "{name} {num_components} {num_tuples} {data_type}")?;
        let mut line_len = 0usize;
        for value in values {
            if line_len + value.len() + 1 > 70 {
                writeln!(writer)?;
                line_len = 0;
            }
            if line_len > 0 {
                write!(writer, " ")?;
                line_len += 1;
            }
            write!(writer, "{value}")?;
            line_len += value.len();
        }
        writeln!(writer)?;
        Ok(())
    }

    /// Write `cells` to `writer`.
    pub fn write<const D: usize, W: Write>(&self, mut writer: W, cells: &CellTree<D>) -> std::io::Result<()> {
        let Some((vtk_type, order)) = Self::vtk_cell_type(D) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no VTK cell type for dimension {D}"),
            ));
        };
        let selected: Vec<_> = cells
            .active_cells()
            .into_iter()
            .filter_map(|id| cells.get(id))
            .filter(|c| c.is_locally_owned() || (self.include_ghosts && c.is_ghost()))
            .collect();

        writeln!(writer, "# vtk DataFile Version 3.0")?;
        writeln!(writer, "mesh-forest")?;
        writeln!(writer, "ASCII")?;
        writeln!(writer, "DATASET UNSTRUCTURED_GRID")?;
        let points = cells.vertex_positions();
        writeln!(writer, "POINTS {} double", points.len())?;
        for p in points {
            let x = |a: usize| p.get(a).copied().unwrap_or(0.0);
            writeln!(writer, "{} {} {}", x(0), x(1), x(2))?;
        }

        let n_corners = order.len();
        writeln!(writer, "CELLS {} {}", selected.len(), selected.len() * (n_corners + 1))?;
        for cell in &selected {
            write!(writer, "{n_corners}")?;
            for &c in order {
                write!(writer, " {}", cell.vertex_index(c))?;
            }
            writeln!(writer)?;
        }
        writeln!(writer, "CELL_TYPES {}", selected.len())?;
        for _ in &selected {
            writeln!(writer, "{vtk_type}")?;
        }

        writeln!(writer, "CELL_DATA {}", selected.len())?;
        writeln!(writer, "FIELD FieldData 2")?;
        let subdomains: Vec<String> = selected
            .iter()
            .map(|c| c.subdomain_id().map_or(-1, |s| s as i64).to_string())
            .collect();
        Self::write_field_array(&mut writer, FIELD_SUBDOMAIN, 1, selected.len(), "long", &subdomains)?;
        let levels: Vec<String> = selected.iter().map(|c| c.level().to_string()).collect();
        Self::write_field_array(&mut writer, FIELD_LEVEL, 1, selected.len(), "int", &levels)?;
        writer.flush()
    }
}

/// Write the locally owned active cells of `cells` to `path`.
pub fn write_cells<const D: usize>(path: &Path, cells: &CellTree<D>) -> Result<(), MeshForestError> {
    let file = File::create(path).map_err(|e| MeshForestError::io(path, e))?;
    VtkWriter::default()
        .write(BufWriter::new(file), cells)
        .map_err(|e| MeshForestError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::quadrant::Quadrant;
    use crate::topology::coarse_mesh::CoarseMesh;

    fn refined_square(owner: u32) -> CellTree<2> {
        let mesh = CoarseMesh::<2>::hyper_cube(1).unwrap();
        let mut cells = CellTree::new(&mesh, &[0], owner);
        let leaves: Vec<_> = Quadrant::<2>::root(0)
            .children()
            .into_iter()
            .enumerate()
            .map(|(k, q)| (q, (k / 2) as u32))
            .collect();
        cells.sync_from_leaves(&leaves).unwrap();
        cells
    }

    #[test]
    fn quads_are_written_in_vtk_corner_order() {
        let cells = refined_square(0);
        let mut out = Vec::new();
        VtkWriter::default().write(&mut out, &cells).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("DATASET UNSTRUCTURED_GRID"));
        assert!(text.contains("POINTS 9 double"));
        assert!(text.contains("CELLS 2 10"));
        let first = cells.active_cells()[0];
        let c = cells.get(first).unwrap();
        let expected = format!(
            "4 {} {} {} {}",
            c.vertex_index(0),
            c.vertex_index(1),
            c.vertex_index(3),
            c.vertex_index(2)
        );
        assert!(text.contains(&expected));
        assert!(text.contains("mesh_forest:level 1 2 int\n1 1\n"));
    }

    #[test]
    fn ghosts_are_optional() {
        let cells = refined_square(1);
        let mut out = Vec::new();
        VtkWriter { include_ghosts: true }.write(&mut out, &cells).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("CELLS 4 20"));
        assert!(text.contains("mesh_forest:subdomain 1 4 long\n0 0 1 1\n"));
    }

    #[test]
    fn file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.vtk");
        write_cells(&path, &refined_square(0)).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("# vtk DataFile"));
    }
}
