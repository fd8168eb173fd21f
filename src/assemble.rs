use thiserror::Error;

use crate::geometry::{CytoplasmPolygon, GeometryError, NucleusPoint, OutlinePath};

/// Join key shared by a nucleus row and its cytoplasm row. It is the position
/// of the cytoplasm in the segmenter's output, not a spatial ordering.
pub type CellId = usize;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssembleError {
    #[error("invalid geometry for cytoplasm {cell_id}: {source}")]
    InvalidGeometry {
        cell_id: CellId,
        #[source]
        source: GeometryError,
    },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NucleusRecord {
    pub cell_id: CellId,
    pub center_x: f64,
    pub center_y: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CytoplasmRecord {
    pub cell_id: CellId,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub outline: Vec<(f64, f64)>,
}

/// The two row-aligned tables produced for one image field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CellTables {
    pub nuclei: Vec<NucleusRecord>,
    pub cytoplasm: Vec<CytoplasmRecord>,

    // nuclei that fell inside no cytoplasm
    pub unmatched_nuclei: usize,
}

impl CellTables {
    pub fn ncells(&self) -> usize {
        self.cytoplasm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cytoplasm.is_empty()
    }
}

/// Pair every nucleus with the first cytoplasm outline (in input order) that
/// contains it.
///
/// A matched nucleus is withdrawn from consideration, so it can never be
/// claimed by a later outline even if that outline also contains it. A
/// cytoplasm holding several nuclei yields one nucleus row per nucleus and a
/// single cytoplasm row. Cytoplasms holding no nucleus, and nuclei inside no
/// cytoplasm, are dropped.
///
/// Every outline is checked before matching begins, so a malformed outline
/// anywhere in the input fails the whole call.
pub fn assemble(
    nuclei: &[NucleusPoint],
    cytoplasms: &[CytoplasmPolygon],
) -> Result<CellTables, AssembleError> {
    let paths = cytoplasms
        .iter()
        .enumerate()
        .map(|(cell_id, cytoplasm)| {
            OutlinePath::new(&cytoplasm.outline)
                .map_err(|source| AssembleError::InvalidGeometry { cell_id, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut unmatched: Vec<usize> = (0..nuclei.len()).collect();
    let mut tables = CellTables::default();

    for (cell_id, (cytoplasm, path)) in cytoplasms.iter().zip(&paths).enumerate() {
        if unmatched.is_empty() {
            break;
        }

        let nrows = tables.nuclei.len();
        unmatched.retain(|&i| {
            let nucleus = &nuclei[i];
            if path.contains_point(nucleus.center_x, nucleus.center_y) {
                tables.nuclei.push(NucleusRecord {
                    cell_id,
                    center_x: nucleus.center_x,
                    center_y: nucleus.center_y,
                });
                false
            } else {
                true
            }
        });

        if tables.nuclei.len() > nrows {
            let (centroid_x, centroid_y) = cytoplasm.centroid();
            tables.cytoplasm.push(CytoplasmRecord {
                cell_id,
                centroid_x,
                centroid_y,
                outline: cytoplasm.outline.clone(),
            });
        }
    }

    tables.unmatched_nuclei = unmatched.len();

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn square(x0: f64, y0: f64, side: f64) -> CytoplasmPolygon {
        CytoplasmPolygon::new(vec![
            (x0, y0),
            (x0 + side, y0),
            (x0 + side, y0 + side),
            (x0, y0 + side),
        ])
    }

    fn nucleus(x: f64, y: f64) -> NucleusPoint {
        NucleusPoint::new(x, y)
    }

    #[test]
    fn test_one_to_one() {
        let tables = assemble(&[nucleus(5.0, 5.0)], &[square(0.0, 0.0, 10.0)]).unwrap();

        assert_eq!(
            tables.nuclei,
            vec![NucleusRecord { cell_id: 0, center_x: 5.0, center_y: 5.0 }]
        );
        assert_eq!(
            tables.cytoplasm,
            vec![CytoplasmRecord {
                cell_id: 0,
                centroid_x: 5.0,
                centroid_y: 5.0,
                outline: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            }]
        );
        assert_eq!(tables.unmatched_nuclei, 0);
    }

    #[test]
    fn test_no_match() {
        let tables = assemble(&[nucleus(50.0, 50.0)], &[square(0.0, 0.0, 10.0)]).unwrap();
        assert!(tables.nuclei.is_empty());
        assert!(tables.cytoplasm.is_empty());
        assert!(tables.is_empty());
        assert_eq!(tables.unmatched_nuclei, 1);
    }

    #[test]
    fn test_two_cells() {
        let nuclei = [nucleus(105.0, 105.0), nucleus(5.0, 5.0)];
        let cytoplasms = [square(0.0, 0.0, 10.0), square(100.0, 100.0, 10.0)];
        let tables = assemble(&nuclei, &cytoplasms).unwrap();

        assert_eq!(tables.ncells(), 2);
        assert_eq!(
            tables.nuclei,
            vec![
                NucleusRecord { cell_id: 0, center_x: 5.0, center_y: 5.0 },
                NucleusRecord { cell_id: 1, center_x: 105.0, center_y: 105.0 },
            ]
        );
        assert_eq!(tables.cytoplasm[0].cell_id, 0);
        assert_eq!(tables.cytoplasm[1].cell_id, 1);
        assert_eq!((tables.cytoplasm[1].centroid_x, tables.cytoplasm[1].centroid_y), (105.0, 105.0));
    }

    #[test]
    fn test_multiple_nuclei_in_one_cytoplasm() {
        let nuclei = [nucleus(2.0, 2.0), nucleus(8.0, 8.0)];
        let tables = assemble(&nuclei, &[square(0.0, 0.0, 10.0)]).unwrap();

        assert_eq!(tables.nuclei.len(), 2);
        assert!(tables.nuclei.iter().all(|row| row.cell_id == 0));
        assert_eq!(tables.cytoplasm.len(), 1);
        assert_eq!(tables.cytoplasm[0].cell_id, 0);

        // The cytoplasm row reports its own centroid, not the nuclei's.
        assert_eq!((tables.cytoplasm[0].centroid_x, tables.cytoplasm[0].centroid_y), (5.0, 5.0));
    }

    #[test]
    fn test_malformed_outline_fails_without_output() {
        let cytoplasms = [
            square(0.0, 0.0, 10.0),
            CytoplasmPolygon::new(vec![(20.0, 20.0), (30.0, 30.0)]),
        ];
        let result = assemble(&[nucleus(5.0, 5.0)], &cytoplasms);

        assert_eq!(
            result,
            Err(AssembleError::InvalidGeometry {
                cell_id: 1,
                source: GeometryError::TooFewPoints(2),
            })
        );
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(assemble(&[], &[]).unwrap(), CellTables::default());

        let tables = assemble(&[], &[square(0.0, 0.0, 10.0)]).unwrap();
        assert!(tables.is_empty());

        let tables = assemble(&[nucleus(1.0, 1.0)], &[]).unwrap();
        assert!(tables.is_empty());
        assert_eq!(tables.unmatched_nuclei, 1);
    }

    #[test]
    fn test_malformed_outline_fails_even_with_no_nuclei() {
        let result = assemble(&[], &[CytoplasmPolygon::new(vec![(0.0, 0.0)])]);
        assert!(matches!(result, Err(AssembleError::InvalidGeometry { cell_id: 0, .. })));
    }

    #[test]
    fn test_first_match_wins() {
        // The nucleus lies in both outlines; the earlier one claims it and the
        // later one, left empty, is dropped.
        let cytoplasms = [square(0.0, 0.0, 10.0), square(4.0, 4.0, 10.0)];
        let tables = assemble(&[nucleus(6.0, 6.0)], &cytoplasms).unwrap();
        assert_eq!(tables.nuclei.len(), 1);
        assert_eq!(tables.nuclei[0].cell_id, 0);
        assert_eq!(tables.cytoplasm.iter().map(|row| row.cell_id).collect::<Vec<_>>(), vec![0]);

        // Reversing the cytoplasm order reverses the winner, even though the
        // nucleus is closer to the other centroid.
        let cytoplasms = [square(4.0, 4.0, 10.0), square(0.0, 0.0, 10.0)];
        let tables = assemble(&[nucleus(6.0, 6.0)], &cytoplasms).unwrap();
        assert_eq!(tables.nuclei[0].cell_id, 0);
        assert_eq!(tables.cytoplasm[0].centroid_x, 9.0);
    }

    #[test]
    fn test_cell_ids_are_input_positions() {
        // Only the third cytoplasm holds a nucleus; its id is still 2.
        let cytoplasms = [
            square(0.0, 0.0, 10.0),
            square(20.0, 0.0, 10.0),
            square(40.0, 0.0, 10.0),
        ];
        let tables = assemble(&[nucleus(45.0, 5.0)], &cytoplasms).unwrap();
        assert_eq!(tables.nuclei[0].cell_id, 2);
        assert_eq!(tables.cytoplasm[0].cell_id, 2);
    }

    #[test]
    fn test_boundary_nucleus_is_dropped() {
        let tables = assemble(&[nucleus(10.0, 5.0)], &[square(0.0, 0.0, 10.0)]).unwrap();
        assert!(tables.is_empty());
        assert_eq!(tables.unmatched_nuclei, 1);
    }

    #[test]
    fn test_table_invariants_on_grid() {
        // 4x4 grid of cytoplasms; every other one gets a nucleus, a few get two,
        // and some nuclei fall in the gutters between cells.
        let mut cytoplasms = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                cytoplasms.push(square(20.0 * i as f64, 20.0 * j as f64, 15.0));
            }
        }

        let mut nuclei = Vec::new();
        for (k, c) in cytoplasms.iter().enumerate() {
            let (x, y) = c.centroid();
            if k % 2 == 0 {
                nuclei.push(nucleus(x, y));
            }
            if k % 5 == 0 {
                nuclei.push(nucleus(x + 1.0, y - 1.0));
            }
            nuclei.push(nucleus(x + 9.0, y));
        }

        let tables = assemble(&nuclei, &cytoplasms).unwrap();

        assert!(tables.nuclei.len() >= tables.cytoplasm.len());
        assert!(tables.cytoplasm.iter().map(|row| row.cell_id).all_unique());
        assert_eq!(tables.nuclei.len() + tables.unmatched_nuclei, nuclei.len());

        let cyto_ids: Vec<CellId> = tables.cytoplasm.iter().map(|row| row.cell_id).collect();
        let nuc_ids: Vec<CellId> = tables.nuclei.iter().map(|row| row.cell_id).unique().collect();
        assert_eq!(nuc_ids.iter().sorted().collect::<Vec<_>>(), cyto_ids.iter().sorted().collect::<Vec<_>>());

        for row in &tables.nuclei {
            let (x, y) = cytoplasms[row.cell_id].centroid();
            assert!((row.center_x - x).abs() < 7.5 && (row.center_y - y).abs() < 7.5);
        }

        // Repeated calls see unmodified inputs and agree exactly.
        assert_eq!(assemble(&nuclei, &cytoplasms).unwrap(), tables);
    }
}
