//! Canonical electrode grid and electrode-list set operations.

use std::collections::{BTreeSet, HashMap};

use crate::types::{Electrode, GRID_SIDE, GRID_SIZE};

/// Result of intersecting two electrode lists.
///
/// `source_indices[i]` and `target_indices[i]` are the positions of
/// `matched[i]` in the two input lists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Intersection {
    /// Electrodes present in both lists, ascending by (row, col)
    pub matched: Vec<Electrode>,
    /// Positions of the matched electrodes in the source list
    pub source_indices: Vec<usize>,
    /// Positions of the matched electrodes in the target list
    pub target_indices: Vec<usize>,
}

impl Intersection {
    pub fn len(&self) -> usize {
        self.matched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }
}

/// Returns the full 64 × 64 grid in canonical (row, col) order.
///
/// The grid is generated from the flat hardware index (`column = idx / 64 + 1`,
/// `row = idx % 64 + 1`) and then sorted, so entry `i` is the electrode at
/// row `i / 64 + 1`, column `i % 64 + 1`.
pub fn canonical_grid() -> Vec<Electrode> {
    let side = GRID_SIDE as usize;
    let mut grid: Vec<Electrode> = (0..GRID_SIZE)
        .map(|idx| {
            let column = (idx / side) as i16 + 1;
            let row = (idx % side) as i16 + 1;
            Electrode::new(row, column)
        })
        .collect();
    grid.sort();
    grid
}

/// Position of an electrode in the canonical grid. Returns `None` for
/// electrodes off the grid.
pub fn flat_index(electrode: Electrode) -> Option<usize> {
    if !electrode.is_on_grid() {
        return None;
    }
    Some((electrode.row as usize - 1) * GRID_SIDE as usize + (electrode.col as usize - 1))
}

/// Inverse of [`flat_index`]. Returns `None` past the end of the grid.
pub fn electrode_at(index: usize) -> Option<Electrode> {
    if index >= GRID_SIZE {
        return None;
    }
    let side = GRID_SIDE as usize;
    Some(Electrode::new(
        (index / side) as i16 + 1,
        (index % side) as i16 + 1,
    ))
}

/// Splits an electrode list into parallel row and column arrays, keeping the
/// container-declared order.
pub fn indices_of(list: &[Electrode]) -> (Vec<i16>, Vec<i16>) {
    list.iter().map(|e| (e.row, e.col)).unzip()
}

/// Intersects two electrode lists by (row, col) identity.
///
/// The matched set is reported in ascending (row, col) order regardless of
/// the order of either input; the index arrays point back into the inputs.
/// This maps a previously exported subset onto the physical stream layout of
/// the source recording.
pub fn intersect_by_selection(source: &[Electrode], target: &[Electrode]) -> Intersection {
    let mut target_positions: HashMap<Electrode, usize> = HashMap::with_capacity(target.len());
    for (position, electrode) in target.iter().enumerate() {
        target_positions.entry(*electrode).or_insert(position);
    }

    let mut seen = BTreeSet::new();
    let mut pairs: Vec<(Electrode, usize, usize)> = source
        .iter()
        .enumerate()
        .filter_map(|(source_position, electrode)| {
            let target_position = *target_positions.get(electrode)?;
            seen.insert(*electrode)
                .then_some((*electrode, source_position, target_position))
        })
        .collect();
    pairs.sort_by_key(|(electrode, _, _)| *electrode);

    let mut intersection = Intersection::default();
    for (electrode, source_position, target_position) in pairs {
        intersection.matched.push(electrode);
        intersection.source_indices.push(source_position);
        intersection.target_indices.push(target_position);
    }
    intersection
}

/// Keeps the electrodes whose row is a multiple of `row_skip + 1` and whose
/// column is a multiple of `col_skip + 1`, in canonical order without
/// duplicates.
pub fn stride_select(selected: &[Electrode], row_skip: u16, col_skip: u16) -> Vec<Electrode> {
    let row_step = i32::from(row_skip) + 1;
    let col_step = i32::from(col_skip) + 1;
    selected
        .iter()
        .filter(|e| i32::from(e.row) % row_step == 0 && i32::from(e.col) % col_step == 0)
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
