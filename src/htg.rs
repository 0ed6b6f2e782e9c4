//!
//! Hyper tree grid (`.htg`) reading.
//!
//! Two on-disk generations exist. Files with major version 0 store each
//! tree's refinement descriptor only; topology is rebuilt by recursive
//! descent over breadth-first bits, every tree is loaded at full depth, and
//! trees carry explicit `GlobalOffset` attributes. Files with major version 1
//! add a per-level vertex count table per tree, which enables bulk (and
//! depth-truncated) materialization, tree subsetting, and sequentially
//! computed global offsets over the loaded trees.
//!

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use log::error;

use crate::decode::{self, ArrayDescriptor, DecodeContext};
use crate::model::{
    BitArray, Coordinates, DataArray, HyperTree, HyperTreeGrid, IOBuffer, ScalarType, Version,
};
use crate::reader::check_abort;
use crate::select::ArraySelection;
use crate::xml::Element;
use crate::Error;

/// Restriction of which trees a read materializes.
///
/// Only honored by generation-1 files; older files always load everything.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum TreeSelection {
    /// Load every tree.
    #[default]
    All,
    /// Load trees whose level-zero cell overlaps a world-coordinate box
    /// `[xmin, xmax, ymin, ymax, zmin, zmax]`; converted to grid indices
    /// once per read.
    CoordinatesBoundingBox([f64; 6]),
    /// Load trees with level-zero coordinates inside
    /// `[imin, imax, jmin, jmax, kmin, kmax]`, inclusive.
    IndicesBoundingBox([u32; 6]),
    /// Load exactly the listed tree indices, each with an optional depth cap
    /// (`u32::MAX` keeps the reader-wide cap).
    Ids(BTreeMap<u64, u32>),
}

impl TreeSelection {
    /// Resolve coordinate boxes into index boxes against the grid geometry.
    fn resolve(&self, grid: &HyperTreeGrid) -> TreeSelection {
        match self {
            TreeSelection::CoordinatesBoundingBox(b) => {
                let [cx, cy, cz] = grid.cell_dims();
                TreeSelection::IndicesBoundingBox([
                    find_dichotomic(&grid.coords.x, b[0], cx),
                    find_dichotomic(&grid.coords.x, b[1], cx),
                    find_dichotomic(&grid.coords.y, b[2], cy),
                    find_dichotomic(&grid.coords.y, b[3], cy),
                    find_dichotomic(&grid.coords.z, b[4], cz),
                    find_dichotomic(&grid.coords.z, b[5], cz),
                ])
            }
            other => other.clone(),
        }
    }

    fn is_selected(&self, grid: &HyperTreeGrid, index: u64) -> bool {
        match self {
            TreeSelection::All => true,
            TreeSelection::IndicesBoundingBox(b) => {
                let [i, j, k] = grid.tree_coords(index);
                b[0] <= i && i <= b[1] && b[2] <= j && j <= b[3] && b[4] <= k && k <= b[5]
            }
            TreeSelection::Ids(map) => map.contains_key(&index),
            // Resolved before use.
            TreeSelection::CoordinatesBoundingBox(_) => false,
        }
    }
}

/// Index of the level-zero cell containing coordinate `v` along one axis.
fn find_dichotomic(coords: &IOBuffer, v: f64, cell_dim: u32) -> u32 {
    let values = coord_values(coords);
    if values.len() < 2 {
        return 0;
    }
    let i = values.partition_point(|&c| c <= v);
    (i.saturating_sub(1) as u32).min(cell_dim.saturating_sub(1))
}

fn coord_values(buf: &IOBuffer) -> Vec<f64> {
    match buf {
        IOBuffer::F32(v) => v.iter().map(|&x| x as f64).collect(),
        IOBuffer::F64(v) => v.clone(),
        other => other
            .cast_to_u64()
            .map(|v| v.into_iter().map(|x| x as f64).collect())
            .unwrap_or_default(),
    }
}

/// Depth cap for one tree: the per-id override when present, otherwise the
/// reader-wide cap, clamped by the tree's stored depth.
fn fixed_level_for(
    selection: &TreeSelection,
    fixed_level: Option<u32>,
    index: u64,
    num_levels: u32,
) -> u32 {
    let mut fixed = fixed_level.unwrap_or(u32::MAX);
    if let TreeSelection::Ids(map) = selection {
        if let Some(&lvl) = map.get(&index) {
            if lvl != u32::MAX {
                fixed = lvl;
            }
        }
    }
    num_levels.min(fixed)
}

/// Descriptor index where each breadth-first level begins.
pub(crate) fn level_starts(desc: &BitArray, num_children: usize) -> Vec<usize> {
    let mut starts = vec![0usize];
    let mut n_refined = 0usize;
    let mut n_current = 0usize;
    let mut n_next = 1usize;
    for i in 0..desc.len() {
        if n_current >= n_next {
            n_next = n_refined * num_children;
            n_refined = 0;
            n_current = 0;
            starts.push(i);
        }
        if desc.get(i) {
            n_refined += 1;
        }
        n_current += 1;
    }
    starts
}

pub(crate) fn read_hyper_tree_grid(
    primary: &Element,
    version: Version,
    ctx: &DecodeContext,
    selection: &ArraySelection,
    tree_selection: &TreeSelection,
    fixed_level: Option<u32>,
    abort: Option<&AtomicBool>,
) -> Result<(HyperTreeGrid, bool), Error> {
    let branch_factor = primary.required_attr::<u32>("BranchFactor")?;
    let transposed = primary.scalar_attr::<u8>("TransposedRootIndexing")?.unwrap_or(0) != 0;
    let dims = primary
        .vector_attr::<u32>("Dimensions")?
        .filter(|v| v.len() == 3)
        .ok_or_else(|| Error::XML(crate::xml::Error::MissingAttribute("Dimensions".to_string())))?;
    let declared = primary.scalar_attr::<u64>("NumberOfVertices")?.unwrap_or(0);

    let mut grid = HyperTreeGrid {
        branch_factor,
        transposed_root_indexing: transposed,
        dimensions: [dims[0], dims[1], dims[2]],
        coords: Coordinates::default(),
        declared_num_vertices: declared,
        trees: Vec::new(),
        mask: None,
        point_data: Vec::new(),
    };

    let mut data_error = false;
    if let Some(grid_el) = primary.find("Grid") {
        match read_grid_coordinates(grid_el, ctx) {
            Ok(coords) => grid.coords = coords,
            Err(e) => {
                error!("failed to read grid coordinates: {}", e);
                data_error = true;
            }
        }
    }

    if let Some(trees_el) = primary.find("Trees") {
        if version.major < 1 {
            read_trees_v0(trees_el, ctx, selection, &mut grid, abort, &mut data_error)?;
        } else {
            let resolved = tree_selection.resolve(&grid);
            read_trees_v1(
                trees_el,
                ctx,
                selection,
                &resolved,
                fixed_level,
                &mut grid,
                abort,
                &mut data_error,
            )?;
        }
    }

    Ok((grid, data_error))
}

fn read_grid_coordinates(grid_el: &Element, ctx: &DecodeContext) -> Result<Coordinates, Error> {
    let arrays: Vec<&Element> = grid_el
        .children
        .iter()
        .filter(|c| c.name == "DataArray")
        .collect();
    if arrays.len() < 3 {
        return Err(Error::MissingSection("Grid".to_string()));
    }
    // Positional: x, y, z.
    Ok(Coordinates {
        x: decode::read_data_array(arrays[0], ctx)?.data,
        y: decode::read_data_array(arrays[1], ctx)?.data,
        z: decode::read_data_array(arrays[2], ctx)?.data,
    })
}

fn read_bit_array(el: &Element, ctx: &DecodeContext) -> Result<BitArray, Error> {
    let n = el.scalar_attr::<usize>("NumberOfTuples")?.unwrap_or(0);
    if n == 0 {
        return Ok(BitArray::zeros(0));
    }
    let desc = ArrayDescriptor::parse(el)?;
    let mut buf = IOBuffer::allocate(ScalarType::Bit, n);
    decode::read_array_values(el, &desc, ctx, &mut buf, 0, n, 0)?;
    match buf {
        IOBuffer::Bit(bytes) => Ok(BitArray::from_packed(bytes, n)),
        _ => Err(Error::Decode(decode::Error::TypeMismatch(
            el.attr("Name").unwrap_or("").to_string(),
        ))),
    }
}

fn grow_buffer(buf: &mut IOBuffer, additional: usize) {
    crate::match_buf!(buf; v => {
        let n = v.len() + additional;
        v.resize(n, Default::default());
    });
}

/// Read one tree's `PointData` arrays into the grid-global point arrays at
/// `global_offset`.
fn read_tree_point_data(
    point_data_el: Option<&Element>,
    ctx: &DecodeContext,
    selection: &ArraySelection,
    arrays: &mut Vec<DataArray>,
    global_offset: u64,
    num_vertices: u64,
    initial_tuples: Option<u64>,
    data_error: &mut bool,
) {
    let Some(pd) = point_data_el else {
        return;
    };
    for el in pd
        .children
        .iter()
        .filter(|c| c.name == "DataArray" || c.name == "Array")
    {
        let name = el.attr("Name").unwrap_or("");
        if !selection.is_enabled(name) {
            continue;
        }
        let desc = match ArrayDescriptor::parse(el) {
            Ok(d) => d,
            Err(e) => {
                error!("tree point array {:?}: {}", name, e);
                *data_error = true;
                continue;
            }
        };
        let nc = desc.num_comp as usize;
        if !arrays.iter().any(|a| a.name == name) {
            // First tree carrying this array creates the output array.
            let tuples = initial_tuples.unwrap_or(global_offset) as usize;
            arrays.push(DataArray {
                name: name.to_string(),
                num_comp: desc.num_comp,
                data: IOBuffer::allocate(desc.effective_scalar_type(), tuples * nc),
            });
        }
        let arr = arrays.iter_mut().find(|a| a.name == name).unwrap();
        if initial_tuples.is_none() {
            // Growing layout: extend to cover this tree's range.
            let needed = (global_offset + num_vertices) as usize * nc;
            if arr.data.len() < needed {
                let add = needed - arr.data.len();
                grow_buffer(&mut arr.data, add);
            }
        }
        let dst = global_offset as usize * nc;
        let num = num_vertices as usize * nc;
        if let Err(e) = decode::read_array_values(el, &desc, ctx, &mut arr.data, dst, num, 0) {
            error!("tree point array {:?} failed to decode: {}", name, e);
            *data_error = true;
        }
    }
}

/// Generation 0: full-depth recursive materialization, explicit offsets.
fn read_trees_v0(
    trees_el: &Element,
    ctx: &DecodeContext,
    selection: &ArraySelection,
    grid: &mut HyperTreeGrid,
    abort: Option<&AtomicBool>,
    data_error: &mut bool,
) -> Result<(), Error> {
    let num_children = grid.num_children();
    let mut mask_bits = vec![false; grid.declared_num_vertices as usize];
    let mut has_mask = false;
    let mut point_data: Vec<DataArray> = Vec::new();

    for tree_el in trees_el.children_named("Tree") {
        check_abort(abort)?;
        let index = tree_el.scalar_attr::<u64>("Index")?.unwrap_or(0);
        let global_offset = tree_el.scalar_attr::<u64>("GlobalOffset")?.unwrap_or(0);
        let num_vertices = tree_el.scalar_attr::<u64>("NumberOfVertices")?.unwrap_or(0);

        // Children are positional: descriptor, mask, point data.
        let Some(desc_el) = tree_el.children.first() else {
            error!("tree {} has no descriptor", index);
            *data_error = true;
            continue;
        };
        let descriptor = match read_bit_array(desc_el, ctx) {
            Ok(d) => d,
            Err(e) => {
                error!("tree {} descriptor failed to decode: {}", index, e);
                *data_error = true;
                continue;
            }
        };

        let starts = level_starts(&descriptor, num_children);
        let tree =
            HyperTree::from_descriptor(index, global_offset, descriptor, num_children, &starts);

        if let Some(mask_el) = tree_el.children.get(1) {
            match read_bit_array(mask_el, ctx) {
                Ok(mask) => {
                    if mask.len() as u64 == num_vertices {
                        for i in 0..mask.len() {
                            if let Some(slot) = mask_bits.get_mut(global_offset as usize + i) {
                                *slot = mask.get(i);
                            }
                        }
                        has_mask = true;
                    }
                }
                Err(e) => {
                    error!("tree {} mask failed to decode: {}", index, e);
                    *data_error = true;
                }
            }
        }

        read_tree_point_data(
            tree_el.children.get(2),
            ctx,
            selection,
            &mut point_data,
            global_offset,
            num_vertices,
            Some(grid.declared_num_vertices),
            data_error,
        );

        grid.trees.push(tree);
    }

    if has_mask {
        grid.mask = Some(BitArray::from_bools(&mask_bits));
    }
    grid.point_data = point_data;
    Ok(())
}

/// Generation 1: bulk materialization from per-level counts, with tree
/// subsetting and depth truncation. Offsets accumulate over loaded trees.
#[allow(clippy::too_many_arguments)]
fn read_trees_v1(
    trees_el: &Element,
    ctx: &DecodeContext,
    selection: &ArraySelection,
    tree_selection: &TreeSelection,
    fixed_level: Option<u32>,
    grid: &mut HyperTreeGrid,
    abort: Option<&AtomicBool>,
    data_error: &mut bool,
) -> Result<(), Error> {
    let mut mask_bits: Vec<bool> = Vec::new();
    let mut has_mask = false;
    let mut point_data: Vec<DataArray> = Vec::new();
    let mut global_offset = 0u64;

    for tree_el in trees_el.children_named("Tree") {
        check_abort(abort)?;
        let index = tree_el.scalar_attr::<u64>("Index")?.unwrap_or(0);
        if !tree_selection.is_selected(grid, index) {
            continue;
        }
        let num_levels = tree_el.scalar_attr::<u32>("NumberOfLevels")?.unwrap_or(0);

        // Children are positional: descriptor, per-level counts, mask,
        // point data.
        let descriptor = match tree_el.children.first() {
            Some(el) => match read_bit_array(el, ctx) {
                Ok(d) => d,
                Err(e) => {
                    error!("tree {} descriptor failed to decode: {}", index, e);
                    *data_error = true;
                    continue;
                }
            },
            None => BitArray::zeros(0),
        };

        let verts_by_level = match tree_el.children.get(1) {
            Some(el) => match decode::read_data_array(el, ctx) {
                Ok(arr) => arr.data.cast_to_u64().unwrap_or_default(),
                Err(e) => {
                    error!("tree {} level counts failed to decode: {}", index, e);
                    *data_error = true;
                    continue;
                }
            },
            None => Vec::new(),
        };

        let limited = fixed_level_for(tree_selection, fixed_level, index, num_levels);
        let tree =
            HyperTree::from_level_counts(index, global_offset, limited, descriptor, &verts_by_level);
        let fixed_vertices = tree.num_vertices;

        if let Some(mask_el) = tree_el.children.get(2) {
            match read_bit_array(mask_el, ctx) {
                Ok(mask) => {
                    if !mask.is_empty() {
                        let needed = (global_offset + fixed_vertices) as usize;
                        if mask_bits.len() < needed {
                            mask_bits.resize(needed, false);
                        }
                        let n = mask.len().min(fixed_vertices as usize);
                        for i in 0..n {
                            mask_bits[global_offset as usize + i] = mask.get(i);
                        }
                        has_mask = true;
                    }
                }
                Err(e) => {
                    error!("tree {} mask failed to decode: {}", index, e);
                    *data_error = true;
                }
            }
        }

        read_tree_point_data(
            tree_el.children.get(3),
            ctx,
            selection,
            &mut point_data,
            global_offset,
            fixed_vertices,
            None,
            data_error,
        );

        global_offset += tree.num_vertices;
        grid.trees.push(tree);
    }

    if has_mask {
        mask_bits.resize(global_offset as usize, false);
        grid.mask = Some(BitArray::from_bools(&mask_bits));
    }
    grid.point_data = point_data;
    Ok(())
}
