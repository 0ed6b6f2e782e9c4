//!
//! Serial XML data-set reading.
//!
//! [`XmlReader`] reads one serial file (`.vti`, `.vtp`, `.vtr`, `.vts`,
//! `.vtu`, `.vtt`, `.htg`). All pieces stored in the file are read into one
//! merged inline piece: attribute arrays are allocated once from the first
//! piece's declared schema and each piece decodes into its tuple range, so
//! arrays stay contiguous across pieces.
//!
//! Malformed structure (missing elements, bad attributes) fails the read;
//! individual array payloads that fail to decode are logged and surfaced
//! through [`ReadOutput::data_error`] while the rest of the file is still
//! read.
//!

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::codec::{Compressor, HeaderType};
use crate::decode::{self, ArrayDescriptor, DecodeContext};
use crate::htg::{self, TreeSelection};
use crate::model::{
    Attributes, ByteOrder, Cells, CellType, Coordinates, DataArray, DataSet, Extent, IOBuffer,
    ImageDataPiece, Piece, PolyDataPiece, RectilinearGridPiece, ScalarType, StructuredGridPiece,
    Svtk, TablePiece, Topology, UnstructuredGridPiece, Version,
};
use crate::select::{ArraySelection, TimeStepTracker};
use crate::xml::{DataSetKind, Document, Element};
use crate::Error;

use num_traits::FromPrimitive;

/// The result of one read call.
#[derive(Debug)]
pub struct ReadOutput {
    pub svtk: Svtk,
    /// True if any array payload failed to decode; details are logged.
    pub data_error: bool,
}

/// Reader for one serial SVTK XML file.
pub struct XmlReader {
    doc: Document,
    path: Option<PathBuf>,
    kind: DataSetKind,
    version: Version,
    byte_order: ByteOrder,
    header_type: HeaderType,
    compressor: Compressor,
    time_values: Vec<f64>,
    time_step: i32,

    pub point_selection: ArraySelection,
    pub cell_selection: ArraySelection,
    pub column_selection: ArraySelection,
    /// Restriction of which hyper trees to load (`.htg` files only).
    pub tree_selection: TreeSelection,
    /// Depth cap for hyper tree materialization (`.htg` files only).
    pub fixed_level: Option<u32>,

    point_tracker: TimeStepTracker,
    cell_tracker: TimeStepTracker,
    abort: Option<Arc<AtomicBool>>,
    progress: Option<Box<dyn Fn(f64)>>,
}

impl XmlReader {
    /// Open and parse the header of the file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<XmlReader, Error> {
        let path = path.as_ref();
        let expected = match crate::xml::FileType::try_from_path(path) {
            Some(crate::xml::FileType::Serial(kind)) => Some(kind),
            _ => None,
        };
        let bytes = std::fs::read(path)?;
        let mut reader = XmlReader::from_bytes(&bytes, expected)?;
        reader.path = Some(path.to_path_buf());
        Ok(reader)
    }

    /// Parse the header of a complete file image.
    ///
    /// `expected` verifies the file's declared data-set type when the caller
    /// knows what it should be (e.g. from the file extension).
    pub fn from_bytes(bytes: &[u8], expected: Option<DataSetKind>) -> Result<XmlReader, Error> {
        let doc = Document::parse(bytes)?;
        XmlReader::new(doc, expected)
    }

    pub fn from_str(xml: &str, expected: Option<DataSetKind>) -> Result<XmlReader, Error> {
        XmlReader::from_bytes(xml.as_bytes(), expected)
    }

    fn new(doc: Document, expected: Option<DataSetKind>) -> Result<XmlReader, Error> {
        let root = &doc.root;
        let type_tag = root.attr("type").unwrap_or("").to_string();
        let kind = DataSetKind::from_xml_tag(&type_tag)
            .ok_or_else(|| Error::UnknownDataSetType(type_tag.clone()))?;
        if let Some(expected) = expected {
            if expected != kind {
                return Err(Error::UnexpectedDataSetType {
                    expected: expected.xml_tag().to_string(),
                    found: type_tag,
                });
            }
        }

        let version = parse_version(root)?;
        let byte_order = match root.attr("byte_order").unwrap_or("LittleEndian") {
            "BigEndian" => ByteOrder::BigEndian,
            "LittleEndian" => ByteOrder::LittleEndian,
            other => return Err(Error::InvalidByteOrder(other.to_string())),
        };
        let header_type = match root.attr("header_type") {
            None => HeaderType::default(),
            Some(tag) => HeaderType::from_tag(tag)
                .ok_or_else(|| Error::InvalidHeaderType(tag.to_string()))?,
        };
        let compressor =
            Compressor::from_tag(root.attr("compressor").unwrap_or("")).map_err(Error::Codec)?;

        let primary = root
            .find(kind.xml_tag())
            .ok_or_else(|| Error::MissingSection(kind.xml_tag().to_string()))?;
        let time_values = primary.vector_attr::<f64>("TimeValues")?.unwrap_or_default();

        let mut reader = XmlReader {
            doc,
            path: None,
            kind,
            version,
            byte_order,
            header_type,
            compressor,
            time_values,
            time_step: 0,
            point_selection: ArraySelection::new(),
            cell_selection: ArraySelection::new(),
            column_selection: ArraySelection::new(),
            tree_selection: TreeSelection::All,
            fixed_level: None,
            point_tracker: TimeStepTracker::new(),
            cell_tracker: TimeStepTracker::new(),
            abort: None,
            progress: None,
        };
        reader.discover_arrays();
        Ok(reader)
    }

    pub fn kind(&self) -> DataSetKind {
        self.kind
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn time_values(&self) -> &[f64] {
        &self.time_values
    }

    pub fn num_time_steps(&self) -> usize {
        self.time_values.len()
    }

    /// Select the time step subsequent reads decode.
    pub fn set_time_step(&mut self, step: i32) {
        self.time_step = step;
    }

    /// Install a shared flag which, when set, makes an in-flight read stop
    /// between arrays with [`Error::Aborted`].
    pub fn set_abort_handle(&mut self, abort: Arc<AtomicBool>) {
        self.abort = Some(abort);
    }

    /// Install an observer receiving advisory completion fractions in
    /// `(0, 1]` as arrays finish decoding.
    pub fn set_progress_observer(&mut self, observer: Box<dyn Fn(f64)>) {
        self.progress = Some(observer);
    }

    /// Record every array name declared anywhere in the file so selections
    /// can be adjusted before the first read.
    fn discover_arrays(&mut self) {
        fn walk(
            el: &Element,
            point: &mut ArraySelection,
            cell: &mut ArraySelection,
            column: &mut ArraySelection,
        ) {
            let target = match el.name.as_str() {
                "PointData" => Some(&mut *point),
                "CellData" => Some(&mut *cell),
                "RowData" => Some(&mut *column),
                _ => None,
            };
            if let Some(sel) = target {
                for c in &el.children {
                    if c.name == "DataArray" || c.name == "Array" {
                        if let Some(name) = c.attr("Name") {
                            sel.discover(name);
                        }
                    }
                }
            }
            for c in &el.children {
                walk(c, point, cell, column);
            }
        }
        let root = self.doc.root.clone();
        walk(
            &root,
            &mut self.point_selection,
            &mut self.cell_selection,
            &mut self.column_selection,
        );
    }

    /// Read the data set at the configured time step.
    pub fn read(&mut self) -> Result<ReadOutput, Error> {
        // Output arrays are allocated fresh on every call; stale skip state
        // from an earlier call would leave them zeroed.
        self.point_tracker.reset();
        self.cell_tracker.reset();
        let ctx = DecodeContext {
            byte_order: self.byte_order,
            header_type: self.header_type,
            compressor: self.compressor,
            appended: self.doc.appended.as_ref(),
        };
        let primary = self
            .doc
            .root
            .find(self.kind.xml_tag())
            .ok_or_else(|| Error::MissingSection(self.kind.xml_tag().to_string()))?;

        let mut data_error = false;
        // Hyper tree grids report no per-array progress.
        let total_arrays = if self.kind == DataSetKind::HyperTreeGrid {
            0
        } else {
            count_enabled_arrays(
                primary,
                &self.point_selection,
                &self.cell_selection,
                &self.column_selection,
            )
        };
        let mut progress = Progress {
            done: 0,
            total: total_arrays,
            observer: self.progress.as_deref(),
        };
        let abort = self.abort.as_deref();

        let mut state = ReadState {
            ctx: &ctx,
            file_version: self.version,
            num_time_steps: self.time_values.len(),
            time_step: self.time_step,
            point_selection: &self.point_selection,
            cell_selection: &self.cell_selection,
            column_selection: &self.column_selection,
            point_tracker: &mut self.point_tracker,
            cell_tracker: &mut self.cell_tracker,
            progress: &mut progress,
            abort,
            data_error: &mut data_error,
        };

        let data = match self.kind {
            DataSetKind::ImageData => read_image_data(primary, &mut state)?,
            DataSetKind::RectilinearGrid => read_rectilinear_grid(primary, &mut state)?,
            DataSetKind::StructuredGrid => read_structured_grid(primary, &mut state)?,
            DataSetKind::PolyData => read_poly_data(primary, &mut state)?,
            DataSetKind::UnstructuredGrid => read_unstructured_grid(primary, &mut state)?,
            DataSetKind::Table => read_table(primary, &mut state)?,
            DataSetKind::HyperTreeGrid => {
                let (grid, tree_error) = htg::read_hyper_tree_grid(
                    primary,
                    self.version,
                    &ctx,
                    &self.point_selection,
                    &self.tree_selection,
                    self.fixed_level,
                    abort,
                )?;
                data_error |= tree_error;
                DataSet::HyperTreeGrid(Box::new(grid))
            }
        };

        // FieldData arrays attached to the primary element.
        let mut field_data = Vec::new();
        if let Some(fd) = primary.find("FieldData") {
            for el in fd
                .children
                .iter()
                .filter(|c| c.name == "DataArray" || c.name == "Array")
            {
                match decode::read_data_array(el, &ctx) {
                    Ok(arr) => field_data.push(arr),
                    Err(e) => {
                        error!("FieldData array failed to decode: {}", e);
                        data_error = true;
                    }
                }
            }
        }

        Ok(ReadOutput {
            svtk: Svtk {
                version: self.version,
                byte_order: self.byte_order,
                file_path: self.path.clone(),
                field_data,
                data,
            },
            data_error,
        })
    }
}

impl std::fmt::Debug for XmlReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("XmlReader")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("path", &self.path)
            .finish()
    }
}

pub(crate) fn parse_version(root: &Element) -> Result<Version, Error> {
    match root.attr("version") {
        None => Ok(Version::new((0, 1))),
        Some(v) => {
            let mut it = v.splitn(2, '.');
            let major = it.next().and_then(|s| s.parse().ok());
            let minor = it.next().and_then(|s| s.parse().ok());
            match (major, minor) {
                (Some(major), Some(minor)) => Ok(Version { major, minor }),
                _ => Err(Error::InvalidVersion(v.to_string())),
            }
        }
    }
}

struct Progress<'a> {
    done: usize,
    total: usize,
    observer: Option<&'a dyn Fn(f64)>,
}

impl Progress<'_> {
    fn tick(&mut self) {
        self.done += 1;
        if let Some(observer) = self.observer {
            observer(self.done as f64 / self.total.max(1) as f64);
        }
    }
}

/// Everything a piece-section decode needs, bundled so helpers stay free
/// functions with disjoint borrows of the reader.
struct ReadState<'a, 'b> {
    ctx: &'a DecodeContext<'a>,
    file_version: Version,
    num_time_steps: usize,
    time_step: i32,
    point_selection: &'a ArraySelection,
    cell_selection: &'a ArraySelection,
    column_selection: &'a ArraySelection,
    point_tracker: &'a mut TimeStepTracker,
    cell_tracker: &'a mut TimeStepTracker,
    progress: &'a mut Progress<'b>,
    abort: Option<&'a AtomicBool>,
    data_error: &'a mut bool,
}

pub(crate) fn check_abort(abort: Option<&AtomicBool>) -> Result<(), Error> {
    match abort {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Aborted),
        _ => Ok(()),
    }
}

fn section_arrays<'a>(el: &'a Element) -> impl Iterator<Item = &'a Element> {
    el.children
        .iter()
        .filter(|c| c.name == "DataArray" || c.name == "Array")
}

fn count_enabled_arrays(
    primary: &Element,
    point: &ArraySelection,
    cell: &ArraySelection,
    column: &ArraySelection,
) -> usize {
    fn walk(el: &Element, point: &ArraySelection, cell: &ArraySelection, column: &ArraySelection) -> usize {
        let own = match el.name.as_str() {
            "PointData" => Some(point),
            "CellData" => Some(cell),
            "RowData" => Some(column),
            _ => None,
        };
        let mut n = 0;
        if let Some(sel) = own {
            n += section_arrays(el)
                .filter(|c| sel.is_enabled(c.attr("Name").unwrap_or("")))
                .count();
        }
        n + el.children.iter().map(|c| walk(c, point, cell, column)).sum::<usize>()
    }
    walk(primary, point, cell, column)
}

/// Allocate merged output arrays from the first piece's declared schema.
fn allocate_section(
    piece0: Option<&Element>,
    section: &str,
    selection: &ArraySelection,
    total_tuples: usize,
    data_error: &mut bool,
) -> Vec<DataArray> {
    let mut out = Vec::new();
    let Some(sec) = piece0.and_then(|p| p.find(section)) else {
        return out;
    };
    for el in section_arrays(sec) {
        let name = el.attr("Name").unwrap_or("");
        if !selection.is_enabled(name) {
            continue;
        }
        match ArrayDescriptor::parse(el) {
            Ok(desc) => {
                let st = desc.effective_scalar_type();
                let n = match st {
                    ScalarType::Str => total_tuples,
                    _ => total_tuples * desc.num_comp as usize,
                };
                out.push(DataArray {
                    name: name.to_string(),
                    num_comp: desc.num_comp,
                    data: IOBuffer::allocate(st, n),
                });
            }
            Err(e) => {
                error!("{} array {:?} has a malformed descriptor: {}", section, name, e);
                *data_error = true;
            }
        }
    }
    out
}

/// Decode one piece's section into the merged arrays at `tuple_offset`.
#[allow(clippy::too_many_arguments)]
fn read_section(
    piece: &Element,
    section: &str,
    arrays: &mut [DataArray],
    selection: &ArraySelection,
    tracker: &mut TimeStepTracker,
    ctx: &DecodeContext,
    num_time_steps: usize,
    time_step: i32,
    tuple_offset: usize,
    num_tuples: usize,
    piece_index: usize,
    progress: &mut Progress,
    abort: Option<&AtomicBool>,
    data_error: &mut bool,
) -> Result<(), Error> {
    let Some(sec) = piece.find(section) else {
        return Ok(());
    };
    for el in section_arrays(sec) {
        check_abort(abort)?;
        let name = el.attr("Name").unwrap_or("");
        if !selection.is_enabled(name) {
            continue;
        }
        let Some(arr) = arrays.iter_mut().find(|a| a.name == name) else {
            // Declared only in a later piece; the first piece's schema governs.
            warn!("piece {}: {} array {:?} absent from the leading schema", piece_index, section, name);
            progress.tick();
            continue;
        };
        let desc = match ArrayDescriptor::parse(el) {
            Ok(d) => d,
            Err(e) => {
                error!("piece {}: {} array {:?}: {}", piece_index, section, name, e);
                *data_error = true;
                progress.tick();
                continue;
            }
        };
        let needs = match tracker.needs_read(
            name,
            piece_index,
            &desc.time_steps,
            num_time_steps,
            time_step,
            desc.offset.map(|o| o as i64),
        ) {
            Ok(b) => b,
            Err(e) => {
                error!("piece {}: {}", piece_index, e);
                *data_error = true;
                progress.tick();
                continue;
            }
        };
        if !needs {
            progress.tick();
            continue;
        }
        let (dst, num_values) = match desc.effective_scalar_type() {
            ScalarType::Str => (tuple_offset, num_tuples),
            _ => (
                tuple_offset * desc.num_comp as usize,
                num_tuples * desc.num_comp as usize,
            ),
        };
        if let Err(e) = decode::read_array_values(el, &desc, ctx, &mut arr.data, dst, num_values, 0) {
            error!(
                "piece {}: failed to decode {} array {:?}: {}",
                piece_index, section, name, e
            );
            *data_error = true;
        }
        progress.tick();
    }
    Ok(())
}

/// Read both attribute sections of all `pieces` into merged arrays sized by
/// the per-piece tuple counts.
fn read_attributes(
    pieces: &[&Element],
    point_counts: &[usize],
    cell_counts: &[usize],
    state: &mut ReadState,
) -> Result<Attributes, Error> {
    let total_points: usize = point_counts.iter().sum();
    let total_cells: usize = cell_counts.iter().sum();
    let mut point = allocate_section(
        pieces.first().copied(),
        "PointData",
        state.point_selection,
        total_points,
        state.data_error,
    );
    let mut cell = allocate_section(
        pieces.first().copied(),
        "CellData",
        state.cell_selection,
        total_cells,
        state.data_error,
    );

    let (mut point_offset, mut cell_offset) = (0, 0);
    for (i, piece) in pieces.iter().enumerate() {
        read_section(
            piece,
            "PointData",
            &mut point,
            state.point_selection,
            state.point_tracker,
            state.ctx,
            state.num_time_steps,
            state.time_step,
            point_offset,
            point_counts[i],
            i,
            state.progress,
            state.abort,
            state.data_error,
        )?;
        read_section(
            piece,
            "CellData",
            &mut cell,
            state.cell_selection,
            state.cell_tracker,
            state.ctx,
            state.num_time_steps,
            state.time_step,
            cell_offset,
            cell_counts[i],
            i,
            state.progress,
            state.abort,
            state.data_error,
        )?;
        point_offset += point_counts[i];
        cell_offset += cell_counts[i];
    }
    Ok(Attributes { point, cell })
}

/// Rewrite legacy ghost-level arrays into the modern ghost-type convention.
///
/// Files older than major version 2 store `svtkGhostLevels` as plain levels;
/// any nonzero level marks a duplicate entity.
pub(crate) fn apply_ghost_shim(version: Version, attributes: &mut Attributes) {
    const DUPLICATE_POINT: u8 = 1;
    const DUPLICATE_CELL: u8 = 1;
    if version.major >= 2 {
        return;
    }
    shim_ghost_array(&mut attributes.point, DUPLICATE_POINT);
    shim_ghost_array(&mut attributes.cell, DUPLICATE_CELL);
}

fn shim_ghost_array(arrays: &mut [DataArray], duplicate: u8) {
    for arr in arrays {
        if arr.name != "svtkGhostLevels" || arr.num_comp != 1 {
            continue;
        }
        if let IOBuffer::U8(values) = &mut arr.data {
            for v in values.iter_mut() {
                if *v != 0 {
                    *v = duplicate;
                }
            }
            arr.name = "svtkGhostType".to_string();
        }
    }
}

pub(crate) fn required_extent(el: &Element, attr: &str) -> Result<Extent, Error> {
    let v = el
        .vector_attr::<i32>(attr)?
        .ok_or_else(|| Error::XML(crate::xml::Error::MissingAttribute(attr.to_string())))?;
    extent_from_slice(&v, attr)
}

fn extent_from_slice(v: &[i32], attr: &str) -> Result<Extent, Error> {
    if v.len() != 6 {
        return Err(Error::XML(crate::xml::Error::InvalidAttributeValue {
            attrib: attr.to_string(),
            value: format!("{:?}", v),
        }));
    }
    Ok(Extent([v[0]..=v[1], v[2]..=v[3], v[4]..=v[5]]))
}

pub(crate) fn triple(el: &Element, attr: &str, default: [f64; 3]) -> Result<[f64; 3], Error> {
    match el.vector_attr::<f64>(attr)? {
        None => Ok(default),
        Some(v) if v.len() == 3 => Ok([v[0], v[1], v[2]]),
        Some(v) => Err(Error::XML(crate::xml::Error::InvalidAttributeValue {
            attrib: attr.to_string(),
            value: format!("{:?}", v),
        })),
    }
}

fn read_image_data(primary: &Element, state: &mut ReadState) -> Result<DataSet, Error> {
    let whole_extent = required_extent(primary, "WholeExtent")?;
    let origin = triple(primary, "Origin", [0.0; 3])?;
    let spacing = triple(primary, "Spacing", [1.0; 3])?;

    let pieces: Vec<&Element> = primary.children_named("Piece").collect();
    let (point_counts, cell_counts) = structured_counts(&pieces)?;
    let data = read_attributes(&pieces, &point_counts, &cell_counts, state)?;
    let mut piece = ImageDataPiece {
        extent: whole_extent.clone(),
        data,
    };
    // Not applicable on version >= 2 files.
    apply_ghost_shim_current(state, &mut piece.data);

    Ok(DataSet::ImageData {
        extent: whole_extent,
        origin,
        spacing,
        meta: None,
        pieces: vec![Piece::Inline(Box::new(piece))],
    })
}

fn structured_counts(pieces: &[&Element]) -> Result<(Vec<usize>, Vec<usize>), Error> {
    let mut points = Vec::with_capacity(pieces.len());
    let mut cells = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let extent = required_extent(piece, "Extent")?;
        points.push(extent.num_points() as usize);
        cells.push(extent.num_cells() as usize);
    }
    Ok((points, cells))
}

fn apply_ghost_shim_current(state: &ReadState, data: &mut Attributes) {
    apply_ghost_shim(state.file_version, data);
}

fn read_rectilinear_grid(primary: &Element, state: &mut ReadState) -> Result<DataSet, Error> {
    let whole_extent = required_extent(primary, "WholeExtent")?;
    let pieces: Vec<&Element> = primary.children_named("Piece").collect();
    let (point_counts, cell_counts) = structured_counts(&pieces)?;

    let coords = match pieces.first() {
        Some(piece) => {
            if pieces.len() > 1 {
                warn!("rectilinear file stores {} pieces; coordinates come from the first", pieces.len());
            }
            read_coordinates(piece, state.ctx)?
        }
        None => Coordinates::default(),
    };

    let mut data = read_attributes(&pieces, &point_counts, &cell_counts, state)?;
    apply_ghost_shim_current(state, &mut data);

    Ok(DataSet::RectilinearGrid {
        extent: whole_extent.clone(),
        meta: None,
        pieces: vec![Piece::Inline(Box::new(RectilinearGridPiece {
            extent: whole_extent,
            coords,
            data,
        }))],
    })
}

fn read_coordinates(piece: &Element, ctx: &DecodeContext) -> Result<Coordinates, Error> {
    let coords = piece
        .find("Coordinates")
        .ok_or_else(|| Error::MissingSection("Coordinates".to_string()))?;
    let arrays: Vec<&Element> = section_arrays(coords).collect();
    if arrays.len() < 3 {
        return Err(Error::MissingSection("Coordinates".to_string()));
    }
    // The three child arrays are positional: x, y, z.
    Ok(Coordinates {
        x: decode::read_data_array(arrays[0], ctx)?.data,
        y: decode::read_data_array(arrays[1], ctx)?.data,
        z: decode::read_data_array(arrays[2], ctx)?.data,
    })
}

fn read_structured_grid(primary: &Element, state: &mut ReadState) -> Result<DataSet, Error> {
    let whole_extent = required_extent(primary, "WholeExtent")?;
    let pieces: Vec<&Element> = primary.children_named("Piece").collect();
    let (point_counts, cell_counts) = structured_counts(&pieces)?;

    let points = read_merged_points(&pieces, &point_counts, state.ctx)?;
    let mut data = read_attributes(&pieces, &point_counts, &cell_counts, state)?;
    apply_ghost_shim_current(state, &mut data);

    Ok(DataSet::StructuredGrid {
        extent: whole_extent.clone(),
        meta: None,
        pieces: vec![Piece::Inline(Box::new(StructuredGridPiece {
            extent: whole_extent,
            points,
            data,
        }))],
    })
}

/// Read all pieces' `Points` arrays into one contiguous coordinate buffer.
fn read_merged_points(
    pieces: &[&Element],
    point_counts: &[usize],
    ctx: &DecodeContext,
) -> Result<IOBuffer, Error> {
    let total: usize = point_counts.iter().sum();
    let Some(first) = pieces.first() else {
        return Ok(IOBuffer::default());
    };
    let first_el = points_array_element(first)?;
    let desc = ArrayDescriptor::parse(first_el)?;
    let mut out = IOBuffer::allocate(desc.effective_scalar_type(), total * 3);

    let mut offset = 0;
    for (i, piece) in pieces.iter().enumerate() {
        let el = points_array_element(piece)?;
        let desc = ArrayDescriptor::parse(el)?;
        decode::read_array_values(el, &desc, ctx, &mut out, offset * 3, point_counts[i] * 3, 0)?;
        offset += point_counts[i];
    }
    Ok(out)
}

fn points_array_element<'a>(piece: &'a Element) -> Result<&'a Element, Error> {
    piece
        .find("Points")
        .and_then(|p| section_arrays(p).next())
        .ok_or_else(|| Error::MissingSection("Points".to_string()))
}

fn read_poly_data(primary: &Element, state: &mut ReadState) -> Result<DataSet, Error> {
    let pieces: Vec<&Element> = primary.children_named("Piece").collect();

    let mut point_counts = Vec::with_capacity(pieces.len());
    let mut cell_counts = Vec::with_capacity(pieces.len());
    for piece in &pieces {
        point_counts.push(piece.required_attr::<usize>("NumberOfPoints")?);
        let mut cells = 0usize;
        for attr in ["NumberOfVerts", "NumberOfLines", "NumberOfStrips", "NumberOfPolys"] {
            cells += piece.scalar_attr::<usize>(attr)?.unwrap_or(0);
        }
        cell_counts.push(cells);
    }

    let points = read_merged_points(&pieces, &point_counts, state.ctx)?;
    let verts = read_merged_topology(&pieces, &point_counts, "Verts", state.ctx)?;
    let lines = read_merged_topology(&pieces, &point_counts, "Lines", state.ctx)?;
    let strips = read_merged_topology(&pieces, &point_counts, "Strips", state.ctx)?;
    let polys = read_merged_topology(&pieces, &point_counts, "Polys", state.ctx)?;

    let mut data = read_attributes(&pieces, &point_counts, &cell_counts, state)?;
    apply_ghost_shim_current(state, &mut data);

    Ok(DataSet::PolyData {
        meta: None,
        pieces: vec![Piece::Inline(Box::new(PolyDataPiece {
            points,
            verts,
            lines,
            strips,
            polys,
            data,
        }))],
    })
}

/// Merge one named topology section across pieces.
///
/// Connectivity entries are shifted by each piece's point offset and offsets
/// by the accumulated connectivity length, so merged indices stay valid.
/// Merged index buffers are widened to `u64`.
fn read_merged_topology(
    pieces: &[&Element],
    point_counts: &[usize],
    section: &str,
    ctx: &DecodeContext,
) -> Result<Option<Topology>, Error> {
    if !pieces.iter().any(|p| p.find(section).is_some()) {
        return Ok(None);
    }
    let mut connectivity: Vec<u64> = Vec::new();
    let mut offsets: Vec<u64> = Vec::new();
    let mut point_offset = 0u64;
    for (i, piece) in pieces.iter().enumerate() {
        if let Some(sec) = piece.find(section) {
            let (conn, offs) = read_topology_arrays(sec, ctx)?;
            let conn_base = connectivity.len() as u64;
            connectivity.extend(conn.iter().map(|&c| c + point_offset));
            offsets.extend(offs.iter().map(|&o| o + conn_base));
        }
        point_offset += point_counts[i] as u64;
    }
    Ok(Some(Topology {
        connectivity: IOBuffer::U64(connectivity),
        offsets: IOBuffer::U64(offsets),
    }))
}

fn read_topology_arrays(sec: &Element, ctx: &DecodeContext) -> Result<(Vec<u64>, Vec<u64>), Error> {
    let conn = read_named_index_array(sec, "connectivity", ctx)?;
    let offs = read_named_index_array(sec, "offsets", ctx)?;
    Ok((conn, offs))
}

fn read_named_index_array(
    sec: &Element,
    name: &str,
    ctx: &DecodeContext,
) -> Result<Vec<u64>, Error> {
    let el = section_arrays(sec)
        .find(|c| c.attr("Name") == Some(name))
        .ok_or_else(|| Error::MissingSection(name.to_string()))?;
    let arr = decode::read_data_array(el, ctx)?;
    arr.data
        .cast_to_u64()
        .ok_or_else(|| Error::Decode(decode::Error::TypeMismatch(name.to_string())))
}

fn read_unstructured_grid(primary: &Element, state: &mut ReadState) -> Result<DataSet, Error> {
    let pieces: Vec<&Element> = primary.children_named("Piece").collect();

    let mut point_counts = Vec::with_capacity(pieces.len());
    let mut cell_counts = Vec::with_capacity(pieces.len());
    for piece in &pieces {
        point_counts.push(piece.required_attr::<usize>("NumberOfPoints")?);
        cell_counts.push(piece.required_attr::<usize>("NumberOfCells")?);
    }

    let points = read_merged_points(&pieces, &point_counts, state.ctx)?;

    let mut connectivity: Vec<u64> = Vec::new();
    let mut offsets: Vec<u64> = Vec::new();
    let mut types: Vec<CellType> = Vec::new();
    let mut point_offset = 0u64;
    for (i, piece) in pieces.iter().enumerate() {
        let cells = piece
            .find("Cells")
            .ok_or_else(|| Error::MissingSection("Cells".to_string()))?;
        let (conn, offs) = read_topology_arrays(cells, state.ctx)?;
        let conn_base = connectivity.len() as u64;
        connectivity.extend(conn.iter().map(|&c| c + point_offset));
        offsets.extend(offs.iter().map(|&o| o + conn_base));
        for t in read_named_index_array(cells, "types", state.ctx)? {
            types.push(CellType::from_u64(t).ok_or(Error::UnknownCellType(t))?);
        }
        point_offset += point_counts[i] as u64;
    }

    let mut data = read_attributes(&pieces, &point_counts, &cell_counts, state)?;
    apply_ghost_shim_current(state, &mut data);

    Ok(DataSet::UnstructuredGrid {
        meta: None,
        pieces: vec![Piece::Inline(Box::new(UnstructuredGridPiece {
            points,
            cells: Cells {
                topo: Topology {
                    connectivity: IOBuffer::U64(connectivity),
                    offsets: IOBuffer::U64(offsets),
                },
                types,
            },
            data,
        }))],
    })
}

fn read_table(primary: &Element, state: &mut ReadState) -> Result<DataSet, Error> {
    let pieces: Vec<&Element> = primary.children_named("Piece").collect();
    let mut row_counts = Vec::with_capacity(pieces.len());
    for piece in &pieces {
        row_counts.push(piece.required_attr::<usize>("NumberOfRows")?);
    }
    let total_rows: usize = row_counts.iter().sum();

    let mut row_data = allocate_section(
        pieces.first().copied(),
        "RowData",
        state.column_selection,
        total_rows,
        state.data_error,
    );
    let mut offset = 0;
    // Table columns have no time series semantics; a throwaway tracker keeps
    // the decode path uniform.
    let mut tracker = TimeStepTracker::new();
    for (i, piece) in pieces.iter().enumerate() {
        read_section(
            piece,
            "RowData",
            &mut row_data,
            state.column_selection,
            &mut tracker,
            state.ctx,
            0,
            0,
            offset,
            row_counts[i],
            i,
            state.progress,
            state.abort,
            state.data_error,
        )?;
        offset += row_counts[i];
    }

    Ok(DataSet::Table {
        meta: None,
        pieces: vec![Piece::Inline(Box::new(TablePiece {
            num_rows: total_rows as u64,
            row_data,
        }))],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image_xml(version: &str, body: &str) -> String {
        format!(
            r#"<VTKFile type="ImageData" version="{}" byte_order="LittleEndian">
                 <ImageData WholeExtent="0 1 0 1 0 0" Origin="0 0 0" Spacing="1 1 1">
                   {}
                 </ImageData>
               </VTKFile>"#,
            version, body
        )
    }

    #[test]
    fn header_attributes() {
        let xml = image_xml("4.2", "");
        let reader = XmlReader::from_str(&xml, Some(DataSetKind::ImageData)).unwrap();
        assert_eq!(reader.version(), Version::new((4, 2)));
        assert_eq!(reader.byte_order(), ByteOrder::LittleEndian);
        assert_eq!(reader.kind(), DataSetKind::ImageData);
    }

    #[test]
    fn type_mismatch_rejected() {
        let xml = image_xml("1.0", "");
        assert!(matches!(
            XmlReader::from_str(&xml, Some(DataSetKind::PolyData)),
            Err(Error::UnexpectedDataSetType { .. })
        ));
    }

    #[test]
    fn multi_piece_arrays_are_contiguous() {
        // Two pieces of 4 points each; the second piece's values land at
        // tuple offset 4.
        let xml = r#"<VTKFile type="ImageData" version="1.0" byte_order="LittleEndian">
            <ImageData WholeExtent="0 3 0 1 0 0" Origin="0 0 0" Spacing="1 1 1">
              <Piece Extent="0 1 0 1 0 0">
                <PointData>
                  <DataArray type="Float64" Name="w" format="ascii">1 2 3 4</DataArray>
                </PointData>
              </Piece>
              <Piece Extent="2 3 0 1 0 0">
                <PointData>
                  <DataArray type="Float64" Name="w" format="ascii">5 6 7 8</DataArray>
                </PointData>
              </Piece>
            </ImageData>
          </VTKFile>"#;
        let mut reader = XmlReader::from_str(xml, None).unwrap();
        let out = reader.read().unwrap();
        assert!(!out.data_error);
        match out.svtk.data {
            DataSet::ImageData { pieces, .. } => {
                let Piece::Inline(piece) = &pieces[0] else { panic!() };
                let w = piece.data.find_point("w").unwrap();
                assert_eq!(w.data, IOBuffer::F64(vec![1., 2., 3., 4., 5., 6., 7., 8.]));
            }
            _ => panic!("expected image data"),
        }
    }

    #[test]
    fn disabled_array_is_not_read() {
        let xml = image_xml(
            "1.0",
            r#"<Piece Extent="0 1 0 1 0 0">
                 <PointData>
                   <DataArray type="Float32" Name="keep" format="ascii">1 2 3 4</DataArray>
                   <DataArray type="Float32" Name="drop" format="ascii">9 9 9 9</DataArray>
                 </PointData>
               </Piece>"#,
        );
        let mut reader = XmlReader::from_str(&xml, None).unwrap();
        reader.point_selection.set_enabled("drop", false);
        let out = reader.read().unwrap();
        match out.svtk.data {
            DataSet::ImageData { pieces, .. } => {
                let Piece::Inline(piece) = &pieces[0] else { panic!() };
                assert!(piece.data.find_point("keep").is_some());
                assert!(piece.data.find_point("drop").is_none());
            }
            _ => panic!(),
        }
    }

    #[test]
    fn bad_array_payload_sets_data_error() {
        let xml = image_xml(
            "1.0",
            r#"<Piece Extent="0 1 0 1 0 0">
                 <PointData>
                   <DataArray type="Int32" Name="u" format="ascii">1 oops 3 4</DataArray>
                   <DataArray type="Int32" Name="v" format="ascii">5 6 7 8</DataArray>
                 </PointData>
               </Piece>"#,
        );
        let mut reader = XmlReader::from_str(&xml, None).unwrap();
        let out = reader.read().unwrap();
        assert!(out.data_error);
        // The healthy array was still read.
        match out.svtk.data {
            DataSet::ImageData { pieces, .. } => {
                let Piece::Inline(piece) = &pieces[0] else { panic!() };
                let v = piece.data.find_point("v").unwrap();
                assert_eq!(v.data, IOBuffer::I32(vec![5, 6, 7, 8]));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn ghost_shim_applies_below_version_two() {
        let mut attrs = Attributes::new();
        attrs.point.push(
            DataArray::new("svtkGhostLevels", 1).with_data(vec![0u8, 2, 5, 0]),
        );
        apply_ghost_shim(Version::new((1, 0)), &mut attrs);
        let arr = &attrs.point[0];
        assert_eq!(arr.name, "svtkGhostType");
        assert_eq!(arr.data, IOBuffer::U8(vec![0, 1, 1, 0]));

        let mut attrs = Attributes::new();
        attrs.point.push(
            DataArray::new("svtkGhostLevels", 1).with_data(vec![0u8, 2]),
        );
        apply_ghost_shim(Version::new((2, 0)), &mut attrs);
        assert_eq!(attrs.point[0].name, "svtkGhostLevels");
    }

    #[test]
    fn abort_flag_stops_read() {
        let xml = image_xml(
            "1.0",
            r#"<Piece Extent="0 1 0 1 0 0">
                 <PointData>
                   <DataArray type="Float32" Name="u" format="ascii">1 2 3 4</DataArray>
                 </PointData>
               </Piece>"#,
        );
        let mut reader = XmlReader::from_str(&xml, None).unwrap();
        let abort = Arc::new(AtomicBool::new(true));
        reader.set_abort_handle(abort);
        assert!(matches!(reader.read(), Err(Error::Aborted)));
    }

    #[test]
    fn unstructured_merge_adjusts_indices() {
        let xml = r#"<VTKFile type="UnstructuredGrid" version="1.0" byte_order="LittleEndian">
            <UnstructuredGrid>
              <Piece NumberOfPoints="3" NumberOfCells="1">
                <Points>
                  <DataArray type="Float32" NumberOfComponents="3" format="ascii">
                    0 0 0 1 0 0 0 1 0
                  </DataArray>
                </Points>
                <Cells>
                  <DataArray type="Int32" Name="connectivity" format="ascii">0 1 2</DataArray>
                  <DataArray type="Int32" Name="offsets" format="ascii">3</DataArray>
                  <DataArray type="UInt8" Name="types" format="ascii">5</DataArray>
                </Cells>
              </Piece>
              <Piece NumberOfPoints="3" NumberOfCells="1">
                <Points>
                  <DataArray type="Float32" NumberOfComponents="3" format="ascii">
                    2 0 0 3 0 0 2 1 0
                  </DataArray>
                </Points>
                <Cells>
                  <DataArray type="Int32" Name="connectivity" format="ascii">0 1 2</DataArray>
                  <DataArray type="Int32" Name="offsets" format="ascii">3</DataArray>
                  <DataArray type="UInt8" Name="types" format="ascii">5</DataArray>
                </Cells>
              </Piece>
            </UnstructuredGrid>
          </VTKFile>"#;
        let mut reader = XmlReader::from_str(xml, None).unwrap();
        let out = reader.read().unwrap();
        match out.svtk.data {
            DataSet::UnstructuredGrid { pieces, .. } => {
                let Piece::Inline(piece) = &pieces[0] else { panic!() };
                assert_eq!(piece.num_points(), 6);
                assert_eq!(
                    piece.cells.topo.connectivity,
                    IOBuffer::U64(vec![0, 1, 2, 3, 4, 5])
                );
                assert_eq!(piece.cells.topo.offsets, IOBuffer::U64(vec![3, 6]));
                assert_eq!(piece.cells.types, vec![CellType::Triangle; 2]);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn table_rows() {
        let xml = r#"<VTKFile type="Table" version="1.0" byte_order="LittleEndian">
            <Table>
              <Piece NumberOfRows="3">
                <RowData>
                  <DataArray type="Int64" Name="id" format="ascii">7 8 9</DataArray>
                </RowData>
              </Piece>
            </Table>
          </VTKFile>"#;
        let mut reader = XmlReader::from_str(xml, None).unwrap();
        let out = reader.read().unwrap();
        match out.svtk.data {
            DataSet::Table { pieces, .. } => {
                let Piece::Inline(piece) = &pieces[0] else { panic!() };
                assert_eq!(piece.num_rows, 3);
                assert_eq!(piece.row_data[0].data, IOBuffer::I64(vec![7, 8, 9]));
            }
            _ => panic!(),
        }
    }
}
