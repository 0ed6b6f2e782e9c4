//!
//! Partitioned ("parallel") format reading.
//!
//! A `.pvti`/`.pvtp`/`.pvtr`/`.pvts`/`.pvtu`/`.pvtt` file is a summary: it
//! declares the whole dataset's schema and extent and references one serial
//! piece file per `<Piece Source="..."/>` entry. [`ParallelReader`] parses the
//! summary, splits the global piece range across a caller-specified
//! `(piece, num_pieces)` request, and loads only the assigned piece files
//! through nested [`XmlReader`] instances. Unassigned pieces surface as
//! [`Piece::Source`] placeholders so the output still lists every partition.
//!

use std::path::{Path, PathBuf};

use log::error;

use crate::model::{
    ArrayMetaData, Attributes, ByteOrder, Cells, DataArray, DataSet, Extent, IOBuffer, MetaData,
    Piece, PolyDataPiece, ScalarType, Svtk, TablePiece, Topology, UnstructuredGridPiece, Version,
};
use crate::reader::{self, ReadOutput, XmlReader};
use crate::select::ArraySelection;
use crate::xml::{DataSetKind, Document, Element, FileType};
use crate::Error;

/// Strategy for splitting the global piece range across requesters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum PieceDistribution {
    /// Each requester serves one contiguous run of piece indices.
    #[default]
    Block,
    /// Piece `i` belongs to requester `p` iff `(i - p) mod n == 0`.
    Interleave,
}

/// Contiguous index range served by requester `piece` of `num_pieces` over
/// `total` indices.
///
/// The first `total % num_pieces` requesters serve one extra index, so the
/// union over all requesters covers `0..total` exactly once.
pub fn block_range(piece: usize, num_pieces: usize, total: usize) -> std::ops::Range<usize> {
    let n = num_pieces.max(1);
    let block = total / n;
    let overflow = total % n;
    let start = (piece * block + piece.min(overflow)).min(total);
    let end = (start + block + usize::from(piece < overflow)).min(total);
    start..end
}

/// Whether index `i` belongs to requester `piece` under interleaving.
///
/// Computed with a signed euclidean remainder; `i < piece` must not flip the
/// sign of the test.
pub fn interleave_assigned(i: usize, piece: usize, num_pieces: usize) -> bool {
    let n = num_pieces.max(1) as i64;
    (i as i64 - piece as i64).rem_euclid(n) == 0
}

/// Reader for one partitioned summary file.
pub struct ParallelReader {
    path: PathBuf,
    kind: DataSetKind,
    version: Version,
    byte_order: ByteOrder,
    ghost_level: u32,
    meta: MetaData,
    whole_extent: Option<Extent>,
    origin: [f64; 3],
    spacing: [f64; 3],
    sources: Vec<(PathBuf, Option<Extent>)>,
    /// Lazily cached result of probing each piece file's header.
    can_read: Vec<Option<bool>>,

    pub point_selection: ArraySelection,
    pub cell_selection: ArraySelection,
    pub column_selection: ArraySelection,
    pub distribution: PieceDistribution,
    /// Optional subset of valid piece indices, applied before distribution.
    pub restriction: Option<Vec<usize>>,

    time_step: i32,
}

impl ParallelReader {
    /// Open and parse the summary file at `path`.
    ///
    /// Piece files are not touched until [`read`](Self::read) or
    /// [`can_read_piece`](Self::can_read_piece).
    pub fn from_path(path: impl AsRef<Path>) -> Result<ParallelReader, Error> {
        let path = path.as_ref();
        let expected = match FileType::try_from_path(path) {
            Some(FileType::Parallel(kind)) => Some(kind),
            _ => None,
        };
        let bytes = std::fs::read(path)?;
        let doc = Document::parse(&bytes)?;
        ParallelReader::new(doc, path.to_path_buf(), expected)
    }

    fn new(
        doc: Document,
        path: PathBuf,
        expected: Option<DataSetKind>,
    ) -> Result<ParallelReader, Error> {
        let root = &doc.root;
        let type_tag = root.attr("type").unwrap_or("").to_string();
        let kind = type_tag
            .strip_prefix('P')
            .and_then(DataSetKind::from_xml_tag)
            .filter(|k| *k != DataSetKind::HyperTreeGrid)
            .ok_or_else(|| Error::UnknownDataSetType(type_tag.clone()))?;
        if let Some(expected) = expected {
            if expected != kind {
                return Err(Error::UnexpectedDataSetType {
                    expected: expected.parallel_xml_tag().to_string(),
                    found: type_tag,
                });
            }
        }

        let version = reader::parse_version(root)?;
        let byte_order = match root.attr("byte_order").unwrap_or("LittleEndian") {
            "BigEndian" => ByteOrder::BigEndian,
            "LittleEndian" => ByteOrder::LittleEndian,
            other => return Err(Error::InvalidByteOrder(other.to_string())),
        };

        let primary = root
            .find(kind.parallel_xml_tag())
            .ok_or_else(|| Error::MissingSection(kind.parallel_xml_tag().to_string()))?;
        let ghost_level = primary.scalar_attr::<u32>("GhostLevel")?.unwrap_or(0);
        let whole_extent = if kind.is_structured() {
            Some(reader::required_extent(primary, "WholeExtent")?)
        } else {
            None
        };
        let origin = reader::triple(primary, "Origin", [0.0; 3])?;
        let spacing = reader::triple(primary, "Spacing", [1.0; 3])?;

        let mut meta = MetaData {
            ghost_level,
            ..Default::default()
        };
        let mut point_selection = ArraySelection::new();
        let mut cell_selection = ArraySelection::new();
        let mut column_selection = ArraySelection::new();
        if let Some(el) = primary.find("PPointData") {
            meta.point_arrays = summary_arrays(el, &mut point_selection)?;
        }
        if let Some(el) = primary.find("PCellData") {
            meta.cell_arrays = summary_arrays(el, &mut cell_selection)?;
        }
        if let Some(el) = primary.find("PRowData") {
            meta.row_arrays = summary_arrays(el, &mut column_selection)?;
        }

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut sources = Vec::new();
        for piece_el in primary.children_named("Piece") {
            let Some(source) = piece_el.attr("Source") else {
                continue;
            };
            let source = PathBuf::from(source);
            let resolved = if source.is_absolute() {
                source
            } else {
                dir.join(source)
            };
            let extent = match piece_el.vector_attr::<i32>("Extent")? {
                Some(v) if v.len() == 6 => Some(Extent([v[0]..=v[1], v[2]..=v[3], v[4]..=v[5]])),
                _ => None,
            };
            sources.push((resolved, extent));
        }

        let can_read = vec![None; sources.len()];
        Ok(ParallelReader {
            path,
            kind,
            version,
            byte_order,
            ghost_level,
            meta,
            whole_extent,
            origin,
            spacing,
            sources,
            can_read,
            point_selection,
            cell_selection,
            column_selection,
            distribution: PieceDistribution::default(),
            restriction: None,
            time_step: 0,
        })
    }

    pub fn kind(&self) -> DataSetKind {
        self.kind
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn ghost_level(&self) -> u32 {
        self.ghost_level
    }

    /// The schema declared by the summary, without reading any piece file.
    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    /// Number of piece files the summary references.
    pub fn num_pieces(&self) -> usize {
        self.sources.len()
    }

    pub fn piece_path(&self, index: usize) -> Option<&Path> {
        self.sources.get(index).map(|(p, _)| p.as_path())
    }

    pub fn set_time_step(&mut self, step: i32) {
        self.time_step = step;
    }

    /// Whether the piece file at `index` exists and parses as the expected
    /// kind. The result is cached per index.
    pub fn can_read_piece(&mut self, index: usize) -> bool {
        let Some(slot) = self.can_read.get(index) else {
            return false;
        };
        if let Some(cached) = slot {
            return *cached;
        }
        let path = self.sources[index].0.clone();
        let ok = match XmlReader::from_path(&path) {
            Ok(r) => r.kind() == self.kind,
            Err(e) => {
                error!("piece file {:?} cannot be read: {}", path, e);
                false
            }
        };
        self.can_read[index] = Some(ok);
        ok
    }

    /// Union each piece file's discovered array names into this reader's
    /// selections, opening only file headers.
    ///
    /// Piece files that fail to parse are logged and skipped.
    pub fn discover_piece_arrays(&mut self) {
        for i in 0..self.sources.len() {
            if !self.can_read_piece(i) {
                continue;
            }
            let path = self.sources[i].0.clone();
            match XmlReader::from_path(&path) {
                Ok(piece) => {
                    self.point_selection.union(&piece.point_selection);
                    self.cell_selection.union(&piece.cell_selection);
                    self.column_selection.union(&piece.column_selection);
                }
                Err(e) => error!("piece file {:?} cannot be read: {}", path, e),
            }
        }
    }

    /// Global piece indices requester `piece` of `num_pieces` serves.
    ///
    /// An active [`restriction`](Self::restriction) first narrows the index
    /// universe; the distribution then runs over positions within that
    /// subset, so restricting to `k` pieces partitions exactly like a file
    /// with `k` pieces.
    pub fn assigned_pieces(&self, piece: usize, num_pieces: usize) -> Vec<usize> {
        let total = self.sources.len();
        let universe: Vec<usize> = match &self.restriction {
            Some(r) => r.iter().copied().filter(|&i| i < total).collect(),
            None => (0..total).collect(),
        };
        match self.distribution {
            PieceDistribution::Block => block_range(piece, num_pieces, universe.len())
                .map(|pos| universe[pos])
                .collect(),
            PieceDistribution::Interleave => universe
                .iter()
                .enumerate()
                .filter(|(pos, _)| interleave_assigned(*pos, piece, num_pieces))
                .map(|(_, &i)| i)
                .collect(),
        }
    }

    /// Read the pieces assigned to `(piece, num_pieces)`.
    ///
    /// Loaded pieces appear inline in declaration order; pieces outside the
    /// assignment stay as [`Piece::Source`] placeholders. A piece file that
    /// fails to load is logged, reported through
    /// [`ReadOutput::data_error`] and left as a placeholder.
    pub fn read(&mut self, piece: usize, num_pieces: usize) -> Result<ReadOutput, Error> {
        let assigned = self.assigned_pieces(piece, num_pieces);
        let mut data_error = false;
        let mut field_data = Vec::new();

        let data = match self.kind {
            DataSetKind::ImageData => {
                let extent = self.required_whole_extent()?;
                DataSet::ImageData {
                    extent,
                    origin: self.origin,
                    spacing: self.spacing,
                    meta: Some(Box::new(self.meta.clone())),
                    pieces: self.load_pieces(
                        &assigned,
                        |data| match data {
                            DataSet::ImageData { pieces, .. } => Some(pieces),
                            _ => None,
                        },
                        &mut field_data,
                        &mut data_error,
                    ),
                }
            }
            DataSetKind::RectilinearGrid => {
                let extent = self.required_whole_extent()?;
                DataSet::RectilinearGrid {
                    extent,
                    meta: Some(Box::new(self.meta.clone())),
                    pieces: self.load_pieces(
                        &assigned,
                        |data| match data {
                            DataSet::RectilinearGrid { pieces, .. } => Some(pieces),
                            _ => None,
                        },
                        &mut field_data,
                        &mut data_error,
                    ),
                }
            }
            DataSetKind::StructuredGrid => {
                let extent = self.required_whole_extent()?;
                DataSet::StructuredGrid {
                    extent,
                    meta: Some(Box::new(self.meta.clone())),
                    pieces: self.load_pieces(
                        &assigned,
                        |data| match data {
                            DataSet::StructuredGrid { pieces, .. } => Some(pieces),
                            _ => None,
                        },
                        &mut field_data,
                        &mut data_error,
                    ),
                }
            }
            DataSetKind::PolyData => DataSet::PolyData {
                meta: Some(Box::new(self.meta.clone())),
                pieces: self.load_pieces(
                    &assigned,
                    |data| match data {
                        DataSet::PolyData { pieces, .. } => Some(pieces),
                        _ => None,
                    },
                    &mut field_data,
                    &mut data_error,
                ),
            },
            DataSetKind::UnstructuredGrid => DataSet::UnstructuredGrid {
                meta: Some(Box::new(self.meta.clone())),
                pieces: self.load_pieces(
                    &assigned,
                    |data| match data {
                        DataSet::UnstructuredGrid { pieces, .. } => Some(pieces),
                        _ => None,
                    },
                    &mut field_data,
                    &mut data_error,
                ),
            },
            DataSetKind::Table => DataSet::Table {
                meta: Some(Box::new(self.meta.clone())),
                pieces: self.load_pieces(
                    &assigned,
                    |data| match data {
                        DataSet::Table { pieces, .. } => Some(pieces),
                        _ => None,
                    },
                    &mut field_data,
                    &mut data_error,
                ),
            },
            // Rejected at construction.
            DataSetKind::HyperTreeGrid => {
                return Err(Error::UnknownDataSetType("PHyperTreeGrid".to_string()))
            }
        };

        Ok(ReadOutput {
            svtk: Svtk {
                version: self.version,
                byte_order: self.byte_order,
                file_path: Some(self.path.clone()),
                field_data,
                data,
            },
            data_error,
        })
    }

    /// Read the assigned pieces and concatenate them into a single piece.
    ///
    /// Supported for the unstructured kinds and tables, where concatenation
    /// is well defined: points and attribute arrays are appended in piece
    /// order, connectivity indices are shifted by the accumulated point
    /// count, and offsets by the accumulated connectivity length. Structured
    /// kinds are returned unmerged since their pieces tile an extent rather
    /// than a range. Placeholder pieces are skipped.
    pub fn read_merged(&mut self, piece: usize, num_pieces: usize) -> Result<ReadOutput, Error> {
        let mut out = self.read(piece, num_pieces)?;
        match &mut out.svtk.data {
            DataSet::UnstructuredGrid { pieces, .. } => {
                let merged = merge_unstructured(std::mem::take(pieces), &mut out.data_error);
                pieces.push(Piece::Inline(Box::new(merged)));
            }
            DataSet::PolyData { pieces, .. } => {
                let merged = merge_poly_data(std::mem::take(pieces), &mut out.data_error);
                pieces.push(Piece::Inline(Box::new(merged)));
            }
            DataSet::Table { pieces, .. } => {
                let merged = merge_table(std::mem::take(pieces), &mut out.data_error);
                pieces.push(Piece::Inline(Box::new(merged)));
            }
            _ => {}
        }
        Ok(out)
    }

    fn required_whole_extent(&self) -> Result<Extent, Error> {
        self.whole_extent.clone().ok_or_else(|| {
            Error::XML(crate::xml::Error::MissingAttribute("WholeExtent".to_string()))
        })
    }

    /// Load the assigned piece files, collecting their inline pieces in
    /// declaration order.
    fn load_pieces<P>(
        &mut self,
        assigned: &[usize],
        extract: impl Fn(DataSet) -> Option<Vec<Piece<P>>>,
        field_data: &mut Vec<DataArray>,
        data_error: &mut bool,
    ) -> Vec<Piece<P>> {
        let mut out = Vec::new();
        for i in 0..self.sources.len() {
            let (path, extent) = self.sources[i].clone();
            if !assigned.contains(&i) {
                out.push(Piece::Source(path, extent));
                continue;
            }
            if !self.can_read_piece(i) {
                *data_error = true;
                out.push(Piece::Source(path, extent));
                continue;
            }
            match self.read_piece_file(&path) {
                Ok(piece_out) => {
                    *data_error |= piece_out.data_error;
                    if field_data.is_empty() {
                        *field_data = piece_out.svtk.field_data;
                    }
                    match extract(piece_out.svtk.data) {
                        Some(pieces) => out.extend(pieces),
                        None => {
                            error!(
                                "piece file {:?} holds a different data set kind than its summary",
                                path
                            );
                            *data_error = true;
                            out.push(Piece::Source(path, extent));
                        }
                    }
                }
                Err(e) => {
                    error!("piece file {:?} failed to load: {}", path, e);
                    *data_error = true;
                    out.push(Piece::Source(path, extent));
                }
            }
        }
        out
    }

    fn read_piece_file(&self, path: &Path) -> Result<ReadOutput, Error> {
        let mut piece = XmlReader::from_path(path)?;
        piece.point_selection.copy_from(&self.point_selection);
        piece.cell_selection.copy_from(&self.cell_selection);
        piece.column_selection.copy_from(&self.column_selection);
        piece.set_time_step(self.time_step);
        piece.read()
    }
}

/// Parse a `PPointData`/`PCellData`/`PRowData` section's `PDataArray`
/// descriptors, recording each name in `selection`.
fn summary_arrays(
    el: &Element,
    selection: &mut ArraySelection,
) -> Result<Vec<ArrayMetaData>, Error> {
    let mut out = Vec::new();
    for arr in el.children_named("PDataArray") {
        let name = arr.attr("Name").unwrap_or("").to_string();
        let type_tag = arr.attr("type").unwrap_or("");
        let scalar_type = ScalarType::from_xml_tag(type_tag)
            .ok_or(Error::Decode(crate::decode::Error::UnknownScalarType(
                type_tag.to_string(),
            )))?;
        let num_comp = arr.scalar_attr::<u32>("NumberOfComponents")?.unwrap_or(1);
        selection.discover(&name);
        out.push(ArrayMetaData {
            name,
            num_comp,
            scalar_type,
        });
    }
    Ok(out)
}

/// Append `src` onto `dst` when both hold the same scalar type.
fn append_values(dst: &mut IOBuffer, src: IOBuffer) -> bool {
    macro_rules! append_same {
        ($($v:ident),*) => {
            match (dst, src) {
                $((IOBuffer::$v(d), IOBuffer::$v(s)) => {
                    d.extend(s);
                    true
                })*
                _ => false,
            }
        };
    }
    append_same!(U8, I8, U16, I16, U32, I32, U64, I64, F32, F64, Str)
}

fn append_arrays(dst: &mut Vec<DataArray>, src: Vec<DataArray>, data_error: &mut bool) {
    for array in src {
        match dst.iter_mut().find(|a| a.name == array.name) {
            Some(existing) => {
                if !append_values(&mut existing.data, array.data) {
                    error!(
                        "array {:?} changes scalar type between pieces; dropped",
                        existing.name
                    );
                    *data_error = true;
                }
            }
            None => dst.push(array),
        }
    }
}

/// Shift a topology's indices into the merged index space and append it.
fn append_topology(
    dst: &mut Topology,
    src: Topology,
    point_offset: u64,
    data_error: &mut bool,
) {
    let conn_base = dst.connectivity.len() as u64;
    match (src.connectivity.cast_to_u64(), src.offsets.cast_to_u64()) {
        (Some(conn), Some(offsets)) => {
            let shifted_conn: Vec<u64> = conn.into_iter().map(|i| i + point_offset).collect();
            let shifted_offsets: Vec<u64> = offsets.into_iter().map(|o| o + conn_base).collect();
            if !append_values(&mut dst.connectivity, IOBuffer::U64(shifted_conn))
                || !append_values(&mut dst.offsets, IOBuffer::U64(shifted_offsets))
            {
                *data_error = true;
            }
        }
        _ => {
            error!("piece topology holds non-integer index arrays; dropped");
            *data_error = true;
        }
    }
}

fn merge_unstructured(
    pieces: Vec<Piece<UnstructuredGridPiece>>,
    data_error: &mut bool,
) -> UnstructuredGridPiece {
    let mut out = UnstructuredGridPiece {
        points: IOBuffer::U64(Vec::new()),
        cells: Cells {
            topo: Topology {
                connectivity: IOBuffer::U64(Vec::new()),
                offsets: IOBuffer::U64(Vec::new()),
            },
            types: Vec::new(),
        },
        data: Attributes::new(),
    };
    let mut first = true;
    let mut point_offset = 0u64;
    for piece in pieces {
        let Piece::Inline(piece) = piece else {
            continue;
        };
        let piece = *piece;
        let num_points = piece.num_points() as u64;
        if first {
            out.points = piece.points;
            first = false;
        } else if !append_values(&mut out.points, piece.points) {
            error!("piece points change scalar type between pieces; dropped");
            *data_error = true;
        }
        append_topology(&mut out.cells.topo, piece.cells.topo, point_offset, data_error);
        out.cells.types.extend(piece.cells.types);
        append_arrays(&mut out.data.point, piece.data.point, data_error);
        append_arrays(&mut out.data.cell, piece.data.cell, data_error);
        point_offset += num_points;
    }
    out
}

fn merge_poly_data(pieces: Vec<Piece<PolyDataPiece>>, data_error: &mut bool) -> PolyDataPiece {
    fn merge_topo(
        dst: &mut Option<Topology>,
        src: Option<Topology>,
        point_offset: u64,
        data_error: &mut bool,
    ) {
        let Some(src) = src else { return };
        let dst = dst.get_or_insert_with(|| Topology {
            connectivity: IOBuffer::U64(Vec::new()),
            offsets: IOBuffer::U64(Vec::new()),
        });
        append_topology(dst, src, point_offset, data_error);
    }

    let mut out = PolyDataPiece {
        points: IOBuffer::U64(Vec::new()),
        ..Default::default()
    };
    let mut first = true;
    let mut point_offset = 0u64;
    for piece in pieces {
        let Piece::Inline(piece) = piece else {
            continue;
        };
        let piece = *piece;
        let num_points = piece.num_points() as u64;
        if first {
            out.points = piece.points;
            first = false;
        } else if !append_values(&mut out.points, piece.points) {
            error!("piece points change scalar type between pieces; dropped");
            *data_error = true;
        }
        merge_topo(&mut out.verts, piece.verts, point_offset, data_error);
        merge_topo(&mut out.lines, piece.lines, point_offset, data_error);
        merge_topo(&mut out.strips, piece.strips, point_offset, data_error);
        merge_topo(&mut out.polys, piece.polys, point_offset, data_error);
        append_arrays(&mut out.data.point, piece.data.point, data_error);
        append_arrays(&mut out.data.cell, piece.data.cell, data_error);
        point_offset += num_points;
    }
    out
}

fn merge_table(pieces: Vec<Piece<TablePiece>>, data_error: &mut bool) -> TablePiece {
    let mut out = TablePiece::default();
    for piece in pieces {
        let Piece::Inline(piece) = piece else {
            continue;
        };
        let piece = *piece;
        out.num_rows += piece.num_rows;
        append_arrays(&mut out.row_data, piece.row_data, data_error);
    }
    out
}
