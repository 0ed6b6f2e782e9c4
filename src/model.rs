//! In-memory model of SVTK data sets.
//!
//! The reader populates these types; they intentionally mirror the on-disk
//! structure of the XML formats (data sets split into pieces, attribute data
//! stored as flat typed buffers) rather than any rendering-oriented layout.

use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use num_derive::FromPrimitive;

/// Error type describing failure modes of model processing and piece loading.
#[derive(Debug)]
pub enum Error {
    InvalidCast(std::io::Error),
    MissingPieceData,
    PieceTypeMismatch,
    IO(std::io::Error),
    SVTKIO(Box<crate::Error>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidCast(source) => write!(f, "Invalid cast error: {:?}", source),
            Error::MissingPieceData => write!(f, "Missing piece data"),
            Error::PieceTypeMismatch => {
                write!(f, "Piece data set type differs from the referencing data set")
            }
            Error::IO(source) => write!(f, "IO error: {:?}", source),
            Error::SVTKIO(source) => write!(f, "SVTK IO error: {:?}", source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidCast(source) => Some(source),
            Error::IO(source) => Some(source),
            Error::SVTKIO(source) => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<crate::Error> for Error {
    fn from(e: crate::Error) -> Error {
        Error::SVTKIO(Box::new(e))
    }
}

/// Root model of one SVTK XML file.
#[derive(Clone, PartialEq, Debug)]
pub struct Svtk {
    pub version: Version,
    pub byte_order: ByteOrder,
    /// Path to the file this model was loaded from, if any.
    ///
    /// Used to resolve relative piece and block `Source` paths.
    pub file_path: Option<PathBuf>,
    /// Arrays from the optional `FieldData` section of the primary element.
    pub field_data: Vec<DataArray>,
    pub data: DataSet,
}

/// File format version pair (e.g. `1.0 => Version { major: 1, minor: 0 }`).
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub fn new(pair: (u8, u8)) -> Self {
        Version {
            major: pair.0,
            minor: pair.1,
        }
    }
}

impl From<(u8, u8)> for Version {
    fn from(pair: (u8, u8)) -> Self {
        Version::new(pair)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Byte order declared once per file.
///
/// Applies uniformly to header words and raw binary payloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// Data loaded from either binary or ascii format.
#[derive(Clone, PartialEq, Debug)]
pub enum IOBuffer {
    /// Bit array stored packed in 8 bit chunks, most significant bit first.
    Bit(Vec<u8>),
    /// Vector of unsigned bytes.
    U8(Vec<u8>),
    /// Vector of signed bytes.
    I8(Vec<i8>),
    /// Vector of unsigned short integers `u16`.
    U16(Vec<u16>),
    /// Vector of signed short integers `i16`.
    I16(Vec<i16>),
    /// Vector of unsigned integers `u32`.
    U32(Vec<u32>),
    /// Vector of signed integers `i32`.
    I32(Vec<i32>),
    /// Vector of unsigned long integers `u64`.
    U64(Vec<u64>),
    /// Vector of signed long integers `i64`.
    I64(Vec<i64>),
    /// Vector of single precision floats.
    F32(Vec<f32>),
    /// Vector of double precision floats.
    F64(Vec<f64>),
    /// Vector of strings, stored on disk as NUL terminated byte runs.
    Str(Vec<String>),
}

impl Default for IOBuffer {
    fn default() -> IOBuffer {
        IOBuffer::F32(Vec::new())
    }
}

macro_rules! impl_io_buffer_convert {
    ($t:ident <=> $v:ident) => {
        impl From<Vec<$t>> for IOBuffer {
            fn from(v: Vec<$t>) -> IOBuffer {
                IOBuffer::$v(v)
            }
        }

        impl std::iter::FromIterator<$t> for IOBuffer {
            fn from_iter<T>(iter: T) -> Self
            where
                T: IntoIterator<Item = $t>,
            {
                iter.into_iter().collect::<Vec<$t>>().into()
            }
        }
    };
}

impl_io_buffer_convert!(u8 <=> U8);
impl_io_buffer_convert!(i8 <=> I8);
impl_io_buffer_convert!(u16 <=> U16);
impl_io_buffer_convert!(i16 <=> I16);
impl_io_buffer_convert!(u32 <=> U32);
impl_io_buffer_convert!(i32 <=> I32);
impl_io_buffer_convert!(u64 <=> U64);
impl_io_buffer_convert!(i64 <=> I64);
impl_io_buffer_convert!(f32 <=> F32);
impl_io_buffer_convert!(f64 <=> F64);

/// Evaluate the expression `$e` given a `Vec` `$v` of any stored element type.
#[macro_export]
macro_rules! match_buf {
    ($buf:expr; $v:pat => $e:expr) => {
        match $buf {
            $crate::model::IOBuffer::Bit($v) => $e,
            $crate::model::IOBuffer::U8($v) => $e,
            $crate::model::IOBuffer::I8($v) => $e,
            $crate::model::IOBuffer::U16($v) => $e,
            $crate::model::IOBuffer::I16($v) => $e,
            $crate::model::IOBuffer::U32($v) => $e,
            $crate::model::IOBuffer::I32($v) => $e,
            $crate::model::IOBuffer::U64($v) => $e,
            $crate::model::IOBuffer::I64($v) => $e,
            $crate::model::IOBuffer::F32($v) => $e,
            $crate::model::IOBuffer::F64($v) => $e,
            $crate::model::IOBuffer::Str($v) => $e,
        }
    };
}

macro_rules! impl_bytes_constructor {
    ($bytes:ident, $bo:ident, $read:ident, $t:ident, $variant:ident) => {{
        use byteorder::ReadBytesExt;
        let mut out = vec![num_traits::Zero::zero(); $bytes.len() / std::mem::size_of::<$t>()];
        let mut reader = std::io::Cursor::new($bytes);
        match $bo {
            ByteOrder::BigEndian => reader
                .$read::<byteorder::BE>(out.as_mut_slice())
                .map_err(Error::InvalidCast)?,
            ByteOrder::LittleEndian => reader
                .$read::<byteorder::LE>(out.as_mut_slice())
                .map_err(Error::InvalidCast)?,
        }
        Ok(IOBuffer::$variant(out))
    }};
}

impl IOBuffer {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            IOBuffer::Bit(_) => ScalarType::Bit,
            IOBuffer::U8(_) => ScalarType::U8,
            IOBuffer::I8(_) => ScalarType::I8,
            IOBuffer::U16(_) => ScalarType::U16,
            IOBuffer::I16(_) => ScalarType::I16,
            IOBuffer::U32(_) => ScalarType::U32,
            IOBuffer::I32(_) => ScalarType::I32,
            IOBuffer::U64(_) => ScalarType::U64,
            IOBuffer::I64(_) => ScalarType::I64,
            IOBuffer::F32(_) => ScalarType::F32,
            IOBuffer::F64(_) => ScalarType::F64,
            IOBuffer::Str(_) => ScalarType::Str,
        }
    }

    /// Raw length of the underlying storage vector.
    ///
    /// For `Bit` buffers this is a number of bytes, not bits.
    pub fn len(&self) -> usize {
        match_buf!(self; v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Construct a zero-initialized buffer sized to hold `n` values of the
    /// given scalar type.
    ///
    /// `Bit` buffers allocate `(n + 7) / 8` packed bytes.
    pub fn allocate(scalar_type: ScalarType, n: usize) -> Self {
        match scalar_type {
            ScalarType::Bit => IOBuffer::Bit(vec![0u8; (n + 7) / 8]),
            ScalarType::U8 => IOBuffer::U8(vec![0; n]),
            ScalarType::I8 => IOBuffer::I8(vec![0; n]),
            ScalarType::U16 => IOBuffer::U16(vec![0; n]),
            ScalarType::I16 => IOBuffer::I16(vec![0; n]),
            ScalarType::U32 => IOBuffer::U32(vec![0; n]),
            ScalarType::I32 => IOBuffer::I32(vec![0; n]),
            ScalarType::U64 => IOBuffer::U64(vec![0; n]),
            ScalarType::I64 => IOBuffer::I64(vec![0; n]),
            ScalarType::F32 => IOBuffer::F32(vec![0.0; n]),
            ScalarType::F64 => IOBuffer::F64(vec![0.0; n]),
            ScalarType::Str => IOBuffer::Str(vec![String::new(); n]),
        }
    }

    /// Construct an `IOBuffer` from a `Vec` of bytes and a corresponding scalar type.
    pub fn from_bytes(bytes: Vec<u8>, scalar_type: ScalarType, bo: ByteOrder) -> Result<Self, Error> {
        match scalar_type {
            ScalarType::Bit => Ok(IOBuffer::Bit(bytes)),
            ScalarType::I8 => Ok(IOBuffer::I8(bytemuck::cast_vec(bytes))),
            ScalarType::U8 => Ok(IOBuffer::U8(bytes)),
            ScalarType::I16 => IOBuffer::i16_from_bytes(bytes, bo),
            ScalarType::U16 => IOBuffer::u16_from_bytes(bytes, bo),
            ScalarType::I32 => IOBuffer::i32_from_bytes(bytes, bo),
            ScalarType::U32 => IOBuffer::u32_from_bytes(bytes, bo),
            ScalarType::I64 => IOBuffer::i64_from_bytes(bytes, bo),
            ScalarType::U64 => IOBuffer::u64_from_bytes(bytes, bo),
            ScalarType::F32 => IOBuffer::f32_from_bytes(bytes, bo),
            ScalarType::F64 => IOBuffer::f64_from_bytes(bytes, bo),
            ScalarType::Str => Ok(IOBuffer::Str(
                bytes
                    .split(|&b| b == 0)
                    .filter(|s| !s.is_empty())
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect(),
            )),
        }
    }

    /// Construct an `IOBuffer` with `u16` elements from the given `Vec` of bytes.
    pub fn u16_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_u16_into, u16, U16)
    }
    /// Construct an `IOBuffer` with `i16` elements from the given `Vec` of bytes.
    pub fn i16_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_i16_into, i16, I16)
    }
    /// Construct an `IOBuffer` with `u32` elements from the given `Vec` of bytes.
    pub fn u32_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_u32_into, u32, U32)
    }
    /// Construct an `IOBuffer` with `i32` elements from the given `Vec` of bytes.
    pub fn i32_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_i32_into, i32, I32)
    }
    /// Construct an `IOBuffer` with `u64` elements from the given `Vec` of bytes.
    pub fn u64_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_u64_into, u64, U64)
    }
    /// Construct an `IOBuffer` with `i64` elements from the given `Vec` of bytes.
    pub fn i64_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_i64_into, i64, I64)
    }
    /// Construct an `IOBuffer` with `f32` elements from the given `Vec` of bytes.
    pub fn f32_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_f32_into, f32, F32)
    }
    /// Construct an `IOBuffer` with `f64` elements from the given `Vec` of bytes.
    pub fn f64_from_bytes(bytes: Vec<u8>, bo: ByteOrder) -> Result<Self, Error> {
        impl_bytes_constructor!(bytes, bo, read_f64_into, f64, F64)
    }

    /// Returns an iterator over elements with type `T`.
    ///
    /// Returns `None` if `T` does not match the stored element type.
    pub fn iter<T: Scalar>(&self) -> Option<std::slice::Iter<T>> {
        T::io_buf_vec_ref(self).map(|v| v.iter())
    }

    /// Converts this buffer into the underlying `Vec` representation.
    ///
    /// Returns `None` if `T` does not match the stored element type.
    pub fn into_vec<T: Scalar>(self) -> Option<Vec<T>> {
        T::io_buf_into_vec(self)
    }

    /// Borrows the underlying `Vec` if `T` matches the stored element type.
    pub fn as_slice<T: Scalar>(&self) -> Option<&[T]> {
        T::io_buf_vec_ref(self).map(|v| v.as_slice())
    }

    /// Casts integer contents to `u64`, returning `None` for other buffers.
    ///
    /// Used where the file declares an integer array whose exact width is
    /// writer-dependent (e.g. per-level vertex counts, connectivity offsets).
    pub fn cast_to_u64(&self) -> Option<Vec<u64>> {
        match self {
            IOBuffer::U8(v) => Some(v.iter().map(|&x| x as u64).collect()),
            IOBuffer::I8(v) => Some(v.iter().map(|&x| x as u64).collect()),
            IOBuffer::U16(v) => Some(v.iter().map(|&x| x as u64).collect()),
            IOBuffer::I16(v) => Some(v.iter().map(|&x| x as u64).collect()),
            IOBuffer::U32(v) => Some(v.iter().map(|&x| x as u64).collect()),
            IOBuffer::I32(v) => Some(v.iter().map(|&x| x as u64).collect()),
            IOBuffer::U64(v) => Some(v.clone()),
            IOBuffer::I64(v) => Some(v.iter().map(|&x| x as u64).collect()),
            _ => None,
        }
    }
}

/// Types which may be stored in an `IOBuffer`.
pub trait Scalar
where
    Self: Sized,
{
    fn io_buf_vec_ref(io_buf: &IOBuffer) -> Option<&Vec<Self>>;
    fn io_buf_vec_mut(io_buf: &mut IOBuffer) -> Option<&mut Vec<Self>>;
    fn io_buf_into_vec(io_buf: IOBuffer) -> Option<Vec<Self>>;
}

macro_rules! impl_scalar {
    ($t:ty, $v:ident) => {
        impl Scalar for $t {
            fn io_buf_vec_ref(io_buf: &IOBuffer) -> Option<&Vec<Self>> {
                match io_buf {
                    IOBuffer::$v(v) => Some(v),
                    _ => None,
                }
            }
            fn io_buf_vec_mut(io_buf: &mut IOBuffer) -> Option<&mut Vec<Self>> {
                match io_buf {
                    IOBuffer::$v(v) => Some(v),
                    _ => None,
                }
            }
            fn io_buf_into_vec(io_buf: IOBuffer) -> Option<Vec<Self>> {
                match io_buf {
                    IOBuffer::$v(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_scalar!(u8, U8);
impl_scalar!(i8, I8);
impl_scalar!(u16, U16);
impl_scalar!(i16, I16);
impl_scalar!(u32, U32);
impl_scalar!(i32, I32);
impl_scalar!(u64, U64);
impl_scalar!(i64, I64);
impl_scalar!(f32, F32);
impl_scalar!(f64, F64);
impl_scalar!(String, Str);

impl std::fmt::Display for IOBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match_buf!(self; v => {
            let mut iter = v.iter();
            if let Some(next) = iter.next() {
                write!(f, "{}", next)?;
                for i in iter {
                    write!(f, " {}", i)?;
                }
            }
        });
        Ok(())
    }
}

/// A fixed-length sequence of bits packed 8 per byte, most significant first.
///
/// Matches the on-disk layout of `Bit` arrays, so a decoded `IOBuffer::Bit`
/// converts without copying.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct BitArray {
    bytes: Vec<u8>,
    len: usize,
}

impl BitArray {
    /// A zero-initialized bit array holding `len` bits.
    pub fn zeros(len: usize) -> Self {
        BitArray {
            bytes: vec![0u8; (len + 7) / 8],
            len,
        }
    }

    /// Wrap packed bytes, keeping only the first `len` bits addressable.
    pub fn from_packed(bytes: Vec<u8>, len: usize) -> Self {
        debug_assert!(bytes.len() * 8 >= len);
        BitArray { bytes, len }
    }

    pub fn from_bools(bits: &[bool]) -> Self {
        let mut out = BitArray::zeros(bits.len());
        for (i, &b) in bits.iter().enumerate() {
            out.set(i, b);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bit at `i`; indices past the end read as 0.
    pub fn get(&self, i: usize) -> bool {
        if i >= self.len {
            return false;
        }
        (self.bytes[i / 8] >> (7 - (i % 8))) & 1 == 1
    }

    pub fn set(&mut self, i: usize, value: bool) {
        debug_assert!(i < self.len);
        let mask = 1u8 << (7 - (i % 8));
        if value {
            self.bytes[i / 8] |= mask;
        } else {
            self.bytes[i / 8] &= !mask;
        }
    }

    pub fn count_ones(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i)).count()
    }
}

/// A named array of tuples with a fixed number of components.
///
/// Components of one tuple are stored contiguously in `data`.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct DataArray {
    /// The name of the data array.
    pub name: String,
    /// Number of components per tuple.
    pub num_comp: u32,
    /// A contiguous typed storage buffer holding the actual values.
    pub data: IOBuffer,
}

impl DataArray {
    /// Construct an empty generic array with the given number of components.
    pub fn new(name: impl Into<String>, num_comp: u32) -> Self {
        DataArray {
            name: name.into(),
            num_comp,
            data: IOBuffer::default(),
        }
    }

    /// Set the data of this named array to the given buffer.
    pub fn with_data(mut self, data: impl Into<IOBuffer>) -> Self {
        self.data = data.into();
        self
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.data.scalar_type()
    }

    /// Raw length of the underlying buffer (`num_tuples * num_comp`).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of tuples stored by this array.
    pub fn num_tuples(&self) -> usize {
        if self.num_comp == 0 {
            0
        } else {
            self.len() / self.num_comp as usize
        }
    }
}

/// Point and cell attribute arrays of one piece.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Attributes {
    pub point: Vec<DataArray>,
    pub cell: Vec<DataArray>,
}

impl Attributes {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn find_point(&self, name: &str) -> Option<&DataArray> {
        self.point.iter().find(|a| a.name == name)
    }

    pub fn find_cell(&self, name: &str) -> Option<&DataArray> {
        self.cell.iter().find(|a| a.name == name)
    }
}

/// Cell connectivity as stored in XML formats.
///
/// `connectivity` is a contiguous array of all cells' point lists; `offsets`
/// marks the end of each cell as an index into `connectivity`.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Topology {
    pub connectivity: IOBuffer,
    pub offsets: IOBuffer,
}

impl Topology {
    /// Number of cells described by this topology.
    pub fn num_cells(&self) -> usize {
        self.offsets.len()
    }
}

/// Cells with per-cell types, the `Cells` XML element.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Cells {
    pub topo: Topology,
    /// The type of each cell in `topo`, parallel to `topo.offsets`.
    pub types: Vec<CellType>,
}

impl Cells {
    pub fn num_cells(&self) -> usize {
        self.types.len()
    }
}

/// This enum describes the types of cells representable by SVTK files.
#[derive(Copy, Clone, PartialEq, Debug, FromPrimitive)]
pub enum CellType {
    Vertex = 1,
    PolyVertex = 2,
    Line = 3,
    PolyLine = 4,
    Triangle = 5,
    TriangleStrip = 6,
    Polygon = 7,
    Pixel = 8,
    Quad = 9,
    Tetra = 10,
    Voxel = 11,
    Hexahedron = 12,
    Wedge = 13,
    Pyramid = 14,
    QuadraticEdge = 21,
    QuadraticTriangle = 22,
    QuadraticQuad = 23,
    QuadraticTetra = 24,
    QuadraticHexahedron = 25,
}

/// Point coordinates on a rectilinear grid along the `x`, `y` and `z` axes.
///
/// Corresponds to the `Coordinates` element, whose three child arrays are
/// addressed positionally (child 0 is `x`, 1 is `y`, 2 is `z`).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Coordinates {
    pub x: IOBuffer,
    pub y: IOBuffer,
    pub z: IOBuffer,
}

/// An extent for structured data as a triplet of inclusive index ranges.
///
/// `[ x0..=x1, y0..=y1, z0..=z1 ]` gives the extent between `x0` and `x1`
/// in the `x` dimension and similar for `y` and `z`.
#[derive(Clone, PartialEq, Debug)]
pub struct Extent(pub [RangeInclusive<i32>; 3]);

impl Default for Extent {
    fn default() -> Extent {
        Extent([0..=0, 0..=0, 0..=0])
    }
}

impl Extent {
    /// Point dimensions `[x1-x0+1, y1-y0+1, z1-z0+1]`, clamped at zero.
    pub fn dims(&self) -> [u64; 3] {
        let dist = |r: &RangeInclusive<i32>| (r.end() - r.start() + 1).max(0) as u64;
        [dist(&self.0[0]), dist(&self.0[1]), dist(&self.0[2])]
    }

    /// Total number of points represented by this extent.
    pub fn num_points(&self) -> u64 {
        let [nx, ny, nz] = self.dims();
        nx * ny * nz
    }

    /// Total number of cells represented by this extent.
    ///
    /// Degenerate (flat) dimensions count as a single layer of cells.
    pub fn num_cells(&self) -> u64 {
        let [nx, ny, nz] = self.dims();
        if nx == 0 || ny == 0 || nz == 0 {
            return 0;
        }
        nx.saturating_sub(1).max(1) * ny.saturating_sub(1).max(1) * nz.saturating_sub(1).max(1)
    }
}

/// A piece of a data set.
///
/// Partitioned ("parallel") summary files reference pieces by path; serial
/// files store piece data inline.
#[derive(Clone, Debug, PartialEq)]
pub enum Piece<P> {
    /// A reference to a piece as a file path, with the declared extent if any.
    Source(PathBuf, Option<Extent>),
    /// Piece data stored inline with the rest of the host file.
    Inline(Box<P>),
}

impl<P> Piece<P> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Piece::Inline(_))
    }
}

/// Storage for image data piece data.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ImageDataPiece {
    pub extent: Extent,
    pub data: Attributes,
}

/// Storage for rectilinear grid piece data.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RectilinearGridPiece {
    pub extent: Extent,
    pub coords: Coordinates,
    pub data: Attributes,
}

/// Storage for structured grid piece data.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct StructuredGridPiece {
    pub extent: Extent,
    /// A contiguous array of `(x,y,z)` point coordinates.
    pub points: IOBuffer,
    pub data: Attributes,
}

/// Storage for poly data piece data.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PolyDataPiece {
    /// A contiguous array of `(x,y,z)` point coordinates.
    pub points: IOBuffer,
    pub verts: Option<Topology>,
    pub lines: Option<Topology>,
    pub strips: Option<Topology>,
    pub polys: Option<Topology>,
    pub data: Attributes,
}

impl PolyDataPiece {
    pub fn num_points(&self) -> usize {
        self.points.len() / 3
    }

    pub fn num_cells(&self) -> usize {
        self.verts.iter().map(Topology::num_cells).sum::<usize>()
            + self.lines.iter().map(Topology::num_cells).sum::<usize>()
            + self.strips.iter().map(Topology::num_cells).sum::<usize>()
            + self.polys.iter().map(Topology::num_cells).sum::<usize>()
    }
}

/// Storage for unstructured grid piece data.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct UnstructuredGridPiece {
    /// A contiguous array of `(x,y,z)` point coordinates.
    pub points: IOBuffer,
    pub cells: Cells,
    pub data: Attributes,
}

impl UnstructuredGridPiece {
    pub fn num_points(&self) -> usize {
        self.points.len() / 3
    }
}

/// Storage for one table piece: rows of named columns.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TablePiece {
    pub num_rows: u64,
    pub row_data: Vec<DataArray>,
}

/// A block of a composite (multi-block) data set.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    /// A grouping node; descends into children without producing a leaf read.
    Group {
        name: Option<String>,
        children: Vec<Block>,
    },
    /// A leaf referencing one data-set file.
    ///
    /// `data` is `None` when the leaf was not assigned to this request
    /// (a placeholder), or when loading it failed.
    DataSet {
        name: Option<String>,
        file: Option<PathBuf>,
        data: Option<Box<Svtk>>,
    },
}

/// Data set described in the file.
///
/// Each variant is split into pieces matching the on-disk `Piece` elements;
/// a serial multi-piece file is merged into a single inline piece on read.
#[derive(Clone, PartialEq, Debug)]
pub enum DataSet {
    ImageData {
        extent: Extent,
        origin: [f64; 3],
        spacing: [f64; 3],
        meta: Option<Box<MetaData>>,
        pieces: Vec<Piece<ImageDataPiece>>,
    },
    RectilinearGrid {
        extent: Extent,
        meta: Option<Box<MetaData>>,
        pieces: Vec<Piece<RectilinearGridPiece>>,
    },
    StructuredGrid {
        extent: Extent,
        meta: Option<Box<MetaData>>,
        pieces: Vec<Piece<StructuredGridPiece>>,
    },
    PolyData {
        meta: Option<Box<MetaData>>,
        pieces: Vec<Piece<PolyDataPiece>>,
    },
    UnstructuredGrid {
        meta: Option<Box<MetaData>>,
        pieces: Vec<Piece<UnstructuredGridPiece>>,
    },
    Table {
        meta: Option<Box<MetaData>>,
        pieces: Vec<Piece<TablePiece>>,
    },
    HyperTreeGrid(Box<HyperTreeGrid>),
    /// A composite data set assembled from a multi-block manifest.
    MultiBlock { blocks: Vec<Block> },
}

/// A descriptor of a partitioned data set's declared schema.
///
/// Populated from the summary file of "parallel" formats so callers can list
/// available arrays without reading any piece data.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct MetaData {
    pub ghost_level: u32,
    pub point_arrays: Vec<ArrayMetaData>,
    pub cell_arrays: Vec<ArrayMetaData>,
    pub row_arrays: Vec<ArrayMetaData>,
}

/// A descriptor of a `DataArray` without its data.
#[derive(Clone, PartialEq, Debug)]
pub struct ArrayMetaData {
    pub name: String,
    pub num_comp: u32,
    pub scalar_type: ScalarType,
}

/// Scalar word types recognized in `type` attributes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ScalarType {
    Bit,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Str,
}

impl ScalarType {
    /// Parse an XML word-type tag.
    pub fn from_xml_tag(tag: &str) -> Option<ScalarType> {
        Some(match tag {
            "Bit" => ScalarType::Bit,
            "UInt8" => ScalarType::U8,
            "Int8" => ScalarType::I8,
            "UInt16" => ScalarType::U16,
            "Int16" => ScalarType::I16,
            "UInt32" => ScalarType::U32,
            "Int32" => ScalarType::I32,
            "UInt64" => ScalarType::U64,
            "Int64" => ScalarType::I64,
            "Float32" => ScalarType::F32,
            "Float64" => ScalarType::F64,
            "String" => ScalarType::Str,
            _ => return None,
        })
    }

    /// Size in bytes of one stored value.
    ///
    /// `Bit` packs 8 values per byte and `Str` values are variable length;
    /// both report `None`.
    pub fn size(&self) -> Option<usize> {
        Some(match self {
            ScalarType::Bit | ScalarType::Str => return None,
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        })
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScalarType::Bit => write!(f, "Bit"),
            ScalarType::U8 => write!(f, "UInt8"),
            ScalarType::I8 => write!(f, "Int8"),
            ScalarType::U16 => write!(f, "UInt16"),
            ScalarType::I16 => write!(f, "Int16"),
            ScalarType::U32 => write!(f, "UInt32"),
            ScalarType::I32 => write!(f, "Int32"),
            ScalarType::U64 => write!(f, "UInt64"),
            ScalarType::I64 => write!(f, "Int64"),
            ScalarType::F32 => write!(f, "Float32"),
            ScalarType::F64 => write!(f, "Float64"),
            ScalarType::Str => write!(f, "String"),
        }
    }
}

/// A hyper tree grid: a grid of independently refined trees.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct HyperTreeGrid {
    pub branch_factor: u32,
    pub transposed_root_indexing: bool,
    /// Grid point dimensions along each axis; cell (tree) dimensions are one
    /// less along non-flat axes.
    pub dimensions: [u32; 3],
    pub coords: Coordinates,
    /// Total vertex count declared by the file over all trees.
    pub declared_num_vertices: u64,
    pub trees: Vec<HyperTree>,
    /// Grid-global blanking mask, present only if some tree contributed one.
    pub mask: Option<BitArray>,
    pub point_data: Vec<DataArray>,
}

impl HyperTreeGrid {
    /// Number of children of every refined node: `branch_factor ^ dimension`.
    pub fn num_children(&self) -> usize {
        let bf = self.branch_factor.max(1) as usize;
        (0..self.dimension()).fold(1, |acc, _| acc * bf)
    }

    /// Dimensionality of the grid: the number of non-flat axes.
    pub fn dimension(&self) -> usize {
        self.dimensions.iter().filter(|&&d| d > 1).count().max(1)
    }

    /// Tree (cell) dimensions per axis.
    pub fn cell_dims(&self) -> [u32; 3] {
        let d = |n: u32| n.saturating_sub(1).max(1);
        [
            d(self.dimensions[0]),
            d(self.dimensions[1]),
            d(self.dimensions[2]),
        ]
    }

    /// Level-zero grid coordinates `(i, j, k)` of the tree at `index`.
    pub fn tree_coords(&self, index: u64) -> [u32; 3] {
        let [cx, cy, _cz] = self.cell_dims();
        let (cx, cy) = (cx as u64, cy as u64);
        if self.transposed_root_indexing {
            let k = (index % cx) as u32;
            let j = ((index / cx) % cy) as u32;
            let i = (index / (cx * cy)) as u32;
            [i, j, k]
        } else {
            let i = (index % cx) as u32;
            let j = ((index / cx) % cy) as u32;
            let k = (index / (cx * cy)) as u32;
            [i, j, k]
        }
    }

    /// Sum of materialized vertices over all loaded trees.
    pub fn num_vertices(&self) -> u64 {
        self.trees.iter().map(|t| t.num_vertices).sum()
    }
}

/// One tree of a hyper tree grid with its materialized topology.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct HyperTree {
    /// Index of this tree within the grid.
    pub index: u64,
    /// Offset of this tree's first vertex in the grid-global point arrays.
    pub global_offset: u64,
    /// Materialized depth.
    pub levels: u32,
    /// Breadth-first refinement bits, one per materialized node.
    pub descriptor: BitArray,
    /// Vertices per materialized level.
    pub verts_by_level: Vec<u64>,
    /// Vertex count after (possibly truncated) initialization.
    pub num_vertices: u64,
}

impl HyperTree {
    /// Bulk initialization from a per-level vertex-count table, truncated to
    /// `levels` levels.
    pub fn from_level_counts(
        index: u64,
        global_offset: u64,
        levels: u32,
        descriptor: BitArray,
        verts_by_level: &[u64],
    ) -> Self {
        let kept: Vec<u64> = verts_by_level.iter().copied().take(levels as usize).collect();
        let num_vertices = kept.iter().sum();
        HyperTree {
            index,
            global_offset,
            levels,
            descriptor,
            verts_by_level: kept,
            num_vertices,
        }
    }

    /// Full-depth initialization by recursive descent over the refinement
    /// descriptor, for files with no per-level vertex-count table.
    ///
    /// `level_starts` holds the descriptor index where each level begins; the
    /// per-level cursors are advanced in place as the walk visits nodes.
    pub fn from_descriptor(
        index: u64,
        global_offset: u64,
        descriptor: BitArray,
        num_children: usize,
        level_starts: &[usize],
    ) -> Self {
        let mut cursors: Vec<usize> = level_starts.to_vec();
        // One extra slot so leaves on the deepest serialized level can index it.
        cursors.push(descriptor.len());
        let mut verts_by_level: Vec<u64> = Vec::new();
        Self::subdivide(&descriptor, &mut cursors, 0, num_children, &mut verts_by_level);
        let levels = verts_by_level.len() as u32;
        let num_vertices = verts_by_level.iter().sum();
        HyperTree {
            index,
            global_offset,
            levels,
            descriptor,
            verts_by_level,
            num_vertices,
        }
    }

    fn subdivide(
        descriptor: &BitArray,
        cursors: &mut Vec<usize>,
        level: usize,
        num_children: usize,
        verts_by_level: &mut Vec<u64>,
    ) {
        if verts_by_level.len() <= level {
            verts_by_level.resize(level + 1, 0);
        }
        verts_by_level[level] += 1;
        if cursors.len() <= level + 1 {
            cursors.resize(level + 2, descriptor.len());
        }
        let cur = cursors[level];
        cursors[level] = cur + 1;
        if !descriptor.get(cur) {
            return;
        }
        for _ in 0..num_children {
            Self::subdivide(descriptor, cursors, level + 1, num_children, verts_by_level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_buffer_iter() {
        let v = vec![1, 2, 3, 4];
        let buf = IOBuffer::U32(v);
        assert!(buf.iter::<u32>().is_some());
        assert!(buf.iter::<f32>().is_none());
    }

    #[test]
    fn io_buffer_into_vec() {
        let v = vec![1, 2, 3, 4];
        let buf = IOBuffer::U32(v.clone());
        assert!(buf.clone().into_vec::<f32>().is_none());
        assert_eq!(buf.into_vec::<u32>(), Some(v));
    }

    #[test]
    fn io_buffer_allocate() {
        let buf = IOBuffer::allocate(ScalarType::F64, 5);
        assert_eq!(buf, IOBuffer::F64(vec![0.0; 5]));
        // Bit buffers allocate packed bytes.
        let buf = IOBuffer::allocate(ScalarType::Bit, 9);
        assert_eq!(buf, IOBuffer::Bit(vec![0u8; 2]));
    }

    #[test]
    fn io_buffer_from_bytes_endian() {
        let be = IOBuffer::from_bytes(vec![0x3f, 0x80, 0x00, 0x00], ScalarType::F32, ByteOrder::BigEndian)
            .unwrap();
        assert_eq!(be, IOBuffer::F32(vec![1.0]));
        let le = IOBuffer::from_bytes(vec![0x01, 0x00], ScalarType::U16, ByteOrder::LittleEndian)
            .unwrap();
        assert_eq!(le, IOBuffer::U16(vec![1]));
    }

    #[test]
    fn bit_array_msb_first() {
        let bits = BitArray::from_packed(vec![0b1010_0000], 4);
        assert!(bits.get(0));
        assert!(!bits.get(1));
        assert!(bits.get(2));
        assert!(!bits.get(3));
        // Out of range reads as 0.
        assert!(!bits.get(100));
    }

    #[test]
    fn extent_counts() {
        let e = Extent([0..=2, 0..=2, 0..=0]);
        assert_eq!(e.num_points(), 9);
        assert_eq!(e.num_cells(), 4);
    }

    #[test]
    fn hyper_tree_recursive_walk() {
        // Binary tree (2 children): root refined, left child refined, all
        // grandchildren leaves. Breadth first bits: [1, 1, 0, 0, 0].
        let desc = BitArray::from_bools(&[true, true, false, false, false]);
        let tree = HyperTree::from_descriptor(0, 0, desc, 2, &[0, 1, 3]);
        assert_eq!(tree.verts_by_level, vec![1, 2, 2]);
        assert_eq!(tree.num_vertices, 5);
        assert_eq!(tree.levels, 3);
    }

    #[test]
    fn hyper_tree_level_counts_truncation() {
        let desc = BitArray::from_bools(&[true, true, false, false, false]);
        let full = HyperTree::from_level_counts(0, 0, 3, desc.clone(), &[1, 2, 2]);
        assert_eq!(full.num_vertices, 5);
        let truncated = HyperTree::from_level_counts(0, 0, 2, desc, &[1, 2, 2]);
        assert_eq!(truncated.num_vertices, 3);
        assert_eq!(truncated.verts_by_level, vec![1, 2]);
    }
}
