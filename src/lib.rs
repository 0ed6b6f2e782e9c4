//!
//! Import SVTK XML data files into Rust data structures.
//!
//! The crate reads the full family of SVTK XML formats: the serial
//! single-file kinds (`.vti`, `.vtp`, `.vtr`, `.vts`, `.vtu`, `.vtt`,
//! `.htg`), their partitioned "parallel" counterparts (`.pvti` ... `.pvtt`)
//! whose summary files reference per-piece serial files, and composite
//! multi-block manifests (`.vtm`/`.vtmb`).
//!
//! [`import`] picks the reader from the file extension. For finer control
//! (array selection, time steps, piece distribution, hyper tree
//! restriction) construct [`XmlReader`], [`ParallelReader`] or
//! [`CompositeReader`] directly.
//!

pub mod codec;
pub mod composite;
pub mod decode;
pub mod htg;
pub mod model;
pub mod parallel;
pub mod reader;
pub mod select;
pub mod xml;

use std::io;
use std::path::Path;

pub use composite::CompositeReader;
pub use htg::TreeSelection;
pub use model::{Attributes, DataArray, DataSet, IOBuffer, Svtk};
pub use parallel::{ParallelReader, PieceDistribution};
pub use reader::{ReadOutput, XmlReader};
pub use select::ArraySelection;

/// Error type for import operations.
#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    XML(xml::Error),
    Codec(codec::Error),
    Decode(decode::Error),
    Model(model::Error),
    /// The `type` attribute names no supported data set kind.
    UnknownDataSetType(String),
    /// The `type` attribute contradicts the kind implied by the extension.
    UnexpectedDataSetType {
        expected: String,
        found: String,
    },
    InvalidByteOrder(String),
    InvalidHeaderType(String),
    InvalidVersion(String),
    /// A required element is absent from the file.
    MissingSection(String),
    UnknownCellType(u64),
    UnknownFileExtension(Option<String>),
    /// The abort flag was raised while a read was in progress.
    Aborted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IO(source) => write!(f, "IO error: {}", source),
            Error::XML(source) => write!(f, "XML error: {}", source),
            Error::Codec(source) => write!(f, "Codec error: {}", source),
            Error::Decode(source) => write!(f, "Decode error: {}", source),
            Error::Model(source) => write!(f, "Model error: {}", source),
            Error::UnknownDataSetType(tag) => write!(f, "Unknown data set type: {:?}", tag),
            Error::UnexpectedDataSetType { expected, found } => {
                write!(f, "Expected a {:?} file but found {:?}", expected, found)
            }
            Error::InvalidByteOrder(v) => write!(f, "Invalid byte order: {:?}", v),
            Error::InvalidHeaderType(v) => write!(f, "Invalid header type: {:?}", v),
            Error::InvalidVersion(v) => write!(f, "Invalid version string: {:?}", v),
            Error::MissingSection(name) => write!(f, "Missing a required {:?} element", name),
            Error::UnknownCellType(t) => write!(f, "Unknown cell type: {}", t),
            Error::UnknownFileExtension(Some(ext)) => {
                write!(f, "Unknown file extension: {:?}", ext)
            }
            Error::UnknownFileExtension(None) => write!(f, "Missing file extension"),
            Error::Aborted => write!(f, "Read aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IO(source) => Some(source),
            Error::XML(source) => Some(source),
            Error::Codec(source) => Some(source),
            Error::Decode(source) => Some(source),
            Error::Model(source) => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<xml::Error> for Error {
    fn from(e: xml::Error) -> Error {
        Error::XML(e)
    }
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Error {
        Error::Codec(e)
    }
}

impl From<decode::Error> for Error {
    fn from(e: decode::Error) -> Error {
        Error::Decode(e)
    }
}

impl From<model::Error> for Error {
    fn from(e: model::Error) -> Error {
        Error::Model(e)
    }
}

/// Convert an import error into a `std::io` error.
impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IO(e) => e,
            _ => io::Error::new(io::ErrorKind::Other, format!("{}", err)),
        }
    }
}

/// Import the SVTK data file at the specified path.
///
/// The reader is selected by file extension:
///
///  - Image data (`.vti`) -- Serial svtkImageData (structured)
///  - PolyData (`.vtp`) -- Serial svtkPolyData (unstructured)
///  - RectilinearGrid (`.vtr`) -- Serial svtkRectilinearGrid (structured)
///  - StructuredGrid (`.vts`) -- Serial svtkStructuredGrid (structured)
///  - UnstructuredGrid (`.vtu`) -- Serial svtkUnstructuredGrid (unstructured)
///  - Table (`.vtt`) -- Serial svtkTable
///  - HyperTreeGrid (`.htg`) -- Serial svtkHyperTreeGrid
///  - PImageData (`.pvti`) ... PTable (`.pvtt`) -- Partitioned summaries
///    referencing the serial kind above
///  - MultiBlock (`.vtm`, `.vtmb`) -- Composite manifest of any of the above
///
/// Partitioned and composite files are read whole (every piece, every
/// block). Array payloads that fail to decode are logged and reported
/// through [`ReadOutput::data_error`] while the rest of the file is still
/// loaded; structural problems fail the whole import.
///
/// # Examples
///
/// ```no_run
/// let out = svtkio::import("tet.vtu").expect("failed to load tet.vtu");
/// assert!(!out.data_error);
/// ```
pub fn import(file_path: impl AsRef<Path>) -> Result<ReadOutput, Error> {
    let path = file_path.as_ref();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or(Error::UnknownFileExtension(None))?;
    let file_type = xml::FileType::try_from_ext(ext)
        .ok_or_else(|| Error::UnknownFileExtension(Some(ext.to_string())))?;
    match file_type {
        xml::FileType::Serial(_) => XmlReader::from_path(path)?.read(),
        xml::FileType::Parallel(_) => ParallelReader::from_path(path)?.read(0, 1),
        xml::FileType::Composite => CompositeReader::from_path(path)?.read(0, 1),
    }
}
