//!
//! XML document model for SVTK files.
//!
//! Files are tokenized with `quick-xml` into an ordered element tree. The
//! appended binary section is split out *before* tokenization since its
//! contents are not valid XML text; the remaining head is parsed with a
//! synthesized closing root tag.
//!

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::Reader;

/// Errors specific to XML document parsing.
#[derive(Debug)]
pub enum Error {
    XML(quick_xml::Error),
    Attribute(quick_xml::events::attributes::AttrError),
    InvalidAttributeValue {
        attrib: String,
        value: String,
    },
    MissingAttribute(String),
    MissingRoot,
    UnexpectedRoot(String),
    UnexpectedClose(String),
    MissingAppendedDataMarker,
    InvalidEncoding(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::XML(e) => write!(f, "XML parse error: {}", e),
            Error::Attribute(e) => write!(f, "XML attribute error: {}", e),
            Error::InvalidAttributeValue { attrib, value } => {
                write!(f, "Invalid value {:?} for attribute {:?}", value, attrib)
            }
            Error::MissingAttribute(attrib) => write!(f, "Missing attribute {:?}", attrib),
            Error::MissingRoot => write!(f, "Missing a root VTKFile element"),
            Error::UnexpectedRoot(name) => write!(f, "Unexpected root element {:?}", name),
            Error::UnexpectedClose(name) => write!(f, "Unexpected closing tag {:?}", name),
            Error::MissingAppendedDataMarker => {
                write!(f, "AppendedData section is missing the '_' marker")
            }
            Error::InvalidEncoding(enc) => write!(f, "Invalid AppendedData encoding {:?}", enc),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::XML(e) => Some(e),
            Error::Attribute(e) => Some(e),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Error {
        Error::XML(e)
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(e: quick_xml::events::attributes::AttrError) -> Error {
        Error::Attribute(e)
    }
}

/// One element of the parsed document with attributes and ordered children.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated character data directly inside this element.
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The raw value of the named attribute, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the named attribute as a single scalar.
    ///
    /// `Ok(None)` if absent, `Err` if present but malformed.
    pub fn scalar_attr<T: FromStr>(&self, name: &str) -> Result<Option<T>, Error> {
        match self.attr(name) {
            None => Ok(None),
            Some(v) => v.trim().parse().map(Some).map_err(|_| Error::InvalidAttributeValue {
                attrib: name.to_string(),
                value: v.to_string(),
            }),
        }
    }

    /// Parse the named attribute as a whitespace separated vector.
    pub fn vector_attr<T: FromStr>(&self, name: &str) -> Result<Option<Vec<T>>, Error> {
        match self.attr(name) {
            None => Ok(None),
            Some(v) => v
                .split_whitespace()
                .map(|w| {
                    w.parse().map_err(|_| Error::InvalidAttributeValue {
                        attrib: name.to_string(),
                        value: v.to_string(),
                    })
                })
                .collect::<Result<Vec<T>, Error>>()
                .map(Some),
        }
    }

    /// Like `scalar_attr` but absence is an error.
    pub fn required_attr<T: FromStr>(&self, name: &str) -> Result<T, Error> {
        self.scalar_attr(name)?
            .ok_or_else(|| Error::MissingAttribute(name.to_string()))
    }

    /// First child with the given element name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given element name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// How the appended section's payload text is encoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Base64,
}

/// The appended binary section of a file, split out before XML parsing.
///
/// `data` holds everything after the `_` marker. Array offsets address bytes
/// for raw encoding and base64 text characters for base64 encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendedData {
    pub encoding: Encoding,
    pub data: Vec<u8>,
}

/// A parsed SVTK XML document: the `VTKFile` root element and the optional
/// appended binary section.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub root: Element,
    pub appended: Option<AppendedData>,
}

impl Document {
    /// Parse a complete file image.
    ///
    /// When an `<AppendedData ...>` section is present, the XML tokenizer only
    /// sees the bytes preceding it plus a synthesized `</VTKFile>`; the
    /// section body is captured verbatim.
    pub fn parse(bytes: &[u8]) -> Result<Document, Error> {
        match locate_appended(bytes)? {
            Some((tag_start, encoding, data)) => {
                let mut head = bytes[..tag_start].to_vec();
                head.extend_from_slice(b"</VTKFile>");
                let root = parse_element_tree(&head)?;
                Ok(Document {
                    root,
                    appended: Some(AppendedData { encoding, data }),
                })
            }
            None => Ok(Document {
                root: parse_element_tree(bytes)?,
                appended: None,
            }),
        }
    }
}

/// Find the appended section and return its start-tag position, encoding and
/// body bytes past the `_` marker.
fn locate_appended(bytes: &[u8]) -> Result<Option<(usize, Encoding, Vec<u8>)>, Error> {
    let needle = b"<AppendedData";
    let tag_start = match find(bytes, needle) {
        Some(p) => p,
        None => return Ok(None),
    };
    let rest = &bytes[tag_start..];
    let tag_end = find(rest, b">").ok_or(Error::MissingAppendedDataMarker)?;

    let encoding = {
        let tag = String::from_utf8_lossy(&rest[..tag_end]);
        let enc = tag
            .split("encoding=")
            .nth(1)
            .and_then(|s| s.split('"').nth(1))
            .unwrap_or("base64")
            .to_string();
        match enc.as_str() {
            "raw" => Encoding::Raw,
            "base64" => Encoding::Base64,
            other => return Err(Error::InvalidEncoding(other.to_string())),
        }
    };

    let mut pos = tag_start + tag_end + 1;
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    if pos >= bytes.len() || bytes[pos] != b'_' {
        return Err(Error::MissingAppendedDataMarker);
    }
    pos += 1;

    let body_end = rfind(&bytes[pos..], b"</AppendedData>")
        .map(|p| pos + p)
        .ok_or(Error::MissingAppendedDataMarker)?;
    Ok(Some((tag_start, encoding, bytes[pos..body_end].to_vec())))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|w| w == needle)
}

/// Tokenize `bytes` and build the element tree rooted at `VTKFile`.
fn parse_element_tree(bytes: &[u8]) -> Result<Element, Error> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    // Stack of open elements; the completed root ends up in `root`.
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                stack.push(element_from_start(&e)?);
            }
            Event::Empty(e) => {
                let el = element_from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None if root.is_none() => root = Some(el),
                    None => {}
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let el = stack.pop().ok_or(Error::UnexpectedClose(name.clone()))?;
                if el.name != name {
                    return Err(Error::UnexpectedClose(name));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => {
                        root = Some(el);
                        break;
                    }
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape()?;
                    if !top.text.is_empty() {
                        top.text.push(' ');
                    }
                    top.text.push_str(text.trim());
                }
            }
            Event::CData(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions carry no data.
            _ => {}
        }
        buf.clear();
    }

    let root = root.ok_or(Error::MissingRoot)?;
    if root.name != "VTKFile" {
        return Err(Error::UnexpectedRoot(root.name));
    }
    Ok(root)
}

fn element_from_start(e: &quick_xml::events::BytesStart) -> Result<Element, Error> {
    let mut el = Element::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        el.attributes.push((key, value));
    }
    Ok(el)
}

/// The kinds of data sets a file can store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataSetKind {
    ImageData,
    PolyData,
    RectilinearGrid,
    StructuredGrid,
    UnstructuredGrid,
    Table,
    HyperTreeGrid,
}

impl DataSetKind {
    /// The primary element tag of a serial file of this kind.
    pub fn xml_tag(&self) -> &'static str {
        match self {
            DataSetKind::ImageData => "ImageData",
            DataSetKind::PolyData => "PolyData",
            DataSetKind::RectilinearGrid => "RectilinearGrid",
            DataSetKind::StructuredGrid => "StructuredGrid",
            DataSetKind::UnstructuredGrid => "UnstructuredGrid",
            DataSetKind::Table => "Table",
            DataSetKind::HyperTreeGrid => "HyperTreeGrid",
        }
    }

    /// The primary element tag of a partitioned summary file of this kind.
    pub fn parallel_xml_tag(&self) -> &'static str {
        match self {
            DataSetKind::ImageData => "PImageData",
            DataSetKind::PolyData => "PPolyData",
            DataSetKind::RectilinearGrid => "PRectilinearGrid",
            DataSetKind::StructuredGrid => "PStructuredGrid",
            DataSetKind::UnstructuredGrid => "PUnstructuredGrid",
            DataSetKind::Table => "PTable",
            DataSetKind::HyperTreeGrid => "HyperTreeGrid",
        }
    }

    pub fn from_xml_tag(tag: &str) -> Option<DataSetKind> {
        Some(match tag {
            "ImageData" => DataSetKind::ImageData,
            "PolyData" => DataSetKind::PolyData,
            "RectilinearGrid" => DataSetKind::RectilinearGrid,
            "StructuredGrid" => DataSetKind::StructuredGrid,
            "UnstructuredGrid" => DataSetKind::UnstructuredGrid,
            "Table" => DataSetKind::Table,
            "HyperTreeGrid" => DataSetKind::HyperTreeGrid,
            _ => return None,
        })
    }

    /// Whether a piece of this kind is addressed by a structured extent.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            DataSetKind::ImageData | DataSetKind::RectilinearGrid | DataSetKind::StructuredGrid
        )
    }
}

/// The file flavors recognized by extension dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileType {
    Serial(DataSetKind),
    Parallel(DataSetKind),
    Composite,
}

impl FileType {
    /// Determine the file type from the file extension of the given path.
    pub fn try_from_path(path: &Path) -> Option<FileType> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(FileType::try_from_ext)
    }

    pub fn try_from_ext(ext: &str) -> Option<FileType> {
        Some(match ext {
            "vti" => FileType::Serial(DataSetKind::ImageData),
            "vtp" => FileType::Serial(DataSetKind::PolyData),
            "vtr" => FileType::Serial(DataSetKind::RectilinearGrid),
            "vts" => FileType::Serial(DataSetKind::StructuredGrid),
            "vtu" => FileType::Serial(DataSetKind::UnstructuredGrid),
            "vtt" => FileType::Serial(DataSetKind::Table),
            "htg" => FileType::Serial(DataSetKind::HyperTreeGrid),
            "pvti" => FileType::Parallel(DataSetKind::ImageData),
            "pvtp" => FileType::Parallel(DataSetKind::PolyData),
            "pvtr" => FileType::Parallel(DataSetKind::RectilinearGrid),
            "pvts" => FileType::Parallel(DataSetKind::StructuredGrid),
            "pvtu" => FileType::Parallel(DataSetKind::UnstructuredGrid),
            "pvtt" => FileType::Parallel(DataSetKind::Table),
            "vtm" | "vtmb" => FileType::Composite,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_simple_tree() {
        let xml = br#"<?xml version="1.0"?>
            <VTKFile type="ImageData" version="1.0" byte_order="LittleEndian">
              <ImageData WholeExtent="0 1 0 1 0 0" Origin="0 0 0" Spacing="1 1 1">
                <Piece Extent="0 1 0 1 0 0">
                  <PointData>
                    <DataArray type="Float32" Name="u" format="ascii">0 1 2 3</DataArray>
                  </PointData>
                </Piece>
              </ImageData>
            </VTKFile>"#;
        let doc = Document::parse(xml).unwrap();
        assert!(doc.appended.is_none());
        assert_eq!(doc.root.name, "VTKFile");
        assert_eq!(doc.root.attr("type"), Some("ImageData"));
        let image = doc.root.find("ImageData").unwrap();
        let piece = image.find("Piece").unwrap();
        let array = piece.find("PointData").unwrap().find("DataArray").unwrap();
        assert_eq!(array.attr("Name"), Some("u"));
        assert_eq!(array.text, "0 1 2 3");
    }

    #[test]
    fn attr_parsing() {
        let mut el = Element::new("Piece");
        el.attributes
            .push(("Extent".to_string(), "0 1 0 1 0 0".to_string()));
        el.attributes
            .push(("NumberOfPoints".to_string(), "8".to_string()));
        assert_eq!(el.required_attr::<u64>("NumberOfPoints").unwrap(), 8);
        assert_eq!(
            el.vector_attr::<i32>("Extent").unwrap(),
            Some(vec![0, 1, 0, 1, 0, 0])
        );
        assert!(el.scalar_attr::<u64>("Missing").unwrap().is_none());
        assert!(el.required_attr::<u64>("Extent").is_err());
    }

    #[test]
    fn appended_raw_section_is_split_out() {
        // The raw body may contain bytes that are not valid XML, including
        // a stray '<'.
        let mut xml = Vec::new();
        xml.extend_from_slice(
            br#"<VTKFile type="ImageData" version="1.0" byte_order="LittleEndian">
              <ImageData WholeExtent="0 0 0 0 0 0" Origin="0 0 0" Spacing="1 1 1">
                <Piece Extent="0 0 0 0 0 0"><PointData/></Piece>
              </ImageData>
              <AppendedData encoding="raw">
              _"#,
        );
        xml.extend_from_slice(&[0x04, 0x00, 0x00, 0x00, b'<', 0xff, 0x00, 0x01]);
        xml.extend_from_slice(b"</AppendedData></VTKFile>");

        let doc = Document::parse(&xml).unwrap();
        let appended = doc.appended.unwrap();
        assert_eq!(appended.encoding, Encoding::Raw);
        assert_eq!(
            appended.data,
            vec![0x04, 0x00, 0x00, 0x00, b'<', 0xff, 0x00, 0x01]
        );
        // The head is still a complete document.
        assert!(doc.root.find("ImageData").is_some());
    }

    #[test]
    fn appended_base64_encoding_tag() {
        let xml = br#"<VTKFile type="ImageData" version="0.1" byte_order="LittleEndian">
            <ImageData WholeExtent="0 0 0 0 0 0" Origin="0 0 0" Spacing="1 1 1"/>
            <AppendedData encoding="base64">
            _BAAAAAECAwQ=</AppendedData>
            </VTKFile>"#;
        let doc = Document::parse(xml).unwrap();
        let appended = doc.appended.unwrap();
        assert_eq!(appended.encoding, Encoding::Base64);
        assert_eq!(appended.data, b"BAAAAAECAwQ=".to_vec());
    }

    #[test]
    fn missing_marker_is_an_error() {
        let xml = br#"<VTKFile type="ImageData" version="0.1" byte_order="LittleEndian">
            <AppendedData encoding="raw">junk</AppendedData></VTKFile>"#;
        assert!(matches!(
            Document::parse(xml),
            Err(Error::MissingAppendedDataMarker)
        ));
    }

    #[test]
    fn extension_table() {
        use DataSetKind::*;
        assert_eq!(FileType::try_from_ext("vtu"), Some(FileType::Serial(UnstructuredGrid)));
        assert_eq!(FileType::try_from_ext("htg"), Some(FileType::Serial(HyperTreeGrid)));
        assert_eq!(FileType::try_from_ext("pvtt"), Some(FileType::Parallel(Table)));
        assert_eq!(FileType::try_from_ext("vtm"), Some(FileType::Composite));
        assert_eq!(FileType::try_from_ext("foo"), None);
    }
}
