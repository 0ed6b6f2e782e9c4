//!
//! Composite (multi-block) manifest reading.
//!
//! A `.vtm`/`.vtmb` file holds no bulk data of its own: it is a recursive
//! manifest of `Block` groups whose `DataSet` leaves reference other files.
//! [`CompositeReader`] mirrors the manifest as a [`Block`] tree, assigns the
//! flattened leaf sequence across a `(piece, num_pieces)` request with the
//! same distribution arithmetic used for partitioned files, and loads each
//! assigned leaf through the reader matching its file extension.
//!

use std::path::{Path, PathBuf};

use log::error;

use crate::model::{Block, ByteOrder, DataSet, Svtk, Version};
use crate::parallel::{self, ParallelReader, PieceDistribution};
use crate::reader::{self, ReadOutput, XmlReader};
use crate::xml::{Document, Element, FileType};
use crate::Error;

const MULTI_BLOCK_TAG: &str = "vtkMultiBlockDataSet";

/// Reader for one composite manifest file.
pub struct CompositeReader {
    path: PathBuf,
    version: Version,
    byte_order: ByteOrder,
    /// The manifest with every leaf's `data` unset.
    manifest: Vec<Block>,

    pub distribution: PieceDistribution,
    /// Optional subset of valid flat leaf indices, applied before
    /// distribution.
    pub restriction: Option<Vec<usize>>,
}

impl CompositeReader {
    /// Open and parse the manifest at `path`. Referenced files are not
    /// touched until [`read`](Self::read).
    pub fn from_path(path: impl AsRef<Path>) -> Result<CompositeReader, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let doc = Document::parse(&bytes)?;
        CompositeReader::new(doc, path.to_path_buf())
    }

    fn new(doc: Document, path: PathBuf) -> Result<CompositeReader, Error> {
        let root = &doc.root;
        let type_tag = root.attr("type").unwrap_or("");
        if type_tag != MULTI_BLOCK_TAG {
            return Err(Error::UnknownDataSetType(type_tag.to_string()));
        }
        let version = reader::parse_version(root)?;
        let byte_order = match root.attr("byte_order").unwrap_or("LittleEndian") {
            "BigEndian" => ByteOrder::BigEndian,
            "LittleEndian" => ByteOrder::LittleEndian,
            other => return Err(Error::InvalidByteOrder(other.to_string())),
        };
        let primary = root
            .find(MULTI_BLOCK_TAG)
            .ok_or_else(|| Error::MissingSection(MULTI_BLOCK_TAG.to_string()))?;

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let manifest = parse_children(primary, &dir);
        Ok(CompositeReader {
            path,
            version,
            byte_order,
            manifest,
            distribution: PieceDistribution::default(),
            restriction: None,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The manifest structure, with no leaf data loaded.
    pub fn manifest(&self) -> &[Block] {
        &self.manifest
    }

    /// Number of `DataSet` leaves over the whole manifest, in depth-first
    /// order. This ordering is the flat leaf index used for distribution.
    pub fn num_leaves(&self) -> usize {
        fn count(blocks: &[Block]) -> usize {
            blocks
                .iter()
                .map(|b| match b {
                    Block::Group { children, .. } => count(children),
                    Block::DataSet { .. } => 1,
                })
                .sum()
        }
        count(&self.manifest)
    }

    /// Flat leaf indices requester `piece` of `num_pieces` serves.
    pub fn assigned_leaves(&self, piece: usize, num_pieces: usize) -> Vec<usize> {
        let total = self.num_leaves();
        let universe: Vec<usize> = match &self.restriction {
            Some(r) => r.iter().copied().filter(|&i| i < total).collect(),
            None => (0..total).collect(),
        };
        match self.distribution {
            PieceDistribution::Block => parallel::block_range(piece, num_pieces, universe.len())
                .map(|pos| universe[pos])
                .collect(),
            PieceDistribution::Interleave => universe
                .iter()
                .enumerate()
                .filter(|(pos, _)| parallel::interleave_assigned(*pos, piece, num_pieces))
                .map(|(_, &i)| i)
                .collect(),
        }
    }

    /// Read the leaves assigned to `(piece, num_pieces)`.
    ///
    /// Unassigned leaves keep `data: None`. A leaf that fails to load is
    /// logged, reported through [`ReadOutput::data_error`] and also left
    /// with `data: None`.
    pub fn read(&mut self, piece: usize, num_pieces: usize) -> Result<ReadOutput, Error> {
        let assigned = self.assigned_leaves(piece, num_pieces);
        let mut blocks = self.manifest.clone();
        let mut next_leaf = 0usize;
        let mut data_error = false;
        load_blocks(&mut blocks, &assigned, &mut next_leaf, &mut data_error);

        Ok(ReadOutput {
            svtk: Svtk {
                version: self.version,
                byte_order: self.byte_order,
                file_path: Some(self.path.clone()),
                field_data: Vec::new(),
                data: DataSet::MultiBlock { blocks },
            },
            data_error,
        })
    }
}

fn parse_children(el: &Element, dir: &Path) -> Vec<Block> {
    let mut out = Vec::new();
    for child in &el.children {
        match child.name.as_str() {
            "Block" => out.push(Block::Group {
                name: child.attr("name").map(str::to_string),
                children: parse_children(child, dir),
            }),
            "DataSet" => {
                let file = child.attr("file").map(|f| {
                    let f = PathBuf::from(f);
                    if f.is_absolute() {
                        f
                    } else {
                        dir.join(f)
                    }
                });
                out.push(Block::DataSet {
                    name: child.attr("name").map(str::to_string),
                    file,
                    data: None,
                });
            }
            _ => {}
        }
    }
    out
}

fn load_blocks(blocks: &mut [Block], assigned: &[usize], next_leaf: &mut usize, data_error: &mut bool) {
    for block in blocks {
        match block {
            Block::Group { children, .. } => {
                load_blocks(children, assigned, next_leaf, data_error);
            }
            Block::DataSet { file, data, .. } => {
                let leaf = *next_leaf;
                *next_leaf += 1;
                if !assigned.contains(&leaf) {
                    continue;
                }
                let Some(file) = file else {
                    continue;
                };
                match load_leaf(file) {
                    Ok(out) => {
                        *data_error |= out.data_error;
                        *data = Some(Box::new(out.svtk));
                    }
                    Err(e) => {
                        error!("block file {:?} failed to load: {}", file, e);
                        *data_error = true;
                    }
                }
            }
        }
    }
}

/// Load one referenced file with the reader its extension selects.
fn load_leaf(path: &Path) -> Result<ReadOutput, Error> {
    let ext = path.extension().and_then(|e| e.to_str());
    let file_type = ext
        .and_then(FileType::try_from_ext)
        .ok_or_else(|| Error::UnknownFileExtension(ext.map(str::to_string)))?;
    match file_type {
        FileType::Serial(_) => XmlReader::from_path(path)?.read(),
        FileType::Parallel(_) => ParallelReader::from_path(path)?.read(0, 1),
        FileType::Composite => CompositeReader::from_path(path)?.read(0, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IOBuffer, Piece};
    use pretty_assertions::assert_eq;

    fn vti_leaf() -> &'static str {
        r#"<VTKFile type="ImageData" version="1.0" byte_order="LittleEndian">
             <ImageData WholeExtent="0 1 0 0 0 0" Origin="0 0 0" Spacing="1 1 1">
               <Piece Extent="0 1 0 0 0 0">
                 <PointData>
                   <DataArray type="Float64" Name="u" format="ascii">1 2</DataArray>
                 </PointData>
               </Piece>
             </ImageData>
           </VTKFile>"#
    }

    fn write_manifest(dir: &Path, stem: &str, body: &str) -> PathBuf {
        let xml = format!(
            r#"<VTKFile type="vtkMultiBlockDataSet" version="1.0" byte_order="LittleEndian">
                 <vtkMultiBlockDataSet>
                   {}
                 </vtkMultiBlockDataSet>
               </VTKFile>"#,
            body
        );
        let path = dir.join(format!("{}.vtm", stem));
        std::fs::write(&path, xml).unwrap();
        path
    }

    #[test]
    fn manifest_structure() {
        let dir = std::env::temp_dir();
        let path = write_manifest(
            &dir,
            "svtkio_composite_structure",
            r#"<Block index="0" name="outer">
                 <Block index="0" name="inner">
                   <DataSet index="0" name="a" file="a.vti"/>
                 </Block>
                 <DataSet index="1" name="b" file="b.vti"/>
               </Block>"#,
        );
        let reader = CompositeReader::from_path(&path).unwrap();
        assert_eq!(reader.num_leaves(), 2);
        let Block::Group { name, children } = &reader.manifest()[0] else {
            panic!()
        };
        assert_eq!(name.as_deref(), Some("outer"));
        assert!(matches!(children[0], Block::Group { .. }));
        let Block::DataSet { name, file, data } = &children[1] else {
            panic!()
        };
        assert_eq!(name.as_deref(), Some("b"));
        assert_eq!(file.as_deref(), Some(dir.join("b.vti").as_path()));
        assert!(data.is_none());
    }

    #[test]
    fn reads_assigned_leaves_only() {
        let dir = std::env::temp_dir();
        std::fs::write(dir.join("svtkio_composite_leaf_0.vti"), vti_leaf()).unwrap();
        std::fs::write(dir.join("svtkio_composite_leaf_1.vti"), vti_leaf()).unwrap();
        let path = write_manifest(
            &dir,
            "svtkio_composite_assigned",
            r#"<DataSet index="0" file="svtkio_composite_leaf_0.vti"/>
               <DataSet index="1" file="svtkio_composite_leaf_1.vti"/>"#,
        );
        let mut reader = CompositeReader::from_path(&path).unwrap();
        assert_eq!(reader.assigned_leaves(0, 2), vec![0]);
        let out = reader.read(0, 2).unwrap();
        assert!(!out.data_error);
        let DataSet::MultiBlock { blocks } = out.svtk.data else {
            panic!()
        };
        let Block::DataSet { data: Some(svtk), .. } = &blocks[0] else {
            panic!()
        };
        let DataSet::ImageData { pieces, .. } = &svtk.data else {
            panic!()
        };
        let Piece::Inline(piece) = &pieces[0] else {
            panic!()
        };
        assert_eq!(
            piece.data.find_point("u").unwrap().data,
            IOBuffer::F64(vec![1.0, 2.0])
        );
        assert!(matches!(&blocks[1], Block::DataSet { data: None, .. }));
    }

    #[test]
    fn missing_leaf_file_is_a_data_error() {
        let dir = std::env::temp_dir();
        let path = write_manifest(
            &dir,
            "svtkio_composite_missing",
            r#"<DataSet index="0" file="does_not_exist.vti"/>"#,
        );
        let mut reader = CompositeReader::from_path(&path).unwrap();
        let out = reader.read(0, 1).unwrap();
        assert!(out.data_error);
    }

    #[test]
    fn unknown_extension_is_a_data_error() {
        let dir = std::env::temp_dir();
        let path = write_manifest(
            &dir,
            "svtkio_composite_unknown_ext",
            r#"<DataSet index="0" file="blob.bin"/>"#,
        );
        let mut reader = CompositeReader::from_path(&path).unwrap();
        let out = reader.read(0, 1).unwrap();
        assert!(out.data_error);
    }

    #[test]
    fn restriction_narrows_leaves() {
        let dir = std::env::temp_dir();
        let path = write_manifest(
            &dir,
            "svtkio_composite_restricted",
            r#"<DataSet index="0" file="a.vti"/>
               <DataSet index="1" file="b.vti"/>
               <DataSet index="2" file="c.vti"/>"#,
        );
        let mut reader = CompositeReader::from_path(&path).unwrap();
        reader.restriction = Some(vec![0, 2]);
        assert_eq!(reader.assigned_leaves(0, 2), vec![0]);
        assert_eq!(reader.assigned_leaves(1, 2), vec![2]);
    }
}
