use pretty_assertions::assert_eq;

use svtkio::model::*;
use svtkio::reader::XmlReader;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn htg_file(version: &str, trees: &str) -> String {
    format!(
        r#"<VTKFile type="HyperTreeGrid" version="{}" byte_order="LittleEndian">
             <HyperTreeGrid BranchFactor="2" TransposedRootIndexing="0"
                            Dimensions="2 1 1" NumberOfVertices="5">
               <Grid>
                 <DataArray type="Float64" Name="XCoordinates" NumberOfTuples="2" format="ascii">0 1</DataArray>
                 <DataArray type="Float64" Name="YCoordinates" NumberOfTuples="1" format="ascii">0</DataArray>
                 <DataArray type="Float64" Name="ZCoordinates" NumberOfTuples="1" format="ascii">0</DataArray>
               </Grid>
               <Trees>
                 {}
               </Trees>
             </HyperTreeGrid>
           </VTKFile>"#,
        version, trees
    )
}

fn read_grid(xml: &str, fixed_level: Option<u32>) -> HyperTreeGrid {
    let mut reader = XmlReader::from_str(xml, None).unwrap();
    reader.fixed_level = fixed_level;
    let out = reader.read().unwrap();
    assert!(!out.data_error);
    let DataSet::HyperTreeGrid(grid) = out.svtk.data else {
        panic!("expected a hyper tree grid");
    };
    *grid
}

// One binary tree, three levels: the root and its first child are refined.
// Breadth-first descriptor [1, 1, 0, 0, 0], vertex counts per level
// [1, 2, 2].
const DESCRIPTOR: &str = "1 1 0 0 0";
const POINT_VALUES: &str = "0 1 2 3 4";

fn generation_zero() -> String {
    htg_file(
        "0.1",
        &format!(
            r#"<Tree Index="0" GlobalOffset="0" NumberOfVertices="5">
                 <DataArray type="Bit" Name="Descriptor" NumberOfTuples="5" format="ascii">{DESCRIPTOR}</DataArray>
                 <DataArray type="Bit" Name="Mask" NumberOfTuples="5" format="ascii">0 0 1 0 0</DataArray>
                 <PointData>
                   <DataArray type="Float64" Name="v" format="ascii">{POINT_VALUES}</DataArray>
                 </PointData>
               </Tree>"#
        ),
    )
}

fn generation_one() -> String {
    htg_file(
        "1.0",
        &format!(
            r#"<Tree Index="0" NumberOfLevels="3" NumberOfVertices="5">
                 <DataArray type="Bit" Name="Descriptor" NumberOfTuples="5" format="ascii">{DESCRIPTOR}</DataArray>
                 <DataArray type="UInt64" Name="NbVerticesByLevel" NumberOfTuples="3" format="ascii">1 2 2</DataArray>
                 <DataArray type="Bit" Name="Mask" NumberOfTuples="5" format="ascii">0 0 1 0 0</DataArray>
                 <PointData>
                   <DataArray type="Float64" Name="v" format="ascii">{POINT_VALUES}</DataArray>
                 </PointData>
               </Tree>"#
        ),
    )
}

// The recursive generation-0 walk and the bulk generation-1 build must
// materialize the same tree when generation 1 loads at full depth.
#[test]
fn generations_agree_at_full_depth() {
    init();
    let v0 = read_grid(&generation_zero(), None);
    let v1 = read_grid(&generation_one(), None);
    assert_eq!(v0.trees.len(), 1);
    assert_eq!(v1.trees.len(), 1);
    assert_eq!(v0.trees[0].verts_by_level, vec![1, 2, 2]);
    assert_eq!(v0.trees[0].verts_by_level, v1.trees[0].verts_by_level);
    assert_eq!(v0.trees[0].num_vertices, v1.trees[0].num_vertices);
    assert_eq!(v0.num_vertices(), 5);
    assert_eq!(v0.point_data[0].data, v1.point_data[0].data);
    assert_eq!(
        v0.point_data[0].data,
        IOBuffer::F64(vec![0.0, 1.0, 2.0, 3.0, 4.0])
    );
    let m0 = v0.mask.as_ref().unwrap();
    let m1 = v1.mask.as_ref().unwrap();
    for i in 0..5 {
        assert_eq!(m0.get(i), m1.get(i), "mask bit {}", i);
    }
    assert!(m0.get(2));
}

// Truncating at level L keeps exactly the sum of per-level vertex counts
// below L.
#[test]
fn level_truncation_counts() {
    init();
    let full = read_grid(&generation_one(), Some(3));
    assert_eq!(full.trees[0].num_vertices, 5);

    let two = read_grid(&generation_one(), Some(2));
    assert_eq!(two.trees[0].num_vertices, 3);
    assert_eq!(two.point_data[0].data, IOBuffer::F64(vec![0.0, 1.0, 2.0]));

    let one = read_grid(&generation_one(), Some(1));
    assert_eq!(one.trees[0].num_vertices, 1);
}

// The depth cap does not apply to generation 0; those files always load at
// full depth.
#[test]
fn generation_zero_ignores_depth_cap() {
    init();
    let grid = read_grid(&generation_zero(), Some(1));
    assert_eq!(grid.trees[0].num_vertices, 5);
}

#[test]
fn missing_trees_section_is_an_empty_grid() {
    init();
    let xml = r#"<VTKFile type="HyperTreeGrid" version="1.0" byte_order="LittleEndian">
         <HyperTreeGrid BranchFactor="2" Dimensions="2 1 1">
           <Grid>
             <DataArray type="Float64" Name="XCoordinates" NumberOfTuples="2" format="ascii">0 1</DataArray>
             <DataArray type="Float64" Name="YCoordinates" NumberOfTuples="1" format="ascii">0</DataArray>
             <DataArray type="Float64" Name="ZCoordinates" NumberOfTuples="1" format="ascii">0</DataArray>
           </Grid>
         </HyperTreeGrid>
       </VTKFile>"#;
    let grid = read_grid(xml, None);
    assert!(grid.trees.is_empty());
    assert_eq!(grid.num_vertices(), 0);
}
