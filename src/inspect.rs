//! Measures a container the way the worker will see it after import, join
//! and merge-by-distance, so the policy can be previewed without running the
//! mesh host.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use glam::{Mat4, Vec3};
use gltf::{Document, buffer, image::Source, mesh::Mode};
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::{
    config::Profile,
    container,
    error::{Error, Result},
    policy::{self, Directives, ManifoldReport, MeshStats, TextureResize, Tuning},
    shading::{ImageId, ObjectId, ShadingGraph},
};

/// glTF is Y-up, the mesh host is Z-up.
fn to_host_axes(p: [f32; 3]) -> [f32; 3] {
    [p[0], -p[2], p[1]]
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub stats: MeshStats,
    pub directives: Directives,
    pub manifold: ManifoldReport,
    pub textures: Vec<TextureResize>,
}

#[derive(Debug)]
pub struct Inspection {
    pub path: PathBuf,
    /// `None` for a container without any triangle geometry.
    pub stats: Option<MeshStats>,
    pub manifold: ManifoldReport,
    pub graph: ShadingGraph,
    /// Every mesh, which after the worker's join is a single object.
    pub objects: Vec<ObjectId>,
    /// Welded host-space positions.
    points: Vec<[f32; 3]>,
    image_sizes: Vec<Option<(u32, u32)>>,
}

impl Inspection {
    pub fn image_size(&self, image: ImageId) -> Option<(u32, u32)> {
        let source = self.graph.image(image).source?;
        self.image_sizes.get(source).copied().flatten()
    }

    pub fn plan(&self, profile: &Profile, tuning: &Tuning) -> Option<Plan> {
        let stats = self.stats?;
        let directives = policy::directives(&self.points, profile, tuning)?;

        let textures = self
            .graph
            .used_images(Some(&self.objects))
            .into_iter()
            .filter_map(|id| {
                let (w, h) = self.image_size(id)?;
                let to = policy::texture_target(w, h, profile.max_texture_edge)?;
                Some(TextureResize {
                    image: self.graph.image(id).name.clone(),
                    from: (w, h),
                    to,
                })
            })
            .collect();

        Some(Plan {
            stats,
            directives,
            manifold: self.manifold,
            textures,
        })
    }
}

/// Validates `path`, then loads it and measures its geometry.
pub fn inspect(path: &Path, tuning: &Tuning) -> Result<Inspection> {
    container::validate(path).map_err(|source| Error::Validation {
        path: path.to_path_buf(),
        source,
    })?;

    let bytes = std::fs::read(path)?;
    let gltf::Gltf { document, blob } = gltf::Gltf::from_slice(&bytes)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let buffers = gltf::import_buffers(&document, Some(base), blob)?;

    let (points, triangles) = collect_geometry(&document, &buffers, tuning.merge_distance);
    let manifold = ManifoldReport::from_triangles(triangles);
    let stats = MeshStats::from_points(&points);

    let graph = ShadingGraph::from_document(&document);
    let objects = graph.object_ids().collect();
    let image_sizes = document
        .images()
        .map(|image| image_size(&image, &buffers, base))
        .collect();

    debug!(
        file = %path.display(),
        vertices = stats.map(|s| s.vertex_count),
        boundary_edges = manifold.boundary_edges,
        "inspected"
    );

    Ok(Inspection {
        path: path.to_path_buf(),
        stats,
        manifold,
        graph,
        objects,
        points,
        image_sizes,
    })
}

/// Snaps positions onto a `merge_distance` grid so coincident vertices of
/// different primitives share one index.
struct Welder {
    cell: f32,
    index: HashMap<[i64; 3], u32>,
    points: Vec<[f32; 3]>,
}

impl Welder {
    fn new(cell: f32) -> Self {
        Self {
            cell,
            index: HashMap::new(),
            points: Vec::new(),
        }
    }

    fn key(&self, p: [f32; 3]) -> [i64; 3] {
        if self.cell > 0.0 {
            p.map(|v| (v / self.cell).round() as i64)
        } else {
            p.map(|v| i64::from(v.to_bits()))
        }
    }

    fn weld(&mut self, p: [f32; 3]) -> u32 {
        let key = self.key(p);
        let next = self.points.len() as u32;
        let id = *self.index.entry(key).or_insert(next);
        if id == next {
            self.points.push(p);
        }
        id
    }
}

fn collect_geometry(
    document: &Document,
    buffers: &[buffer::Data],
    merge_distance: f32,
) -> (Vec<[f32; 3]>, Vec<[u32; 3]>) {
    let mut welder = Welder::new(merge_distance);
    let mut triangles = Vec::new();

    let roots: Vec<gltf::Node> = match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => scene.nodes().collect(),
        None => {
            let mut is_child = vec![false; document.nodes().len()];
            for node in document.nodes() {
                for child in node.children() {
                    is_child[child.index()] = true;
                }
            }
            document.nodes().filter(|n| !is_child[n.index()]).collect()
        }
    };

    let mut visited = vec![false; document.nodes().len()];
    let mut stack: Vec<(gltf::Node, Mat4)> =
        roots.into_iter().map(|n| (n, Mat4::IDENTITY)).collect();

    while let Some((node, parent)) = stack.pop() {
        if std::mem::replace(&mut visited[node.index()], true) {
            warn!(node = node.index(), "node reachable twice, ignoring repeat");
            continue;
        }
        let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

        if let Some(mesh) = node.mesh() {
            for primitive in mesh.primitives() {
                let reader = primitive.reader(|b| buffers.get(b.index()).map(|d| &d.0[..]));
                let Some(positions) = reader.read_positions() else {
                    continue;
                };
                let welded: Vec<u32> = positions
                    .map(|p| {
                        let p = world.transform_point3(Vec3::from(p));
                        welder.weld(to_host_axes(p.to_array()))
                    })
                    .collect();

                if primitive.mode() != Mode::Triangles {
                    continue;
                }
                let indices: Vec<u32> = match reader.read_indices() {
                    Some(indices) => indices.into_u32().collect(),
                    None => (0..welded.len() as u32).collect(),
                };
                for tri in indices.chunks_exact(3) {
                    let corner = |i: u32| welded.get(i as usize).copied();
                    if let (Some(a), Some(b), Some(c)) = (corner(tri[0]), corner(tri[1]), corner(tri[2])) {
                        triangles.push([a, b, c]);
                    }
                }
            }
        }

        for child in node.children() {
            stack.push((child, world));
        }
    }

    (welder.points, triangles)
}

fn image_size(image: &gltf::Image, buffers: &[buffer::Data], base: &Path) -> Option<(u32, u32)> {
    let size = match image.source() {
        Source::View { view, .. } => {
            let data = buffers.get(view.buffer().index())?;
            let bytes = data.0.get(view.offset()..view.offset() + view.length())?;
            imagesize::blob_size(bytes).ok()?
        }
        Source::Uri { uri, .. } => {
            if uri.starts_with("data:") {
                return None;
            }
            let relative = percent_decode_str(uri).decode_utf8_lossy();
            imagesize::size(base.join(relative.as_ref())).ok()?
        }
    };
    Some((size.width as u32, size.height as u32))
}
