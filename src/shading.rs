//! Material → shading graph → node group arena, and the resolver that finds
//! which images a set of objects actually samples.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterialId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub name: String,
    /// glTF image index, when the graph was built from a document.
    pub source: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    ImageSample { image: Option<ImageId> },
    Group { tree: Option<TreeId> },
    Other { kind: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTree {
    pub name: String,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub use_nodes: bool,
    pub tree: Option<TreeId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    pub name: String,
    pub material_slots: Vec<Option<MaterialId>>,
}

#[derive(Debug, Clone, Default)]
pub struct ShadingGraph {
    images: Vec<Image>,
    trees: Vec<NodeTree>,
    materials: Vec<Material>,
    objects: Vec<Object>,
}

impl ShadingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, name: impl Into<String>) -> ImageId {
        self.images.push(Image {
            name: name.into(),
            source: None,
        });
        ImageId(self.images.len() - 1)
    }

    pub fn add_tree(&mut self, name: impl Into<String>) -> TreeId {
        self.trees.push(NodeTree {
            name: name.into(),
            nodes: Vec::new(),
        });
        TreeId(self.trees.len() - 1)
    }

    pub fn push_node(&mut self, tree: TreeId, node: Node) {
        self.trees[tree.0].nodes.push(node);
    }

    pub fn add_material(&mut self, name: impl Into<String>, tree: Option<TreeId>) -> MaterialId {
        self.materials.push(Material {
            name: name.into(),
            use_nodes: tree.is_some(),
            tree,
        });
        MaterialId(self.materials.len() - 1)
    }

    pub fn add_object(
        &mut self,
        name: impl Into<String>,
        material_slots: Vec<Option<MaterialId>>,
    ) -> ObjectId {
        self.objects.push(Object {
            name: name.into(),
            material_slots,
        });
        ObjectId(self.objects.len() - 1)
    }

    pub fn image(&self, id: ImageId) -> &Image {
        &self.images[id.0]
    }

    pub fn material_mut(&mut self, id: MaterialId) -> &mut Material {
        &mut self.materials[id.0]
    }

    pub fn image_ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        (0..self.images.len()).map(ImageId)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        (0..self.objects.len()).map(ObjectId)
    }

    /// Images reachable from the materials of `scope`, sorted by name.
    ///
    /// With no scope every loaded image is returned, for callers that cannot
    /// establish usage and must treat everything as used.
    pub fn used_images(&self, scope: Option<&[ObjectId]>) -> Vec<ImageId> {
        let Some(objects) = scope else {
            let all: Vec<_> = self.image_ids().collect();
            return self.sorted(all);
        };

        let mut found = BTreeSet::new();
        for object in objects {
            let Some(object) = self.objects.get(object.0) else {
                continue;
            };
            for id in object.material_slots.iter().flatten() {
                let Some(material) = self.materials.get(id.0) else {
                    continue;
                };
                if !material.use_nodes {
                    continue;
                }
                if let Some(tree) = material.tree.filter(|t| t.0 < self.trees.len()) {
                    self.collect_tree(tree, &mut found);
                }
            }
        }

        self.sorted(found)
    }

    /// Depth-first walk over `root` and the groups nested in it.
    ///
    /// A tree that is already on the expansion path is not entered again, so a
    /// group that contains itself (directly or through other groups) ends the
    /// walk instead of looping.
    fn collect_tree(&self, root: TreeId, found: &mut BTreeSet<ImageId>) {
        let mut expanding = vec![false; self.trees.len()];
        // (tree, next node index)
        let mut stack = vec![(root, 0usize)];
        expanding[root.0] = true;

        while let Some(frame) = stack.last_mut() {
            let (tree, cursor) = *frame;
            let Some(node) = self.trees[tree.0].nodes.get(cursor) else {
                expanding[tree.0] = false;
                stack.pop();
                continue;
            };
            frame.1 += 1;

            match node {
                Node::ImageSample { image: Some(image) } if image.0 < self.images.len() => {
                    found.insert(*image);
                }
                Node::Group { tree: Some(inner) } if expanding.get(inner.0) == Some(&false) => {
                    expanding[inner.0] = true;
                    stack.push((*inner, 0));
                }
                _ => {}
            }
        }
    }

    fn sorted(&self, ids: impl IntoIterator<Item = ImageId>) -> Vec<ImageId> {
        let mut ids: Vec<ImageId> = ids.into_iter().collect();
        ids.sort_by(|a, b| self.images[a.0].name.cmp(&self.images[b.0].name).then(a.cmp(b)));
        ids
    }

    /// One node tree per material with a sample node for every texture slot,
    /// one object per mesh whose slots are its primitives' materials.
    pub fn from_document(document: &gltf::Document) -> Self {
        let mut graph = ShadingGraph::new();

        for image in document.images() {
            let name = image
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("image_{}", image.index()));
            graph.images.push(Image {
                name,
                source: Some(image.index()),
            });
        }

        for material in document.materials() {
            let name = material
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("material_{}", material.index().unwrap_or(0)));
            let tree = graph.add_tree(name.clone());

            let pbr = material.pbr_metallic_roughness();
            let slots = [
                pbr.base_color_texture().map(|t| t.texture()),
                pbr.metallic_roughness_texture().map(|t| t.texture()),
                material.normal_texture().map(|t| t.texture()),
                material.occlusion_texture().map(|t| t.texture()),
                material.emissive_texture().map(|t| t.texture()),
            ];
            for texture in slots.into_iter().flatten() {
                graph.push_node(
                    tree,
                    Node::ImageSample {
                        image: Some(ImageId(texture.source().index())),
                    },
                );
            }
            graph.push_node(
                tree,
                Node::Other {
                    kind: "BSDF_PRINCIPLED".into(),
                },
            );

            graph.add_material(name, Some(tree));
        }

        for mesh in document.meshes() {
            let slots = mesh
                .primitives()
                .map(|p| p.material().index().map(MaterialId))
                .collect();
            let name = mesh
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("mesh_{}", mesh.index()));
            graph.add_object(name, slots);
        }

        graph
    }
}
