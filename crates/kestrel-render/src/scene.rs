//! Scene graph.
//!
//! Nodes live in an index arena. A node is either a plain transform node or
//! a mesh node that also draws a registered mesh with a material pipeline.
//! Each frame [`Scene::update_transforms`] recomputes world matrices from the
//! roots down and [`Scene::object_table`] flattens mesh nodes into the rows
//! the culling shader reads.

use crate::gpu_types::{GpuObject, ObjectFlags, SkinParams};
use crate::mesh::{MeshData, MeshId, MeshRegistry};
use glam::{Mat4, Quat, Vec3};
use kestrel_core::{Error, GrowableArray, MemoryTag, Result};

/// Handle of a scene node.
///
/// Slots are reused after removal; the generation tells the live node apart
/// from any earlier occupant, so a handle outlives its node safely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Arena slot of the node.
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Local transform as translation, rotation and scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// What a mesh node draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshInstance {
    pub mesh: MeshId,
    /// Material pipeline index; selects the main-pass draw bucket.
    pub pipeline: u32,
    pub flags: ObjectFlags,
}

impl MeshInstance {
    /// Visible, shadow casting instance.
    pub fn new(mesh: MeshId, pipeline: u32) -> Self {
        Self {
            mesh,
            pipeline,
            flags: ObjectFlags::VISIBLE | ObjectFlags::CASTS_SHADOW,
        }
    }
}

/// State common to every node.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub local: Transform,
    world: Mat4,
    parent: Option<NodeId>,
    children: GrowableArray<NodeId>,
}

impl Node {
    fn new(name: &str, local: Transform, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            local,
            world: local.matrix(),
            parent,
            children: GrowableArray::new(MemoryTag::Scene),
        }
    }

    /// World matrix as of the last [`Scene::update_transforms`].
    pub fn world(&self) -> Mat4 {
        self.world
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// A scene graph node.
#[derive(Debug)]
pub enum SceneNode {
    Node(Node),
    MeshNode { node: Node, instance: MeshInstance },
}

impl SceneNode {
    pub fn node(&self) -> &Node {
        match self {
            Self::Node(node) | Self::MeshNode { node, .. } => node,
        }
    }

    pub fn node_mut(&mut self) -> &mut Node {
        match self {
            Self::Node(node) | Self::MeshNode { node, .. } => node,
        }
    }

    pub fn mesh(&self) -> Option<&MeshInstance> {
        match self {
            Self::Node(_) => None,
            Self::MeshNode { instance, .. } => Some(instance),
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<SceneNode>,
}

/// Node arena plus the meshes its nodes draw.
pub struct Scene {
    nodes: GrowableArray<Slot>,
    free: GrowableArray<u32>,
    roots: GrowableArray<NodeId>,
    meshes: MeshRegistry,
    pipeline_count: u32,
}

impl Scene {
    /// Empty scene whose mesh nodes may use `pipeline_count` material pipelines.
    pub fn new(pipeline_count: u32) -> Self {
        Self {
            nodes: GrowableArray::new(MemoryTag::Scene),
            free: GrowableArray::new(MemoryTag::Scene),
            roots: GrowableArray::new(MemoryTag::Scene),
            meshes: MeshRegistry::new(),
            pipeline_count,
        }
    }

    pub fn pipeline_count(&self) -> u32 {
        self.pipeline_count
    }

    pub fn meshes(&self) -> &MeshRegistry {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut MeshRegistry {
        &mut self.meshes
    }

    pub fn register_mesh(&mut self, data: &MeshData) -> Result<MeshId> {
        self.meshes.register(data)
    }

    /// Add a transform node under `parent`, or as a root.
    pub fn add_node(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        local: Transform,
    ) -> Result<NodeId> {
        self.insert(parent, SceneNode::Node(Node::new(name, local, parent)))
    }

    /// Add a node drawing `instance`.
    pub fn add_mesh_node(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        local: Transform,
        instance: MeshInstance,
    ) -> Result<NodeId> {
        if self.meshes.get(instance.mesh).is_none() {
            return Err(Error::IndexOutOfRange {
                index: instance.mesh.0 as usize,
                length: self.meshes.len(),
            });
        }
        if instance.pipeline >= self.pipeline_count {
            return Err(Error::IndexOutOfRange {
                index: instance.pipeline as usize,
                length: self.pipeline_count as usize,
            });
        }
        self.insert(
            parent,
            SceneNode::MeshNode {
                node: Node::new(name, local, parent),
                instance,
            },
        )
    }

    fn insert(&mut self, parent: Option<NodeId>, node: SceneNode) -> Result<NodeId> {
        if let Some(parent) = parent {
            self.get(parent)?;
        }

        let id = match self.free.try_pop() {
            Some(index) => {
                let slot = &mut self.nodes[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.nodes.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: self.nodes.len() as u32 - 1,
                    generation: 0,
                }
            }
        };

        match parent {
            Some(parent) => self.get_mut(parent)?.node_mut().children.push(id),
            None => self.roots.push(id),
        }
        Ok(id)
    }

    /// Fails for ids whose node was removed, even if the slot is live again.
    pub fn get(&self, id: NodeId) -> Result<&SceneNode> {
        self.nodes
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(Error::IndexOutOfRange {
                index: id.index as usize,
                length: self.nodes.len(),
            })
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut SceneNode> {
        let length = self.nodes.len();
        self.nodes
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(Error::IndexOutOfRange {
                index: id.index as usize,
                length,
            })
    }

    /// Whether `id` still names a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_ok()
    }

    pub fn set_transform(&mut self, id: NodeId, local: Transform) -> Result<()> {
        self.get_mut(id)?.node_mut().local = local;
        Ok(())
    }

    /// Change the flags of a mesh node.
    pub fn set_flags(&mut self, id: NodeId, flags: ObjectFlags) -> Result<()> {
        match self.get_mut(id)? {
            SceneNode::MeshNode { instance, .. } => {
                instance.flags = flags;
                Ok(())
            }
            SceneNode::Node(_) => Err(Error::InvalidArgument(format!(
                "node {} has no mesh",
                id.index
            ))),
        }
    }

    /// Remove a node and its whole subtree.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        let parent = self.get(id)?.node().parent;
        match parent {
            Some(parent) => {
                let children = &mut self.get_mut(parent)?.node_mut().children;
                if let Some(pos) = children.iter().position(|&child| child == id) {
                    children.remove(pos)?;
                }
            }
            None => {
                if let Some(pos) = self.roots.iter().position(|&root| root == id) {
                    self.roots.remove(pos)?;
                }
            }
        }

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let slot = &mut self.nodes[current.index as usize];
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                stack.extend(node.node().children.iter().copied());
                self.free.push(current.index);
            }
        }
        Ok(())
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Recompute every world matrix from the roots down.
    pub fn update_transforms(&mut self) {
        let mut stack: Vec<(NodeId, Mat4)> = self
            .roots
            .iter()
            .rev()
            .map(|&root| (root, Mat4::IDENTITY))
            .collect();

        while let Some((id, parent_world)) = stack.pop() {
            let Some(scene_node) = self
                .nodes
                .get_mut(id.index as usize)
                .and_then(|slot| slot.node.as_mut())
            else {
                continue;
            };
            let node = scene_node.node_mut();
            node.world = parent_world * node.local.matrix();
            let world = node.world;
            stack.extend(node.children.iter().rev().map(|&child| (child, world)));
        }
    }

    /// Append one row per mesh node to `out`, in arena order.
    pub fn object_table(&self, out: &mut GrowableArray<GpuObject>) {
        out.clear();
        for scene_node in self.nodes.iter().filter_map(|slot| slot.node.as_ref()) {
            let SceneNode::MeshNode { node, instance } = scene_node else {
                continue;
            };
            let Some(mesh) = self.meshes.get(instance.mesh) else {
                continue;
            };
            out.push(GpuObject {
                transform: node.world.to_cols_array_2d(),
                bounds: mesh.bounds.to_vec4().to_array(),
                geometry: mesh.geometry,
                pipeline: instance.pipeline,
                flags: instance.flags.bits(),
                _pad: 0,
            });
        }
    }

    /// Skinning work for this frame.
    pub fn skin_jobs(&self) -> Vec<SkinParams> {
        self.meshes.skin_jobs().collect()
    }
}
