//! Arena-backed coding tree
//!
//! Units are stored in a flat vector and address each other by index:
//! every node knows its parent and a meta-chunk lists its children. The
//! root is a meta-chunk named `""`; the child `i` of a unit named `p` is
//! named `p.i`.

use crate::coding::Policy;
use crate::error::VdaError;
use crate::host::HostId;
use crate::storage::{path_to_name, Chunk, Placement, Status, UnitId, UnitState};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Interior node: one level of erasure coding over its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaChunk {
    /// Children in piece order; there are `coding.m` of them
    pub children: Vec<UnitId>,
    /// Index into the policy's codings governing the children
    pub level: usize,
    /// Set by planning when some child is lost
    pub have_unrecoverable_children: bool,
}

/// The two kinds of data unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitKind {
    Chunk(Chunk),
    Meta(MetaChunk),
}

/// A node of the coding tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUnit {
    /// Dotted tree position
    pub name: String,
    /// Same position as child indices
    pub path: Vec<usize>,
    pub parent: Option<UnitId>,
    pub state: UnitState,
    pub kind: UnitKind,
}

impl DataUnit {
    /// Chunk payload, if this unit is a chunk
    pub fn as_chunk(&self) -> Option<&Chunk> {
        match &self.kind {
            UnitKind::Chunk(c) => Some(c),
            UnitKind::Meta(_) => None,
        }
    }

    /// Mutable chunk payload
    pub fn as_chunk_mut(&mut self) -> Option<&mut Chunk> {
        match &mut self.kind {
            UnitKind::Chunk(c) => Some(c),
            UnitKind::Meta(_) => None,
        }
    }

    /// Meta-chunk payload, if this unit is a meta-chunk
    pub fn as_meta(&self) -> Option<&MetaChunk> {
        match &self.kind {
            UnitKind::Meta(m) => Some(m),
            UnitKind::Chunk(_) => None,
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self.kind, UnitKind::Chunk(_))
    }
}

/// The whole coding tree of one archived file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingTree {
    policy: Policy,
    units: Vec<DataUnit>,
    #[serde(skip)]
    by_name: HashMap<String, UnitId>,
}

impl CodingTree {
    /// Build the full tree for a policy
    ///
    /// Piece sizes come from `policy.chunk_sizes`; when unset, sizes are 0.
    pub fn build(policy: Policy) -> Self {
        let mut tree = Self {
            policy,
            units: Vec::new(),
            by_name: HashMap::new(),
        };
        tree.build_unit(None, Vec::new(), 0);
        tree
    }

    fn build_unit(&mut self, parent: Option<UnitId>, path: Vec<usize>, level: usize) -> UnitId {
        let id = self.units.len();
        let name = path_to_name(&path);
        let kind = if level < self.policy.levels() {
            UnitKind::Meta(MetaChunk {
                children: Vec::new(),
                level,
                have_unrecoverable_children: false,
            })
        } else {
            let size = self.policy.chunk_size().unwrap_or(0.0);
            UnitKind::Chunk(Chunk::new(size))
        };

        self.by_name.insert(name.clone(), id);
        self.units.push(DataUnit {
            name,
            path: path.clone(),
            parent,
            state: UnitState::default(),
            kind,
        });

        if level < self.policy.levels() {
            let m = self.policy.codings[level].m;
            let children: Vec<UnitId> = (0..m)
                .map(|i| {
                    let mut child_path = path.clone();
                    child_path.push(i);
                    self.build_unit(Some(id), child_path, level + 1)
                })
                .collect();
            if let UnitKind::Meta(meta) = &mut self.units[id].kind {
                meta.children = children;
            }
        }
        id
    }

    /// Rebuild the name index after deserialization
    pub fn reindex(&mut self) {
        self.by_name = self
            .units
            .iter()
            .enumerate()
            .map(|(id, u)| (u.name.clone(), id))
            .collect();
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The root meta-chunk
    pub fn root(&self) -> UnitId {
        0
    }

    pub fn unit(&self, id: UnitId) -> &DataUnit {
        &self.units[id]
    }

    pub fn unit_mut(&mut self, id: UnitId) -> &mut DataUnit {
        &mut self.units[id]
    }

    /// Total number of units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Children of a unit (empty for chunks)
    pub fn children(&self, id: UnitId) -> &[UnitId] {
        match &self.units[id].kind {
            UnitKind::Meta(m) => &m.children,
            UnitKind::Chunk(_) => &[],
        }
    }

    /// Look up a unit by dotted name
    pub fn find(&self, name: &str) -> Option<UnitId> {
        self.by_name.get(name).copied()
    }

    /// Look up a unit by index path
    pub fn find_path(&self, path: &[usize]) -> Option<UnitId> {
        let mut id = self.root();
        for &i in path {
            id = *self.children(id).get(i)?;
        }
        Some(id)
    }

    /// Ids of all bottom-level chunks
    pub fn chunk_ids(&self) -> Vec<UnitId> {
        (0..self.units.len())
            .filter(|&id| self.units[id].is_chunk())
            .collect()
    }

    /// Chunk payload of unit `id`
    pub fn chunk(&self, id: UnitId) -> Result<&Chunk> {
        self.units[id]
            .as_chunk()
            .ok_or_else(|| VdaError::NotFound(format!("chunk '{}'", self.units[id].name)))
    }

    /// Mutable chunk payload of unit `id`
    pub fn chunk_mut(&mut self, id: UnitId) -> Result<&mut Chunk> {
        let name = self.units[id].name.clone();
        self.units[id]
            .as_chunk_mut()
            .ok_or_else(|| VdaError::NotFound(format!("chunk '{}'", name)))
    }

    /// Record a replica of chunk `name`
    pub fn add_placement(&mut self, name: &str, placement: Placement) -> Result<bool> {
        let id = self
            .find(name)
            .ok_or_else(|| VdaError::NotFound(format!("chunk '{}'", name)))?;
        Ok(self.chunk_mut(id)?.add_placement(placement))
    }

    /// Chunks with a replica on `host_id`
    pub fn chunks_on_host(&self, host_id: HostId) -> Vec<UnitId> {
        self.chunk_ids()
            .into_iter()
            .filter(|&id| {
                self.units[id]
                    .as_chunk()
                    .map(|c| c.is_on_host(host_id))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Drop every replica on `host_id`, returning the affected chunks
    pub fn remove_host(&mut self, host_id: HostId) -> Vec<UnitId> {
        let affected = self.chunks_on_host(host_id);
        for &id in &affected {
            if let Some(chunk) = self.units[id].as_chunk_mut() {
                chunk.remove_placement(host_id);
            }
        }
        affected
    }

    /// Bytes currently stored on the server
    pub fn server_bytes(&self) -> f64 {
        self.units
            .iter()
            .filter_map(|u| u.as_chunk())
            .filter(|c| c.present_on_server)
            .map(|c| c.size)
            .sum()
    }

    /// Status of the root
    pub fn status(&self) -> Status {
        self.units[self.root()].state.status
    }

    /// One line per unit, indented by depth
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.render_unit(self.root(), &mut lines);
        lines
    }

    fn render_unit(&self, id: UnitId, lines: &mut Vec<String>) {
        let unit = &self.units[id];
        let indent = "  ".repeat(unit.path.len());
        let name = if unit.name.is_empty() { "root" } else { unit.name.as_str() };
        let failures = match unit.state.fault_tolerance() {
            None => "inf".to_string(),
            Some(_) => unit.state.min_failures.to_string(),
        };
        let extra = match &unit.kind {
            UnitKind::Chunk(c) => format!(
                " server={} hosts={}",
                c.present_on_server,
                c.replica_count()
            ),
            UnitKind::Meta(_) => String::new(),
        };
        lines.push(format!(
            "{}{} {} cost={:.0} min_failures={}{}",
            indent, name, unit.state.status, unit.state.cost, failures, extra
        ));
        for &child in self.children(id) {
            self.render_unit(child, lines);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_policy() -> Policy {
        let mut policy = Policy::parse("2 2 3 1 3 2 1 2").unwrap();
        policy.compute_chunk_sizes(6000.0);
        policy
    }

    #[test]
    fn test_tree_shape() {
        let tree = CodingTree::build(two_level_policy());
        // root + 4 metas + 4*3 chunks
        assert_eq!(tree.len(), 1 + 4 + 12);
        assert_eq!(tree.children(tree.root()).len(), 4);
        assert_eq!(tree.chunk_ids().len(), 12);

        let id = tree.find("2.1").unwrap();
        assert_eq!(tree.unit(id).path, vec![2, 1]);
        assert_eq!(tree.find_path(&[2, 1]), Some(id));
        assert_eq!(tree.chunk(id).unwrap().size, 1000.0);

        let parent = tree.unit(id).parent.unwrap();
        assert_eq!(tree.unit(parent).name, "2");
        assert_eq!(tree.unit(parent).as_meta().unwrap().level, 1);
    }

    #[test]
    fn test_host_placements() {
        let mut tree = CodingTree::build(two_level_policy());
        assert!(tree.add_placement("0.0", Placement::stored(5)).unwrap());
        assert!(tree.add_placement("1.2", Placement::downloading(5)).unwrap());
        assert!(tree.add_placement("1.2", Placement::stored(6)).unwrap());
        assert!(tree.add_placement("nope", Placement::stored(6)).is_err());
        assert!(tree.add_placement("1", Placement::stored(6)).is_err());

        assert_eq!(tree.chunks_on_host(5).len(), 2);
        let affected = tree.remove_host(5);
        assert_eq!(affected.len(), 2);
        assert!(tree.chunks_on_host(5).is_empty());
        assert_eq!(tree.chunks_on_host(6).len(), 1);
    }

    #[test]
    fn test_reindex_after_serde() {
        let tree = CodingTree::build(two_level_policy());
        let json = serde_json::to_string(&tree).unwrap();
        let mut restored: CodingTree = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.find("3.2"), None);
        restored.reindex();
        assert_eq!(restored.find("3.2"), tree.find("3.2"));
    }

    #[test]
    fn test_render() {
        let tree = CodingTree::build(two_level_policy());
        let lines = tree.render();
        assert_eq!(lines.len(), tree.len());
        assert!(lines[0].starts_with("root UNRECOVERABLE"));
        assert!(lines[1].starts_with("  0 "));
    }
}
