// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM entity association handling.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Entities, auxiliary names and the entity-association tree.
//!
//! Every sensor, effecter and FRU record set anchors onto an entity; the
//! association tree arranges the terminus's entities into the hierarchy the
//! inventory paths are synthesised from.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::{HashMap, VecDeque};

use deku::{DekuRead, DekuWrite};

/// A physical or logical unit inside a terminus.
///
/// Two entities are the same iff all three fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Entity {
    /// Entity type; the top bit marks a logical entity
    pub entity_type: u16,
    /// Instance number within the container
    pub entity_instance: u16,
    /// Container this entity belongs to
    pub container_id: u16,
}

impl Entity {
    /// Placeholder name for an entity without an auxiliary name.
    pub fn fallback_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.entity_type, self.entity_instance, self.container_id
        )
    }
}

/// A flat association parsed from one Entity Association PDR.
#[derive(Debug, Clone)]
pub struct AssociationNode {
    /// The containing entity
    pub container: Entity,
    /// Entities contained by it
    pub children: Vec<Entity>,
}

/// Replace characters unsupported in object paths.
///
/// Runs of characters outside `[a-zA-Z0-9_/]` collapse to a single `_`.
pub fn sanitize_name(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '/' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    // Discard the name if nothing printable survived
    if out.is_empty() || out.chars().all(|c| c == '_') {
        return None;
    }
    Some(out)
}

const MAX_NAME_UNITS: usize = 64;

// Null-terminated ASCII language tag. Unterminated tags longer than the
// name cap make later entries undecodable, so give up on them.
fn take_lang_tag(data: &[u8]) -> Option<(&str, &[u8])> {
    let nul = data
        .iter()
        .take(MAX_NAME_UNITS + 1)
        .position(|b| *b == 0)?;
    let tag = core::str::from_utf8(&data[..nul]).ok()?;
    Some((tag, &data[nul + 1..]))
}

// Null-terminated UTF-16BE name string, capped at 64 code units.
fn take_utf16_name(data: &[u8]) -> Option<(String, &[u8])> {
    let mut units = Vec::new();
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        let u = u16::from_be_bytes([c[0], c[1]]);
        if u == 0 {
            let consumed = (units.len() + 1) * 2;
            let name = String::from_utf16(&units).ok()?;
            return Some((name, &data[consumed..]));
        }
        if units.len() == MAX_NAME_UNITS {
            return None;
        }
        units.push(u);
    }
    None
}

/// Decode an auxiliary-name string block.
///
/// The block holds `name_string_count` entries of an ASCII language tag
/// followed by a UTF-16BE name. Only the English (`"en"`) name is published,
/// sanitised for use in object paths.
pub fn decode_aux_name(name_string_count: u8, data: &[u8]) -> Option<String> {
    let mut rest = data;
    for _ in 0..name_string_count {
        if rest.is_empty() {
            break;
        }
        let (tag, r) = take_lang_tag(rest)?;
        let (name, r) = take_utf16_name(r)?;
        if tag == "en" {
            return sanitize_name(&name);
        }
        rest = r;
    }
    None
}

struct Node {
    entity: Entity,
    children: Vec<usize>,
}

/// The entity-association tree for one terminus.
///
/// Index-based storage; node 0 is the root. Construction rejects any
/// association that would introduce a cycle. When several association PDRs
/// share the root container id their children are merged under one root; the
/// order of merged children is unspecified.
pub struct EntityTree {
    nodes: Vec<Node>,
}

impl EntityTree {
    /// Build the tree from parsed associations.
    ///
    /// The root is the association whose container's `container_id` equals
    /// the Terminus Locator's container id. Returns `None` when no root
    /// association exists.
    pub fn build(
        associations: Vec<AssociationNode>,
        container_id: u16,
    ) -> Option<EntityTree> {
        // Associations sharing a container entity merge into one node
        let mut merged: Vec<AssociationNode> = Vec::new();
        for assoc in associations {
            match merged
                .iter_mut()
                .find(|m| m.container == assoc.container)
            {
                Some(m) => m.children.extend(assoc.children),
                None => merged.push(assoc),
            }
        }

        let (roots, mut pending): (Vec<_>, Vec<_>) = merged
            .into_iter()
            .partition(|a| a.container.container_id == container_id);

        let root = roots.first()?.container;
        let mut tree = EntityTree {
            nodes: vec![Node {
                entity: root,
                children: Vec::new(),
            }],
        };

        for assoc in roots {
            tree.attach_children(0, &assoc.children);
        }

        // Attach the remaining associations wherever their container already
        // appears, until a pass makes no progress.
        loop {
            let before = pending.len();
            pending.retain(|assoc| {
                match tree.find(&assoc.container) {
                    Some(idx) => {
                        tree.attach_children(idx, &assoc.children);
                        false
                    }
                    None => true,
                }
            });
            if pending.is_empty() {
                break;
            }
            if pending.len() == before {
                warn!(
                    "{} entity association PDRs do not attach to the tree",
                    pending.len()
                );
                break;
            }
        }

        Some(tree)
    }

    fn attach_children(&mut self, parent: usize, children: &[Entity]) {
        for child in children {
            // An entity already anywhere in the tree would make this
            // association cyclic or duplicated
            if self.contains(child) {
                warn!("Discarding cyclic entity association");
                continue;
            }
            let idx = self.nodes.len();
            self.nodes.push(Node {
                entity: *child,
                children: Vec::new(),
            });
            self.nodes[parent].children.push(idx);
        }
    }

    fn find(&self, entity: &Entity) -> Option<usize> {
        // Breadth-first from the root
        let mut queue = VecDeque::from([0usize]);
        while let Some(idx) = queue.pop_front() {
            if self.nodes[idx].entity == *entity {
                return Some(idx);
            }
            queue.extend(&self.nodes[idx].children);
        }
        None
    }

    /// Whether `entity` is present in the tree.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.find(entity).is_some()
    }

    /// The root entity.
    pub fn root(&self) -> Entity {
        self.nodes[0].entity
    }

    /// Number of entities in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree is empty. Always false for a built tree.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entities reachable from the root, breadth-first.
    pub fn entities(&self) -> Vec<Entity> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([0usize]);
        while let Some(idx) = queue.pop_front() {
            out.push(self.nodes[idx].entity);
            queue.extend(&self.nodes[idx].children);
        }
        out
    }

    /// Synthesise the object path for every node.
    ///
    /// Paths join the auxiliary names (or a type/instance/container
    /// placeholder) from root to leaf below `prefix`. The first path wins
    /// when placeholder names collide.
    pub fn object_paths(
        &self,
        prefix: &str,
        names: &HashMap<Entity, String>,
    ) -> Vec<(String, Entity)> {
        let mut out = Vec::new();
        let name_of = |e: &Entity| {
            names
                .get(e)
                .cloned()
                .unwrap_or_else(|| e.fallback_name())
        };

        let mut stack = vec![(0usize, prefix.to_string())];
        while let Some((idx, path)) = stack.pop() {
            let node = &self.nodes[idx];
            let path = format!("{}/{}", path, name_of(&node.entity));
            for child in node.children.iter().rev() {
                stack.push((*child, path.clone()));
            }
            out.push((path, node.entity));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(t: u16, i: u16, c: u16) -> Entity {
        Entity {
            entity_type: t,
            entity_instance: i,
            container_id: c,
        }
    }

    #[test]
    fn names_sanitised() {
        assert_eq!(sanitize_name("CPU 0 Temp"), Some("CPU_0_Temp".into()));
        assert_eq!(sanitize_name("a-+b"), Some("a_b".into()));
        assert_eq!(sanitize_name("ok_name/sub"), Some("ok_name/sub".into()));
        // nothing printable
        assert_eq!(sanitize_name("!!!"), None);
        assert_eq!(sanitize_name(""), None);
    }

    fn name_block(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, name) in entries {
            out.extend_from_slice(tag.as_bytes());
            out.push(0);
            for u in name.encode_utf16() {
                out.extend_from_slice(&u.to_be_bytes());
            }
            out.extend_from_slice(&[0, 0]);
        }
        out
    }

    #[test]
    fn aux_name_decode() {
        let block = name_block(&[("de", "Lüfter"), ("en", "Fan 1")]);
        assert_eq!(decode_aux_name(2, &block), Some("Fan_1".into()));

        // no English entry
        let block = name_block(&[("de", "Lüfter")]);
        assert_eq!(decode_aux_name(1, &block), None);

        // over-long name is treated as invalid
        let long = "x".repeat(65);
        let block = name_block(&[("en", &long)]);
        assert_eq!(decode_aux_name(1, &block), None);

        // unterminated tag
        assert_eq!(decode_aux_name(1, b"en"), None);
    }

    #[test]
    fn tree_build_and_merge() {
        // locator container 100; two root associations merge
        let assocs = vec![
            AssociationNode {
                container: e(1, 1, 100),
                children: vec![e(2, 1, 1), e(2, 2, 1)],
            },
            AssociationNode {
                container: e(1, 1, 100),
                children: vec![e(3, 1, 1)],
            },
            AssociationNode {
                container: e(2, 1, 1),
                children: vec![e(4, 1, 2)],
            },
        ];
        let tree = EntityTree::build(assocs, 100).unwrap();
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.root(), e(1, 1, 100));
        assert!(tree.contains(&e(4, 1, 2)));

        // BFS reaches every node exactly once
        let ents = tree.entities();
        assert_eq!(ents.len(), 5);
        let mut dedup = ents.clone();
        dedup.sort_by_key(|e| (e.entity_type, e.entity_instance));
        dedup.dedup();
        assert_eq!(dedup.len(), 5);
    }

    #[test]
    fn tree_rejects_cycles() {
        // the root entity reappearing as a child is discarded
        let assocs = vec![
            AssociationNode {
                container: e(1, 1, 100),
                children: vec![e(2, 1, 1)],
            },
            AssociationNode {
                container: e(2, 1, 1),
                children: vec![e(1, 1, 100), e(3, 1, 2)],
            },
        ];
        let tree = EntityTree::build(assocs, 100).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree.contains(&e(3, 1, 2)));
    }

    #[test]
    fn tree_missing_root() {
        let assocs = vec![AssociationNode {
            container: e(1, 1, 5),
            children: vec![e(2, 1, 1)],
        }];
        assert!(EntityTree::build(assocs, 100).is_none());
    }

    #[test]
    fn object_path_synthesis() {
        let assocs = vec![AssociationNode {
            container: e(1, 1, 100),
            children: vec![e(2, 1, 1)],
        }];
        let tree = EntityTree::build(assocs, 100).unwrap();

        let mut names = HashMap::new();
        names.insert(e(1, 1, 100), "Board".to_string());

        let paths = tree.object_paths("system/1", &names);
        assert_eq!(paths.len(), 2);
        assert!(paths
            .iter()
            .any(|(p, _)| p == "system/1/Board"));
        assert!(paths
            .iter()
            .any(|(p, _)| p == "system/1/Board/2_1_1"));
    }
}
