//! The group hierarchy, held in an arena so that cyclic files stay finite.
//!
//! Groups reference each other by [`GroupId`]. Hard links to a group that is
//! already known are recorded as extra edges instead of being traversed again,
//! and any edge that would make a group its own descendant is dropped.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::btree1::BTreeSymbolTable;
use crate::btree2::{BTree2, BTree2Record};
use crate::error::Error;
use crate::fractal_heap::FractalHeap;
use crate::io::OpenFile;
use crate::messages::{parse_link, parse_link_info, parse_symbol_table_message, Link, LinkTarget};
use crate::object_header::{
    ObjectHeader, MSG_DATA_LAYOUT, MSG_LINK, MSG_LINK_INFO, MSG_SYMBOL_TABLE,
};
use crate::superblock::RootGroup;
use crate::symbol_table::{read_symbol_table_node, EntryCache, LocalHeap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// A dataset member of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    pub name: String,
    pub object_header: u64,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    /// The group this one was first reached from; `None` for the root.
    pub parent: Option<GroupId>,
    /// Child groups by link name, including extra hard and soft links.
    pub groups: Vec<(String, GroupId)>,
    pub datasets: Vec<DatasetEntry>,
}

/// How a group stores its members.
#[derive(Debug, Clone, Copy)]
enum GroupStorage {
    SymbolTable { btree_address: u64, heap_address: u64 },
    Links { object_header: u64 },
}

impl GroupStorage {
    /// Identity used for hard-link dedup.
    fn key(&self) -> u64 {
        match self {
            GroupStorage::SymbolTable { btree_address, .. } => *btree_address,
            GroupStorage::Links { object_header } => *object_header,
        }
    }
}

/// What a link points at, once its object header has been looked at.
enum Member {
    Group(GroupStorage),
    Dataset(u64),
    SoftLink(String),
    Other,
}

struct PendingSoftLink {
    group: GroupId,
    name: String,
    path: String,
}

/// All groups of a file, indexed by [`GroupId`]; the root is `GroupId(0)`.
#[derive(Debug, Clone)]
pub struct GroupArena {
    groups: Vec<Group>,
    max_depth: usize,
}

impl GroupArena {
    pub const ROOT: GroupId = GroupId(0);

    /// Reads the whole hierarchy below the root group.
    pub fn build(file: &OpenFile, root: &RootGroup, max_depth: usize) -> Result<Self, Error> {
        let root_storage = match root {
            RootGroup::SymbolTable(entry) => match entry.cache {
                EntryCache::Group {
                    btree_address,
                    heap_address,
                } => GroupStorage::SymbolTable {
                    btree_address,
                    heap_address,
                },
                _ => match classify(file, entry.object_header, max_depth)? {
                    Member::Group(storage) => storage,
                    _ => return Err(Error::InvalidFileStructure("Root object is not a group".to_string())),
                },
            },
            RootGroup::ObjectHeader(address) => match classify(file, *address, max_depth)? {
                Member::Group(storage) => storage,
                _ => return Err(Error::InvalidFileStructure("Root object is not a group".to_string())),
            },
        };

        let mut arena = GroupArena {
            groups: Vec::new(),
            max_depth,
        };
        let mut by_key = HashMap::new();
        let root_id = arena.push(String::new(), None);
        by_key.insert(root_storage.key(), root_id);

        let mut soft_links = Vec::new();
        let mut work = vec![(root_id, root_storage)];
        while let Some((id, storage)) = work.pop() {
            for (name, member) in read_members(file, storage, max_depth)? {
                match member {
                    Member::Dataset(object_header) => arena.groups[id.0].datasets.push(DatasetEntry { name, object_header }),
                    Member::Group(child) => match by_key.get(&child.key()) {
                        Some(&existing) => arena.link_existing(id, name, existing),
                        None => {
                            let child_id = arena.push(name.clone(), Some(id));
                            by_key.insert(child.key(), child_id);
                            arena.groups[id.0].groups.push((name, child_id));
                            work.push((child_id, child));
                        }
                    },
                    Member::SoftLink(path) => soft_links.push(PendingSoftLink { group: id, name, path }),
                    Member::Other => debug!("skipping '{}': neither group nor dataset", name),
                }
            }
        }
        for link in soft_links {
            arena.resolve_soft_link(link);
        }
        debug!("group hierarchy: {} groups", arena.groups.len());
        Ok(arena)
    }

    fn push(&mut self, name: String, parent: Option<GroupId>) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(Group {
            name,
            parent,
            groups: Vec::new(),
            datasets: Vec::new(),
        });
        id
    }

    /// Adds `existing` as a child of `parent` unless that closes a loop.
    fn link_existing(&mut self, parent: GroupId, name: String, existing: GroupId) {
        if self.is_child_of(parent, existing) {
            warn!(
                "Dropping link '{}' in group '{}': it loops back to '{}'",
                name,
                self.path(parent),
                self.path(existing)
            );
            return;
        }
        debug!("'{}' in '{}' is another link to '{}'", name, self.path(parent), self.path(existing));
        self.groups[parent.0].groups.push((name, existing));
    }

    fn resolve_soft_link(&mut self, link: PendingSoftLink) {
        let base = if link.path.starts_with('/') { Self::ROOT } else { link.group };
        if let Some(target) = self.walk(base, &link.path) {
            return self.link_existing(link.group, link.name, target);
        }
        let (dir, leaf) = link.path.rsplit_once('/').unwrap_or(("", link.path.as_str()));
        let dataset = self.walk(base, dir).and_then(|dir_id| {
            self.groups[dir_id.0]
                .datasets
                .iter()
                .find(|d| d.name == leaf)
                .map(|d| d.object_header)
        });
        match dataset {
            Some(object_header) => self.groups[link.group.0].datasets.push(DatasetEntry {
                name: link.name,
                object_header,
            }),
            None => warn!("Dropping soft link '{}': target '{}' not found", link.name, link.path),
        }
    }

    /// Follows `/`-separated group names from `from`.
    fn walk(&self, from: GroupId, path: &str) -> Option<GroupId> {
        let mut id = from;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            id = if part == ".." {
                self.groups[id.0].parent.unwrap_or(Self::ROOT)
            } else {
                self.groups[id.0].groups.iter().find(|(n, _)| n == part)?.1
            };
        }
        Some(id)
    }

    /// True if `group` is `ancestor` or reachable from it through member links.
    pub fn is_child_of(&self, group: GroupId, ancestor: GroupId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![(ancestor, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if id == group {
                return true;
            }
            if depth > self.max_depth.max(self.groups.len()) || !visited.insert(id) {
                continue;
            }
            stack.extend(self.groups[id.0].groups.iter().map(|&(_, child)| (child, depth + 1)));
        }
        false
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id.0)
    }

    /// Absolute path of a group along its first-parent chain.
    pub fn path(&self, id: GroupId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(gid) = current {
            if gid == Self::ROOT || parts.len() > self.groups.len() {
                break;
            }
            let group = &self.groups[gid.0];
            parts.push(group.name.as_str());
            current = group.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Looks up a group by absolute or root-relative path.
    pub fn find_group(&self, path: &str) -> Option<GroupId> {
        self.walk(Self::ROOT, path)
    }

    /// Object header address of the dataset at `path`.
    pub fn find_dataset(&self, path: &str) -> Option<u64> {
        let trimmed = path.trim_start_matches('/');
        let (dir, leaf) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        let group = self.walk(Self::ROOT, dir)?;
        self.groups[group.0]
            .datasets
            .iter()
            .find(|d| d.name == leaf)
            .map(|d| d.object_header)
    }

    /// Every dataset as `(absolute path, object header address)`, depth first.
    pub fn datasets(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        let mut stack = vec![(Self::ROOT, String::new(), 0usize)];
        while let Some((id, prefix, depth)) = stack.pop() {
            let group = &self.groups[id.0];
            for d in &group.datasets {
                out.push((format!("{}/{}", prefix, d.name), d.object_header));
            }
            if depth >= self.max_depth {
                warn!("Group nesting deeper than {} below '{}'", self.max_depth, prefix);
                continue;
            }
            for (name, child) in group.groups.iter().rev() {
                stack.push((*child, format!("{}/{}", prefix, name), depth + 1));
            }
        }
        out
    }
}

/// Decides whether the object at `address` is a group or a dataset.
fn classify(file: &OpenFile, address: u64, max_depth: usize) -> Result<Member, Error> {
    let header = ObjectHeader::read(file, address, max_depth)?;
    if let Some(data) = header.message_data(file, MSG_SYMBOL_TABLE, max_depth)? {
        let (btree_address, heap_address) = parse_symbol_table_message(&data, file.ctx())?;
        return Ok(Member::Group(GroupStorage::SymbolTable {
            btree_address,
            heap_address,
        }));
    }
    if header.find(MSG_LINK_INFO).is_some() || header.find(MSG_LINK).is_some() {
        return Ok(Member::Group(GroupStorage::Links { object_header: address }));
    }
    if header.find(MSG_DATA_LAYOUT).is_some() {
        return Ok(Member::Dataset(address));
    }
    Ok(Member::Other)
}

fn read_members(file: &OpenFile, storage: GroupStorage, max_depth: usize) -> Result<Vec<(String, Member)>, Error> {
    match storage {
        GroupStorage::SymbolTable {
            btree_address,
            heap_address,
        } => read_symbol_table_members(file, btree_address, heap_address, max_depth),
        GroupStorage::Links { object_header } => {
            let links = read_links(file, object_header, max_depth)?;
            let mut members = Vec::with_capacity(links.len());
            for link in links {
                let member = match link.target {
                    LinkTarget::Hard(address) => classify(file, address, max_depth)?,
                    LinkTarget::Soft(path) => Member::SoftLink(path),
                    LinkTarget::External { file: other, path } => {
                        debug!("skipping external link '{}' to {}:{}", link.name, other, path);
                        Member::Other
                    }
                };
                members.push((link.name, member));
            }
            Ok(members)
        }
    }
}

fn read_symbol_table_members(
    file: &OpenFile,
    btree_address: u64,
    heap_address: u64,
    max_depth: usize,
) -> Result<Vec<(String, Member)>, Error> {
    let heap = LocalHeap::load(file, heap_address)?;
    let tree = BTreeSymbolTable::new(file, btree_address, max_depth);
    let mut members = Vec::new();
    for node in tree.read_group_entries()? {
        for entry in read_symbol_table_node(file, node.child_address)? {
            let name = heap.name_at(entry.name_offset)?;
            let member = match entry.cache {
                EntryCache::Group {
                    btree_address,
                    heap_address,
                } => Member::Group(GroupStorage::SymbolTable {
                    btree_address,
                    heap_address,
                }),
                EntryCache::SoftLink { link_offset } => Member::SoftLink(heap.name_at(link_offset as u64)?),
                EntryCache::None => classify(file, entry.object_header, max_depth)?,
            };
            members.push((name, member));
        }
    }
    Ok(members)
}

/// Links of a new-style group, compact or dense.
fn read_links(file: &OpenFile, object_header: u64, max_depth: usize) -> Result<Vec<Link>, Error> {
    let ctx = file.ctx();
    let header = ObjectHeader::read(file, object_header, max_depth)?;
    if let Some(data) = header.message_data(file, MSG_LINK_INFO, max_depth)? {
        let info = parse_link_info(&data, ctx)?;
        if !ctx.is_undefined(info.fractal_heap_address) {
            return read_link_heap_ids(file, info.name_btree_address, info.fractal_heap_address, max_depth)?
                .iter()
                .map(|raw| parse_link(raw, ctx))
                .collect();
        }
    }
    header
        .find_all(MSG_LINK)
        .map(|m| parse_link(&m.data, ctx))
        .collect()
}

/// Raw link messages of a dense group: every type 5 or 6 record of the
/// name index, resolved through the group's fractal heap.
pub fn read_link_heap_ids(
    file: &OpenFile,
    btree_address: u64,
    heap_address: u64,
    max_depth: usize,
) -> Result<Vec<Vec<u8>>, Error> {
    let heap = FractalHeap::open(file, heap_address, max_depth)?;
    let tree = BTree2::open(file, btree_address, 0, 0)?;
    let mut links = Vec::new();
    for record in tree.records()? {
        match record {
            BTree2Record::LinkName { heap_id, .. } | BTree2Record::LinkCreationOrder { heap_id, .. } => {
                links.push(heap.read_object(&heap_id)?);
            }
            other => warn!("Unexpected record {:?} in link name index at {}", other, btree_address),
        }
    }
    Ok(links)
}
