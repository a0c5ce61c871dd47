use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Result, SelvaError};
use crate::pager::PageStore;
use crate::record::{RecordId, RecordManager};
use crate::spatial::{Rect, SpatialEntry, ENTRY_ENCODED_SIZE};

const NODE_HEADER_SIZE: usize = 4;

/// Sizing parameters for an [`RTree`].
#[derive(Clone, Copy, Debug)]
pub struct RTreeOptions {
    /// Minimum entries per node after a split.
    pub min_entries: usize,
    /// Maximum entries a node holds before splitting.
    pub max_entries: usize,
}

impl Default for RTreeOptions {
    fn default() -> Self {
        Self {
            min_entries: 2,
            max_entries: 8,
        }
    }
}

/// A node observed during a traversal, offered to piggybacking hooks.
#[derive(Clone, Copy, Debug)]
pub struct NodeVisit {
    /// Record id of the node.
    pub node: RecordId,
    /// Node level; 0 is the leaf level.
    pub level: u16,
    /// Bounding rectangle computed from the node's entries.
    pub mbr: Rect,
}

type EntryList = SmallVec<[SpatialEntry; 8]>;

struct Node {
    level: u16,
    entries: EntryList,
}

impl Node {
    fn leaf() -> Self {
        Self {
            level: 0,
            entries: SmallVec::new(),
        }
    }

    fn mbr(&self) -> Rect {
        let mut iter = self.entries.iter();
        let first = iter
            .next()
            .map(|e| e.mbr)
            .unwrap_or_else(|| Rect::point([0.0, 0.0]));
        iter.fold(first, |acc, e| acc.union(&e.mbr))
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NODE_HEADER_SIZE + self.entries.len() * ENTRY_ENCODED_SIZE);
        out.extend_from_slice(&self.level.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for entry in &self.entries {
            entry.encode_into(&mut out);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(SelvaError::Corruption("tree node encoding truncated".into()));
        }
        let level = u16::from_le_bytes(bytes[0..2].try_into().expect("2 bytes"));
        let count = u16::from_le_bytes(bytes[2..4].try_into().expect("2 bytes")) as usize;
        if bytes.len() < NODE_HEADER_SIZE + count * ENTRY_ENCODED_SIZE {
            return Err(SelvaError::Corruption(
                "tree node shorter than its entry count".into(),
            ));
        }
        let mut entries = SmallVec::with_capacity(count);
        for idx in 0..count {
            let start = NODE_HEADER_SIZE + idx * ENTRY_ENCODED_SIZE;
            entries.push(SpatialEntry::decode(&bytes[start..start + ENTRY_ENCODED_SIZE])?);
        }
        Ok(Self { level, entries })
    }
}

enum Grown {
    Fit(Rect),
    Split(Rect, SpatialEntry),
}

/// R-tree storing key-pointer entries in node records managed by a
/// [`RecordManager`].
///
/// Branch entries pair a child's bounding rectangle with the child's node
/// record id; leaf entries pair an object's rectangle with its payload id.
pub struct RTree<S: PageStore> {
    records: RecordManager<S>,
    root: Option<RecordId>,
    opts: RTreeOptions,
    len: usize,
}

impl<S: PageStore> RTree<S> {
    /// Creates an empty tree storing its nodes through `records`.
    ///
    /// The record manager must use the mapped id strategy so node ids stay
    /// stable when node records grow and relocate.
    pub fn new(records: RecordManager<S>, opts: RTreeOptions) -> Result<Self> {
        if opts.min_entries < 1 || opts.max_entries < 2 * opts.min_entries {
            return Err(SelvaError::InvalidArgument(
                "tree node capacity bounds are inconsistent".into(),
            ));
        }
        Ok(Self {
            records,
            root: None,
            opts,
            len: 0,
        })
    }

    /// Number of data entries in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum entries a node may hold.
    pub fn node_capacity(&self) -> usize {
        self.opts.max_entries
    }

    /// The record manager the tree stores its nodes through.
    pub fn records_mut(&mut self) -> &mut RecordManager<S> {
        &mut self.records
    }

    /// Inserts an entry.
    pub fn insert(&mut self, entry: SpatialEntry) -> Result<()> {
        match self.root {
            None => {
                let mut node = Node::leaf();
                node.entries.push(entry);
                let id = self.create_node(&node)?;
                self.root = Some(id);
            }
            Some(root_id) => {
                if let Grown::Split(root_mbr, sibling) = self.insert_rec(root_id, entry)? {
                    let old_level = self.load_node(root_id)?.level;
                    let mut new_root = Node {
                        level: old_level + 1,
                        entries: SmallVec::new(),
                    };
                    new_root.entries.push(SpatialEntry::new(root_mbr, root_id));
                    new_root.entries.push(sibling);
                    let new_root_id = self.create_node(&new_root)?;
                    trace!(level = new_root.level, "tree grew a new root");
                    self.root = Some(new_root_id);
                }
            }
        }
        self.len += 1;
        Ok(())
    }

    /// Removes the entry with the target's id, guided by its rectangle.
    ///
    /// Returns `false` when no matching entry was found.
    pub fn delete(&mut self, target: &SpatialEntry) -> Result<bool> {
        let Some(root_id) = self.root else {
            return Ok(false);
        };
        let (found, remaining) = self.delete_rec(root_id, target)?;
        if !found {
            return Ok(false);
        }
        self.len -= 1;
        if remaining.is_none() {
            self.root = None;
            return Ok(true);
        }
        // Collapse root chains left behind by subtree removals.
        while let Some(root_id) = self.root {
            let node = self.load_node(root_id)?;
            if node.level > 0 && node.entries.len() == 1 {
                let child = node.entries[0].id;
                self.records.remove(root_id)?;
                self.root = Some(child);
            } else {
                break;
            }
        }
        Ok(true)
    }

    /// Returns all entries whose rectangles intersect `region`.
    pub fn query(&mut self, region: &Rect) -> Result<Vec<SpatialEntry>> {
        self.query_with_visits(region, |_| {})
    }

    /// Query that reports every visited node to `visitor`.
    pub fn query_with_visits<F>(&mut self, region: &Rect, mut visitor: F) -> Result<Vec<SpatialEntry>>
    where
        F: FnMut(&NodeVisit),
    {
        let mut out = Vec::new();
        let Some(root_id) = self.root else {
            return Ok(out);
        };
        let mut stack = vec![root_id];
        while let Some(node_id) = stack.pop() {
            let node = self.load_node(node_id)?;
            visitor(&NodeVisit {
                node: node_id,
                level: node.level,
                mbr: node.mbr(),
            });
            for entry in &node.entries {
                if entry.mbr.intersects(region) {
                    if node.level == 0 {
                        out.push(*entry);
                    } else {
                        stack.push(entry.id);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Visits every leaf intersecting `region`, letting `f` rewrite its
    /// entries in place.
    ///
    /// `f` returns whether it modified the leaf. Modified leaves are
    /// written back without touching ancestor rectangles, which may leave
    /// them loose until the next re-tightening pass.
    pub fn traverse_leaves<F>(&mut self, region: &Rect, mut f: F) -> Result<()>
    where
        F: FnMut(&NodeVisit, &mut Vec<SpatialEntry>) -> Result<bool>,
    {
        let Some(root_id) = self.root else {
            return Ok(());
        };
        let mut leaves = Vec::new();
        let mut stack = vec![root_id];
        while let Some(node_id) = stack.pop() {
            let node = self.load_node(node_id)?;
            if node.level == 0 {
                if node.mbr().intersects(region) {
                    leaves.push(node_id);
                }
            } else {
                for entry in &node.entries {
                    if entry.mbr.intersects(region) {
                        stack.push(entry.id);
                    }
                }
            }
        }

        for leaf_id in leaves {
            let node = self.load_node(leaf_id)?;
            let visit = NodeVisit {
                node: leaf_id,
                level: 0,
                mbr: node.mbr(),
            };
            let before = node.entries.len();
            let mut entries: Vec<SpatialEntry> = node.entries.to_vec();
            if f(&visit, &mut entries)? {
                if entries.is_empty() || entries.len() > self.opts.max_entries {
                    return Err(SelvaError::InvalidArgument(
                        "piggyback hook left leaf outside capacity bounds".into(),
                    ));
                }
                let after = entries.len();
                let rewritten = Node {
                    level: 0,
                    entries: entries.into_iter().collect(),
                };
                self.store_node(leaf_id, &rewritten)?;
                if after >= before {
                    self.len += after - before;
                } else {
                    self.len -= before - after;
                }
            }
        }
        Ok(())
    }

    /// Children of the root with their rectangles, for grouping flush work.
    ///
    /// Empty when the tree has no root; a single pseudo-group when the
    /// root is itself a leaf.
    pub fn root_children(&mut self) -> Result<Vec<SpatialEntry>> {
        let Some(root_id) = self.root else {
            return Ok(Vec::new());
        };
        let node = self.load_node(root_id)?;
        if node.level == 0 {
            return Ok(vec![SpatialEntry::new(node.mbr(), root_id)]);
        }
        Ok(node.entries.to_vec())
    }

    /// Recomputes ancestor rectangles bottom-up, reporting every node
    /// whose stored rectangle needed rewriting.
    pub fn retighten<F>(&mut self, mut on_write: F) -> Result<usize>
    where
        F: FnMut(&NodeVisit),
    {
        let Some(root_id) = self.root else {
            return Ok(0);
        };
        let mut writes = 0;
        self.retighten_rec(root_id, &mut on_write, &mut writes)?;
        Ok(writes)
    }

    fn retighten_rec<F>(
        &mut self,
        node_id: RecordId,
        on_write: &mut F,
        writes: &mut usize,
    ) -> Result<Rect>
    where
        F: FnMut(&NodeVisit),
    {
        let mut node = self.load_node(node_id)?;
        if node.level == 0 {
            return Ok(node.mbr());
        }
        let mut changed = false;
        for idx in 0..node.entries.len() {
            let child_mbr = self.retighten_rec(node.entries[idx].id, on_write, writes)?;
            if child_mbr != node.entries[idx].mbr {
                node.entries[idx].mbr = child_mbr;
                changed = true;
            }
        }
        if changed {
            self.store_node(node_id, &node)?;
            *writes += 1;
            on_write(&NodeVisit {
                node: node_id,
                level: node.level,
                mbr: node.mbr(),
            });
        }
        Ok(node.mbr())
    }

    /// Verifies that every branch rectangle contains its subtree.
    pub fn check_invariants(&mut self) -> Result<()> {
        let Some(root_id) = self.root else {
            return Ok(());
        };
        self.check_rec(root_id)?;
        Ok(())
    }

    fn check_rec(&mut self, node_id: RecordId) -> Result<Rect> {
        let node = self.load_node(node_id)?;
        if node.entries.is_empty() {
            return Err(SelvaError::Corruption("empty tree node".into()));
        }
        if node.level == 0 {
            return Ok(node.mbr());
        }
        for entry in node.entries.iter() {
            let child_mbr = self.check_rec(entry.id)?;
            if !entry.mbr.contains(&child_mbr) {
                return Err(SelvaError::Corruption(format!(
                    "branch rectangle does not contain child {}",
                    entry.id
                )));
            }
        }
        Ok(node.mbr())
    }

    /// All data entries, in no particular order.
    pub fn iter_all(&mut self) -> Result<Vec<SpatialEntry>> {
        let mut out = Vec::new();
        let Some(root_id) = self.root else {
            return Ok(out);
        };
        let mut stack = vec![root_id];
        while let Some(node_id) = stack.pop() {
            let node = self.load_node(node_id)?;
            for entry in &node.entries {
                if node.level == 0 {
                    out.push(*entry);
                } else {
                    stack.push(entry.id);
                }
            }
        }
        Ok(out)
    }

    fn insert_rec(&mut self, node_id: RecordId, entry: SpatialEntry) -> Result<Grown> {
        let mut node = self.load_node(node_id)?;
        if node.level == 0 {
            node.entries.push(entry);
        } else {
            let idx = choose_subtree(&node.entries, &entry.mbr);
            let child_id = node.entries[idx].id;
            match self.insert_rec(child_id, entry)? {
                Grown::Fit(child_mbr) => node.entries[idx].mbr = child_mbr,
                Grown::Split(child_mbr, sibling) => {
                    node.entries[idx].mbr = child_mbr;
                    node.entries.push(sibling);
                }
            }
        }

        if node.entries.len() > self.opts.max_entries {
            let sibling = self.split_node(node_id, &mut node)?;
            Ok(Grown::Split(node.mbr(), sibling))
        } else {
            self.store_node(node_id, &node)?;
            Ok(Grown::Fit(node.mbr()))
        }
    }

    fn delete_rec(
        &mut self,
        node_id: RecordId,
        target: &SpatialEntry,
    ) -> Result<(bool, Option<Rect>)> {
        let mut node = self.load_node(node_id)?;
        if node.level == 0 {
            let Some(pos) = node
                .entries
                .iter()
                .position(|e| e.id == target.id && e.mbr.intersects(&target.mbr))
            else {
                return Ok((false, Some(node.mbr())));
            };
            node.entries.remove(pos);
            if node.entries.is_empty() {
                self.records.remove(node_id)?;
                return Ok((true, None));
            }
            self.store_node(node_id, &node)?;
            return Ok((true, Some(node.mbr())));
        }

        for idx in 0..node.entries.len() {
            if !node.entries[idx].mbr.intersects(&target.mbr) {
                continue;
            }
            let child_id = node.entries[idx].id;
            let (found, child_mbr) = self.delete_rec(child_id, target)?;
            if !found {
                continue;
            }
            match child_mbr {
                Some(mbr) => node.entries[idx].mbr = mbr,
                None => {
                    node.entries.remove(idx);
                }
            }
            if node.entries.is_empty() {
                self.records.remove(node_id)?;
                return Ok((true, None));
            }
            self.store_node(node_id, &node)?;
            return Ok((true, Some(node.mbr())));
        }
        Ok((false, Some(node.mbr())))
    }

    fn split_node(&mut self, node_id: RecordId, node: &mut Node) -> Result<SpatialEntry> {
        let (kept, moved) = quadratic_split(std::mem::take(&mut node.entries), self.opts.min_entries);
        node.entries = kept;
        let sibling = Node {
            level: node.level,
            entries: moved,
        };
        let sibling_id = self.create_node(&sibling)?;
        self.store_node(node_id, node)?;
        trace!(level = node.level, "tree node split");
        Ok(SpatialEntry::new(sibling.mbr(), sibling_id))
    }

    fn load_node(&mut self, id: RecordId) -> Result<Node> {
        Node::decode(&self.records.get(id)?)
    }

    fn store_node(&mut self, id: RecordId, node: &Node) -> Result<()> {
        let updated = self.records.update(id, &node.encode())?;
        debug_assert_eq!(updated, id, "node ids must be stable");
        Ok(())
    }

    fn create_node(&mut self, node: &Node) -> Result<RecordId> {
        self.records.insert(&node.encode())
    }
}

fn choose_subtree(entries: &[SpatialEntry], mbr: &Rect) -> usize {
    let mut best = 0;
    let mut best_enlargement = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (idx, entry) in entries.iter().enumerate() {
        let enlargement = entry.mbr.enlargement(mbr);
        let area = entry.mbr.area();
        if enlargement < best_enlargement
            || (enlargement == best_enlargement && area < best_area)
        {
            best = idx;
            best_enlargement = enlargement;
            best_area = area;
        }
    }
    best
}

/// Quadratic split: seeds maximize dead space, remaining entries go to the
/// group needing the least enlargement, with minimum fill enforced.
fn quadratic_split(entries: EntryList, min_entries: usize) -> (EntryList, EntryList) {
    debug_assert!(entries.len() >= 2);
    let mut seed_a = 0;
    let mut seed_b = 1;
    let mut worst = f64::NEG_INFINITY;
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let dead = entries[i].mbr.union(&entries[j].mbr).area()
                - entries[i].mbr.area()
                - entries[j].mbr.area();
            if dead > worst {
                worst = dead;
                seed_a = i;
                seed_b = j;
            }
        }
    }

    let mut group_a: EntryList = SmallVec::new();
    let mut group_b: EntryList = SmallVec::new();
    let mut mbr_a = entries[seed_a].mbr;
    let mut mbr_b = entries[seed_b].mbr;
    group_a.push(entries[seed_a]);
    group_b.push(entries[seed_b]);

    let mut rest: Vec<SpatialEntry> = entries
        .into_iter()
        .enumerate()
        .filter(|&(idx, _)| idx != seed_a && idx != seed_b)
        .map(|(_, e)| e)
        .collect();

    while let Some(entry) = rest.pop() {
        // A group that needs every remaining entry to reach minimum fill
        // takes them unconditionally.
        if group_a.len() + rest.len() + 1 <= min_entries {
            mbr_a = mbr_a.union(&entry.mbr);
            group_a.push(entry);
            continue;
        }
        if group_b.len() + rest.len() + 1 <= min_entries {
            mbr_b = mbr_b.union(&entry.mbr);
            group_b.push(entry);
            continue;
        }
        let grow_a = mbr_a.enlargement(&entry.mbr);
        let grow_b = mbr_b.enlargement(&entry.mbr);
        if grow_a < grow_b || (grow_a == grow_b && group_a.len() <= group_b.len()) {
            mbr_a = mbr_a.union(&entry.mbr);
            group_a.push(entry);
        } else {
            mbr_b = mbr_b.union(&entry.mbr);
            group_b.push(entry);
        }
    }
    (group_a, group_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemoryPageStore;
    use crate::record::{FirstFit, IdStrategyKind, RecordManagerOptions};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn tree() -> RTree<MemoryPageStore> {
        let records = RecordManager::new(
            MemoryPageStore::with_page_size(1024),
            Box::new(FirstFit::new()),
            RecordManagerOptions {
                id_strategy: IdStrategyKind::Mapped,
                reserved_bytes: 0,
            },
        )
        .expect("create record manager");
        RTree::new(records, RTreeOptions::default()).expect("create tree")
    }

    fn unit_rect(x: f64, y: f64) -> Rect {
        Rect::new([x, y], [x + 1.0, y + 1.0])
    }

    #[test]
    fn insert_and_query_round_trip() {
        let mut tree = tree();
        for i in 0..50u64 {
            let x = (i % 10) as f64 * 3.0;
            let y = (i / 10) as f64 * 3.0;
            tree.insert(SpatialEntry::new(unit_rect(x, y), i)).expect("insert");
        }
        assert_eq!(tree.len(), 50);
        tree.check_invariants().expect("invariants hold");

        let hits = tree
            .query(&Rect::new([0.0, 0.0], [4.0, 4.0]))
            .expect("query");
        let mut ids: Vec<u64> = hits.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 10, 11]);
    }

    #[test]
    fn delete_removes_and_tree_stays_consistent() {
        let mut tree = tree();
        let mut entries = Vec::new();
        for i in 0..30u64 {
            let e = SpatialEntry::new(unit_rect(i as f64, (i * 7 % 13) as f64), i);
            entries.push(e);
            tree.insert(e).expect("insert");
        }
        for e in entries.iter().take(15) {
            assert!(tree.delete(e).expect("delete"), "entry present");
        }
        assert_eq!(tree.len(), 15);
        tree.check_invariants().expect("invariants hold");

        let all = tree.iter_all().expect("iter");
        let mut ids: Vec<u64> = all.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (15..30).collect::<Vec<u64>>());

        assert!(!tree.delete(&entries[0]).expect("redelete"), "already gone");
    }

    #[test]
    fn randomized_workload_matches_reference() {
        let mut tree = tree();
        let mut reference: Vec<SpatialEntry> = Vec::new();
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        for i in 0..300u64 {
            if !reference.is_empty() && rng.gen_bool(0.3) {
                let victim = reference.swap_remove(rng.gen_range(0..reference.len()));
                assert!(tree.delete(&victim).expect("delete"));
            } else {
                let x = rng.gen_range(-100.0..100.0);
                let y = rng.gen_range(-100.0..100.0);
                let e = SpatialEntry::new(unit_rect(x, y), i);
                reference.push(e);
                tree.insert(e).expect("insert");
            }
        }
        tree.check_invariants().expect("invariants hold");
        assert_eq!(tree.len(), reference.len());

        for _ in 0..20 {
            let cx = rng.gen_range(-100.0..100.0);
            let cy = rng.gen_range(-100.0..100.0);
            let region = Rect::new([cx, cy], [cx + 25.0, cy + 25.0]);
            let mut got: Vec<u64> = tree
                .query(&region)
                .expect("query")
                .iter()
                .map(|e| e.id)
                .collect();
            got.sort_unstable();
            let mut want: Vec<u64> = reference
                .iter()
                .filter(|e| e.mbr.intersects(&region))
                .map(|e| e.id)
                .collect();
            want.sort_unstable();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn visits_report_nodes_during_query() {
        let mut tree = tree();
        for i in 0..40u64 {
            tree.insert(SpatialEntry::new(unit_rect(i as f64, 0.0), i))
                .expect("insert");
        }
        let mut visited = 0;
        tree.query_with_visits(&Rect::new([0.0, 0.0], [10.0, 2.0]), |_visit| {
            visited += 1;
        })
        .expect("query");
        assert!(visited >= 2, "root and at least one child visited");
    }

    #[test]
    fn retighten_fixes_loose_ancestors_after_leaf_rewrites() {
        let mut tree = tree();
        for i in 0..60u64 {
            tree.insert(SpatialEntry::new(unit_rect(i as f64, i as f64), i))
                .expect("insert");
        }
        // Shrink some leaves behind the ancestors' backs. Dropping the
        // entry with the largest x always moves the leaf boundary.
        let everywhere = Rect::new([f64::MIN, f64::MIN], [f64::MAX, f64::MAX]);
        tree.traverse_leaves(&everywhere, |_visit, entries| {
            if entries.len() > 1 {
                entries.sort_by(|a, b| {
                    a.mbr.min[0]
                        .partial_cmp(&b.mbr.min[0])
                        .expect("finite coordinates")
                });
                entries.pop();
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .expect("traverse");
        tree.check_invariants().expect("containment still holds");

        let writes = tree.retighten(|_| {}).expect("retighten");
        assert!(writes > 0, "stale ancestors were rewritten");
        tree.check_invariants().expect("invariants after retighten");

        let again = tree.retighten(|_| {}).expect("second retighten");
        assert_eq!(again, 0, "second pass finds nothing to fix");
    }
}
