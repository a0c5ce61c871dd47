use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Result, SelvaError};
use crate::pager::PageId;
use crate::record::info::{PageInfo, PageTable};

const STRATEGY_STATE_VERSION: u8 = 1;

/// Incremental change reported to strategies after a record mutation.
///
/// Values are deltas, never absolutes, so strategies can maintain
/// aggregates without rescanning the page table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordDelta {
    /// Live records added (negative on removal).
    pub records_added: i32,
    /// Bytes consumed on the page (negative when space was released).
    pub bytes_added: i64,
    /// Link fragments added (negative on removal).
    pub link_records_added: i32,
}

/// Policy deciding which page receives a new record of a given size.
///
/// Strategies are composed, not subclassed: [`Hybrid`] holds two inner
/// strategies and fans calls out to both.
pub trait PlacementStrategy: Send {
    /// Prepares the strategy against the current page table.
    ///
    /// May be called more than once; later calls reset internal state.
    fn initialize(&mut self, pages: &PageTable, page_size: usize, max_object_size: usize);

    /// Picks a page with room for `bytes_required`, or `None` when no
    /// candidate qualifies. `None` means "needs new page", never an error.
    fn select_page(&mut self, pages: &PageTable, bytes_required: usize) -> Option<PageId>;

    /// Reports a page newly registered with the record manager.
    fn on_page_inserted(&mut self, page_id: PageId, info: &PageInfo);

    /// Reports a page evicted from the record manager.
    fn on_page_removed(&mut self, page_id: PageId, info: &PageInfo);

    /// Reports a record mutation on `page_id`; `info` is the post-mutation state.
    fn on_record_updated(&mut self, page_id: PageId, info: &PageInfo, delta: RecordDelta);

    /// Releases resources. State must still be serializable afterwards.
    fn close(&mut self) {}

    /// Appends the strategy's resumable state to `out`.
    ///
    /// Byte order and field order are fixed so decisions resume
    /// identically after [`PlacementStrategy::deserialize_state`].
    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Restores state previously produced by `serialize_state`.
    ///
    /// A format or version mismatch is fatal and must surface before any
    /// record operation is permitted.
    fn deserialize_state(&mut self, input: &mut &[u8]) -> Result<()>;
}

fn read_u8(input: &mut &[u8]) -> Result<u8> {
    let (&byte, rest) = input
        .split_first()
        .ok_or_else(|| SelvaError::Serialization("strategy state truncated".into()))?;
    *input = rest;
    Ok(byte)
}

fn read_u32(input: &mut &[u8]) -> Result<u32> {
    if input.len() < 4 {
        return Err(SelvaError::Serialization("strategy state truncated".into()));
    }
    let (bytes, rest) = input.split_at(4);
    *input = rest;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
}

fn read_u64(input: &mut &[u8]) -> Result<u64> {
    if input.len() < 8 {
        return Err(SelvaError::Serialization("strategy state truncated".into()));
    }
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
}

fn check_version(input: &mut &[u8]) -> Result<()> {
    let version = read_u8(input)?;
    if version != STRATEGY_STATE_VERSION {
        return Err(SelvaError::Corruption(format!(
            "strategy state version mismatch: found {version}, expected {STRATEGY_STATE_VERSION}"
        )));
    }
    Ok(())
}

/// Scans the page table in map order and takes the first page that fits.
///
/// Complete: finds a fit whenever any page has room. `O(pages)` per call.
#[derive(Debug, Default)]
pub struct FirstFit;

impl FirstFit {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }
}

impl PlacementStrategy for FirstFit {
    fn initialize(&mut self, _pages: &PageTable, _page_size: usize, _max_object_size: usize) {}

    fn select_page(&mut self, pages: &PageTable, bytes_required: usize) -> Option<PageId> {
        pages
            .iter()
            .find(|(_, info)| info.bytes_free_after_reservation(bytes_required) >= 0)
            .map(|(&id, _)| id)
    }

    fn on_page_inserted(&mut self, _page_id: PageId, _info: &PageInfo) {}
    fn on_page_removed(&mut self, _page_id: PageId, _info: &PageInfo) {}
    fn on_record_updated(&mut self, _page_id: PageId, _info: &PageInfo, _delta: RecordDelta) {}

    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(STRATEGY_STATE_VERSION);
        Ok(())
    }

    fn deserialize_state(&mut self, input: &mut &[u8]) -> Result<()> {
        check_version(input)
    }
}

/// Best fit over the `n` pages currently holding the most free space.
///
/// The tracked set is maintained incrementally from lifecycle callbacks.
/// Selection picks the tracked page with the smallest sufficient free
/// space; ties go to the lowest page id. `None` when no tracked page
/// fits, at which point the caller allocates a fresh page.
#[derive(Debug)]
pub struct BestFitEmptiest {
    n: usize,
    // Ascending (bytes_free, page_id); the tail holds the emptiest pages.
    tracked: BTreeSet<(usize, PageId)>,
    free_by_page: FxHashMap<PageId, usize>,
}

impl BestFitEmptiest {
    /// Creates a strategy tracking the `n` emptiest pages.
    pub fn new(n: usize) -> Self {
        Self {
            n: n.max(1),
            tracked: BTreeSet::new(),
            free_by_page: FxHashMap::default(),
        }
    }

    fn untrack(&mut self, page_id: PageId) {
        if let Some(free) = self.free_by_page.remove(&page_id) {
            self.tracked.remove(&(free, page_id));
        }
    }

    fn track(&mut self, page_id: PageId, bytes_free: usize) {
        self.untrack(page_id);
        self.tracked.insert((bytes_free, page_id));
        self.free_by_page.insert(page_id, bytes_free);
        while self.tracked.len() > self.n {
            let smallest = *self.tracked.iter().next().expect("set is non-empty");
            self.tracked.remove(&smallest);
            self.free_by_page.remove(&smallest.1);
        }
    }
}

impl PlacementStrategy for BestFitEmptiest {
    fn initialize(&mut self, pages: &PageTable, _page_size: usize, _max_object_size: usize) {
        self.tracked.clear();
        self.free_by_page.clear();
        for (&id, info) in pages {
            self.track(id, info.bytes_free);
        }
    }

    fn select_page(&mut self, _pages: &PageTable, bytes_required: usize) -> Option<PageId> {
        // First entry at or above the requirement is the tightest fit;
        // within equal free space the lowest page id sorts first.
        let candidate = self
            .tracked
            .range((bytes_required, PageId::MIN)..)
            .next()
            .map(|&(_, id)| id);
        if candidate.is_none() {
            trace!(bytes_required, tracked = self.tracked.len(), "best-fit miss");
        }
        candidate
    }

    fn on_page_inserted(&mut self, page_id: PageId, info: &PageInfo) {
        self.track(page_id, info.bytes_free);
    }

    fn on_page_removed(&mut self, page_id: PageId, _info: &PageInfo) {
        self.untrack(page_id);
    }

    fn on_record_updated(&mut self, page_id: PageId, info: &PageInfo, _delta: RecordDelta) {
        self.track(page_id, info.bytes_free);
    }

    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(STRATEGY_STATE_VERSION);
        out.extend_from_slice(&(self.n as u32).to_le_bytes());
        out.extend_from_slice(&(self.tracked.len() as u32).to_le_bytes());
        for &(bytes_free, page_id) in &self.tracked {
            out.extend_from_slice(&page_id.to_le_bytes());
            out.extend_from_slice(&(bytes_free as u64).to_le_bytes());
        }
        Ok(())
    }

    fn deserialize_state(&mut self, input: &mut &[u8]) -> Result<()> {
        check_version(input)?;
        let n = read_u32(input)? as usize;
        if n == 0 {
            return Err(SelvaError::Corruption(
                "strategy state declares zero tracked pages".into(),
            ));
        }
        let count = read_u32(input)? as usize;
        if count > n {
            return Err(SelvaError::Corruption(
                "strategy state tracks more pages than its bound".into(),
            ));
        }
        self.n = n;
        self.tracked.clear();
        self.free_by_page.clear();
        for _ in 0..count {
            let page_id = read_u32(input)?;
            let bytes_free = read_u64(input)? as usize;
            self.tracked.insert((bytes_free, page_id));
            self.free_by_page.insert(page_id, bytes_free);
        }
        Ok(())
    }
}

/// Tries a primary strategy and falls back to a secondary on a miss.
///
/// Lifecycle callbacks fan out to both inner strategies, primary first,
/// keeping them synchronized.
pub struct Hybrid {
    primary: Box<dyn PlacementStrategy>,
    secondary: Box<dyn PlacementStrategy>,
}

impl Hybrid {
    /// Composes `primary` over `secondary`.
    pub fn new(primary: Box<dyn PlacementStrategy>, secondary: Box<dyn PlacementStrategy>) -> Self {
        Self { primary, secondary }
    }

    /// The conventional pairing: best-fit over `n` emptiest, first-fit fallback.
    pub fn best_fit_then_first_fit(n: usize) -> Self {
        Self::new(Box::new(BestFitEmptiest::new(n)), Box::new(FirstFit::new()))
    }
}

impl PlacementStrategy for Hybrid {
    fn initialize(&mut self, pages: &PageTable, page_size: usize, max_object_size: usize) {
        self.primary.initialize(pages, page_size, max_object_size);
        self.secondary.initialize(pages, page_size, max_object_size);
    }

    fn select_page(&mut self, pages: &PageTable, bytes_required: usize) -> Option<PageId> {
        self.primary
            .select_page(pages, bytes_required)
            .or_else(|| self.secondary.select_page(pages, bytes_required))
    }

    fn on_page_inserted(&mut self, page_id: PageId, info: &PageInfo) {
        self.primary.on_page_inserted(page_id, info);
        self.secondary.on_page_inserted(page_id, info);
    }

    fn on_page_removed(&mut self, page_id: PageId, info: &PageInfo) {
        self.primary.on_page_removed(page_id, info);
        self.secondary.on_page_removed(page_id, info);
    }

    fn on_record_updated(&mut self, page_id: PageId, info: &PageInfo, delta: RecordDelta) {
        self.primary.on_record_updated(page_id, info, delta);
        self.secondary.on_record_updated(page_id, info, delta);
    }

    fn close(&mut self) {
        self.primary.close();
        self.secondary.close();
    }

    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(STRATEGY_STATE_VERSION);
        let mut primary_state = Vec::new();
        self.primary.serialize_state(&mut primary_state)?;
        out.extend_from_slice(&(primary_state.len() as u32).to_le_bytes());
        out.extend_from_slice(&primary_state);
        let mut secondary_state = Vec::new();
        self.secondary.serialize_state(&mut secondary_state)?;
        out.extend_from_slice(&(secondary_state.len() as u32).to_le_bytes());
        out.extend_from_slice(&secondary_state);
        Ok(())
    }

    fn deserialize_state(&mut self, input: &mut &[u8]) -> Result<()> {
        check_version(input)?;
        for inner in [&mut self.primary, &mut self.secondary] {
            let len = read_u32(input)? as usize;
            if input.len() < len {
                return Err(SelvaError::Serialization("strategy state truncated".into()));
            }
            let (mut state, rest) = input.split_at(len);
            inner.deserialize_state(&mut state)?;
            if !state.is_empty() {
                return Err(SelvaError::Corruption(
                    "trailing bytes in inner strategy state".into(),
                ));
            }
            *input = rest;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(frees: &[(PageId, usize)]) -> PageTable {
        frees
            .iter()
            .map(|&(id, free)| (id, PageInfo::new(free)))
            .collect()
    }

    #[test]
    fn first_fit_picks_first_sufficient_in_map_order() {
        let pages = table(&[(1, 0), (2, 5), (3, 0), (4, 10)]);
        let mut strategy = FirstFit::new();
        strategy.initialize(&pages, 128, 64);
        assert_eq!(strategy.select_page(&pages, 5), Some(2));
        assert_eq!(strategy.select_page(&pages, 6), Some(4));
        assert_eq!(strategy.select_page(&pages, 11), None);
    }

    #[test]
    fn best_fit_selects_tightest_among_tracked() {
        // A:20 B:5 C:15 D:2 with n=2 tracks {A, C}; a 10-byte request
        // lands on C, the tightest tracked fit, not on A.
        let pages = table(&[(1, 20), (2, 5), (3, 15), (4, 2)]);
        let mut strategy = BestFitEmptiest::new(2);
        strategy.initialize(&pages, 128, 64);
        assert_eq!(strategy.select_page(&pages, 10), Some(3));
        assert_eq!(strategy.select_page(&pages, 16), Some(1));
        assert_eq!(strategy.select_page(&pages, 21), None);
        // B and D fell outside the tracked set.
        assert_eq!(strategy.select_page(&pages, 2), Some(3));
    }

    #[test]
    fn best_fit_tie_breaks_by_lowest_page_id() {
        let pages = table(&[(7, 12), (3, 12), (9, 1)]);
        let mut strategy = BestFitEmptiest::new(2);
        strategy.initialize(&pages, 128, 64);
        assert_eq!(strategy.select_page(&pages, 8), Some(3));
    }

    #[test]
    fn best_fit_tracks_mutations_incrementally() {
        let pages = table(&[(1, 30), (2, 20)]);
        let mut strategy = BestFitEmptiest::new(2);
        strategy.initialize(&pages, 128, 64);

        // Page 2 fills up; its tracked free space shrinks accordingly.
        let updated = PageInfo {
            bytes_free: 4,
            record_count: 3,
            link_record_count: 0,
        };
        strategy.on_record_updated(
            2,
            &updated,
            RecordDelta {
                records_added: 1,
                bytes_added: 16,
                link_records_added: 0,
            },
        );
        assert_eq!(strategy.select_page(&pages, 10), Some(1));

        strategy.on_page_removed(1, &PageInfo::new(30));
        assert_eq!(strategy.select_page(&pages, 10), None);
    }

    #[test]
    fn hybrid_falls_back_to_secondary() {
        // Only page 2 (untracked by best-fit with n=1) can take the record.
        let mut pages = table(&[(1, 50), (2, 10)]);
        let mut strategy = Hybrid::best_fit_then_first_fit(1);
        strategy.initialize(&pages, 128, 64);

        // Fill page 1 so the tracked set no longer fits the request.
        let full = PageInfo {
            bytes_free: 0,
            record_count: 4,
            link_record_count: 0,
        };
        pages.insert(1, full);
        strategy.on_record_updated(
            1,
            &full,
            RecordDelta {
                records_added: 1,
                bytes_added: 50,
                link_records_added: 0,
            },
        );
        assert_eq!(strategy.select_page(&pages, 10), Some(2));
    }

    #[test]
    fn best_fit_state_round_trips() {
        let pages = table(&[(1, 20), (2, 5), (3, 15)]);
        let mut strategy = BestFitEmptiest::new(2);
        strategy.initialize(&pages, 128, 64);

        let mut state = Vec::new();
        strategy.serialize_state(&mut state).expect("serialize");

        let mut restored = BestFitEmptiest::new(99);
        let mut input = state.as_slice();
        restored.deserialize_state(&mut input).expect("deserialize");
        assert!(input.is_empty());
        assert_eq!(restored.select_page(&pages, 10), Some(3));
        assert_eq!(restored.select_page(&pages, 16), Some(1));
    }

    #[test]
    fn hybrid_state_round_trips() {
        let pages = table(&[(1, 20), (2, 5)]);
        let mut strategy = Hybrid::best_fit_then_first_fit(2);
        strategy.initialize(&pages, 128, 64);

        let mut state = Vec::new();
        strategy.serialize_state(&mut state).expect("serialize");

        let mut restored = Hybrid::best_fit_then_first_fit(2);
        let mut input = state.as_slice();
        restored.deserialize_state(&mut input).expect("deserialize");
        assert!(input.is_empty());
        assert_eq!(restored.select_page(&pages, 18), Some(1));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut strategy = BestFitEmptiest::new(2);
        let state = vec![0xFFu8, 0, 0, 0, 0];
        let mut input = state.as_slice();
        let err = strategy.deserialize_state(&mut input).unwrap_err();
        assert!(matches!(err, SelvaError::Corruption(_)));
    }
}
