use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::error::{Result, SelvaError};
use crate::pager::{PageId, PageStore, PAGE_CHECKSUM_SIZE};
use crate::record::info::{PageInfo, PageTable};
use crate::record::page::{align_to_eight, required_space, RecordPage, PAGE_HEADER_SIZE, SLOT_ENTRY_SIZE};
use crate::record::slot::{
    encode_record, RecordKind, LINK_POINTER_SIZE, RECORD_HEADER_SIZE,
};
use crate::record::strategy::{PlacementStrategy, RecordDelta};

/// Opaque logical identifier of a stored record.
pub type RecordId = u64;

const MAX_CHAIN_HOPS: usize = 1 << 20;
const MANAGER_STATE_VERSION: u8 = 1;

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    let (&byte, rest) = input
        .split_first()
        .ok_or_else(|| SelvaError::Serialization("record manager state truncated".into()))?;
    *input = rest;
    Ok(byte)
}

fn take_u16(input: &mut &[u8]) -> Result<u16> {
    if input.len() < 2 {
        return Err(SelvaError::Serialization(
            "record manager state truncated".into(),
        ));
    }
    let (bytes, rest) = input.split_at(2);
    *input = rest;
    Ok(u16::from_le_bytes(bytes.try_into().expect("2 bytes")))
}

fn take_u32(input: &mut &[u8]) -> Result<u32> {
    if input.len() < 4 {
        return Err(SelvaError::Serialization(
            "record manager state truncated".into(),
        ));
    }
    let (bytes, rest) = input.split_at(4);
    *input = rest;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
}

fn take_u64(input: &mut &[u8]) -> Result<u64> {
    if input.len() < 8 {
        return Err(SelvaError::Serialization(
            "record manager state truncated".into(),
        ));
    }
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
}

/// Physical location of a record fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordPointer {
    /// Page hosting the fragment.
    pub page_id: PageId,
    /// Slot index within the page.
    pub slot: u16,
}

impl RecordPointer {
    fn encode(self) -> [u8; LINK_POINTER_SIZE] {
        let mut out = [0u8; LINK_POINTER_SIZE];
        out[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.slot.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LINK_POINTER_SIZE {
            return Err(SelvaError::Corruption(
                "link record continuation pointer truncated".into(),
            ));
        }
        Ok(Self {
            page_id: u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
            slot: u16::from_le_bytes(bytes[4..6].try_into().expect("2 bytes")),
        })
    }

    fn to_id(self) -> RecordId {
        (u64::from(self.page_id) << 16) | u64::from(self.slot)
    }

    fn from_id(id: RecordId) -> Self {
        Self {
            page_id: (id >> 16) as PageId,
            slot: (id & 0xFFFF) as u16,
        }
    }
}

/// Variant of logical-id management used by a [`RecordManager`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdStrategyKind {
    /// Ids encode the head fragment location; relocation changes the id.
    Identity,
    /// Ids are stable handles mapped to locations; relocation keeps the id.
    Mapped,
}

enum IdTable {
    Identity { live: FxHashSet<RecordId> },
    Mapped {
        next: RecordId,
        map: FxHashMap<RecordId, RecordPointer>,
    },
}

impl IdTable {
    fn new(kind: IdStrategyKind) -> Self {
        match kind {
            IdStrategyKind::Identity => Self::Identity {
                live: FxHashSet::default(),
            },
            IdStrategyKind::Mapped => Self::Mapped {
                next: 1,
                map: FxHashMap::default(),
            },
        }
    }

    fn register(&mut self, head: RecordPointer) -> RecordId {
        match self {
            Self::Identity { live } => {
                let id = head.to_id();
                live.insert(id);
                id
            }
            Self::Mapped { next, map } => {
                let id = *next;
                *next += 1;
                map.insert(id, head);
                id
            }
        }
    }

    fn resolve(&self, id: RecordId) -> Result<RecordPointer> {
        match self {
            Self::Identity { live } => live
                .contains(&id)
                .then(|| RecordPointer::from_id(id))
                .ok_or(SelvaError::NotFound("record")),
            Self::Mapped { map, .. } => {
                map.get(&id).copied().ok_or(SelvaError::NotFound("record"))
            }
        }
    }

    fn forget(&mut self, id: RecordId) {
        match self {
            Self::Identity { live } => {
                live.remove(&id);
            }
            Self::Mapped { map, .. } => {
                map.remove(&id);
            }
        }
    }

    /// Re-points an id at a relocated head, returning the id callers should
    /// use from now on.
    fn repoint(&mut self, id: RecordId, new_head: RecordPointer) -> RecordId {
        match self {
            Self::Identity { live } => {
                live.remove(&id);
                let new_id = new_head.to_id();
                live.insert(new_id);
                new_id
            }
            Self::Mapped { map, .. } => {
                map.insert(id, new_head);
                id
            }
        }
    }

    fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = match self {
            Self::Identity { live } => live.iter().copied().collect(),
            Self::Mapped { map, .. } => map.keys().copied().collect(),
        };
        ids.sort_unstable();
        ids
    }

    fn len(&self) -> usize {
        match self {
            Self::Identity { live } => live.len(),
            Self::Mapped { map, .. } => map.len(),
        }
    }
}

/// Construction parameters for a [`RecordManager`].
#[derive(Clone, Copy, Debug)]
pub struct RecordManagerOptions {
    /// Id-management variant.
    pub id_strategy: IdStrategyKind,
    /// Bytes per page withheld from placement, e.g. for embedder headers.
    pub reserved_bytes: usize,
}

impl Default for RecordManagerOptions {
    fn default() -> Self {
        Self {
            id_strategy: IdStrategyKind::Mapped,
            reserved_bytes: 0,
        }
    }
}

/// Translates logical record ids to page slots, splitting oversize records
/// into link-record chains and delegating page choice to a
/// [`PlacementStrategy`].
///
/// The manager owns the page-information table and updates it with deltas
/// on every mutation, so strategies can maintain incremental aggregates.
pub struct RecordManager<S: PageStore> {
    store: S,
    strategy: Box<dyn PlacementStrategy>,
    pages: PageTable,
    ids: IdTable,
    page_capacity: usize,
    max_fragment: usize,
}

impl<S: PageStore> RecordManager<S> {
    /// Creates a manager over `store` using `strategy` for placement.
    pub fn new(
        store: S,
        mut strategy: Box<dyn PlacementStrategy>,
        options: RecordManagerOptions,
    ) -> Result<Self> {
        let page_size = store.page_size();
        let usable = page_size
            .checked_sub(PAGE_CHECKSUM_SIZE + PAGE_HEADER_SIZE)
            .ok_or_else(|| SelvaError::InvalidArgument("page size too small".into()))?;
        let page_capacity = usable
            .checked_sub(options.reserved_bytes)
            .ok_or_else(|| SelvaError::InvalidArgument("reserved bytes exceed page".into()))?;
        let mut max_fragment = page_capacity.saturating_sub(SLOT_ENTRY_SIZE);
        max_fragment -= max_fragment % 8;
        if max_fragment <= RECORD_HEADER_SIZE + LINK_POINTER_SIZE {
            return Err(SelvaError::InvalidArgument(
                "page too small to host record fragments".into(),
            ));
        }

        let pages = PageTable::new();
        strategy.initialize(&pages, page_size, max_fragment);
        Ok(Self {
            store,
            strategy,
            pages,
            ids: IdTable::new(options.id_strategy),
            page_capacity,
            max_fragment,
        })
    }

    /// Stores `payload`, returning its logical id.
    pub fn insert(&mut self, payload: &[u8]) -> Result<RecordId> {
        if payload.is_empty() {
            return Err(SelvaError::InvalidArgument(
                "record payload cannot be empty".into(),
            ));
        }
        let head = self.write_chain(payload)?;
        let id = self.ids.register(head);
        trace!(id, bytes = payload.len(), "record inserted");
        Ok(id)
    }

    /// Reads back the payload of `id`.
    pub fn get(&mut self, id: RecordId) -> Result<Vec<u8>> {
        let head = self.ids.resolve(id)?;
        self.read_chain(head)
    }

    /// Replaces the payload of `id`.
    ///
    /// Returns the id to use afterwards: unchanged under the mapped id
    /// manager, possibly new under identity when the record relocates.
    pub fn update(&mut self, id: RecordId, payload: &[u8]) -> Result<RecordId> {
        if payload.is_empty() {
            return Err(SelvaError::InvalidArgument(
                "record payload cannot be empty".into(),
            ));
        }
        let head = self.ids.resolve(id)?;
        let (kind, old_payload) = self.fragment_at(head, true)?;

        if kind == RecordKind::Data {
            let new_encoded = encode_record(RecordKind::Data, payload);
            let old_encoded_len = RECORD_HEADER_SIZE + old_payload.len();
            if align_to_eight(new_encoded.len()) == align_to_eight(old_encoded_len) {
                let mut data = self.store.read_page(head.page_id)?;
                {
                    let mut page = RecordPage::from_bytes(&mut data)?;
                    if !page.try_update_slot(head.slot as usize, &new_encoded)? {
                        return Err(SelvaError::Corruption(
                            "in-place update rejected by matching footprint".into(),
                        ));
                    }
                }
                self.store.write_page(head.page_id, &data)?;
                let info = *self
                    .pages
                    .get(&head.page_id)
                    .ok_or_else(|| SelvaError::Corruption("page missing from table".into()))?;
                self.strategy
                    .on_record_updated(head.page_id, &info, RecordDelta::default());
                return Ok(id);
            }
        }

        self.free_chain(head)?;
        let new_head = self.write_chain(payload)?;
        Ok(self.ids.repoint(id, new_head))
    }

    /// Removes `id` and releases the space its fragments held.
    pub fn remove(&mut self, id: RecordId) -> Result<()> {
        let head = self.ids.resolve(id)?;
        self.free_chain(head)?;
        self.ids.forget(id);
        trace!(id, "record removed");
        Ok(())
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.ids.len() == 0
    }

    /// Snapshot of all live record ids in ascending order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.ids.ids()
    }

    /// Iterates `(id, payload)` pairs over a snapshot of the current ids.
    pub fn entries(&mut self) -> Entries<'_, S> {
        let snapshot = self.ids.ids();
        Entries {
            manager: self,
            snapshot,
            pos: 0,
        }
    }

    /// Iterates payloads over a snapshot of the current ids.
    pub fn objects(&mut self) -> Objects<'_, S> {
        Objects {
            inner: self.entries(),
        }
    }

    /// Opens an iteration session that allows in-place `remove` and `update`.
    pub fn cursor(&mut self) -> RecordCursor<'_, S> {
        let snapshot = self.ids.ids();
        RecordCursor {
            manager: self,
            snapshot,
            pos: 0,
            current: None,
        }
    }

    /// Read-only view of the page-information table.
    pub fn page_table(&self) -> &PageTable {
        &self.pages
    }

    /// Bytes the table accounts as consumed across all pages.
    pub fn accounted_used_bytes(&self) -> usize {
        self.pages
            .values()
            .map(|info| self.page_capacity - info.bytes_free)
            .sum()
    }

    /// Page bytes a record of `payload_len` occupies, fragment overhead included.
    pub fn footprint(&self, payload_len: usize) -> usize {
        let data_cap = self.max_fragment - RECORD_HEADER_SIZE;
        if payload_len <= data_cap {
            return required_space(RECORD_HEADER_SIZE + payload_len);
        }
        let link_cap = data_cap - LINK_POINTER_SIZE;
        let mut total = 0;
        let mut remaining = payload_len;
        while remaining > data_cap {
            total += required_space(RECORD_HEADER_SIZE + LINK_POINTER_SIZE + link_cap);
            remaining -= link_cap;
        }
        total + required_space(RECORD_HEADER_SIZE + remaining)
    }

    /// Serializes the manager's resumable state: the page-information
    /// table, the id table and the placement strategy's state, in fixed
    /// field order with little-endian byte order.
    pub fn serialize_state(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.push(MANAGER_STATE_VERSION);

        out.extend_from_slice(&(self.pages.len() as u32).to_le_bytes());
        for (&page_id, info) in &self.pages {
            out.extend_from_slice(&page_id.to_le_bytes());
            out.extend_from_slice(&(info.bytes_free as u64).to_le_bytes());
            out.extend_from_slice(&(info.record_count as u32).to_le_bytes());
            out.extend_from_slice(&(info.link_record_count as u32).to_le_bytes());
        }

        match &self.ids {
            IdTable::Identity { live } => {
                out.push(0);
                out.extend_from_slice(&(live.len() as u32).to_le_bytes());
                let mut ids: Vec<RecordId> = live.iter().copied().collect();
                ids.sort_unstable();
                for id in ids {
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            IdTable::Mapped { next, map } => {
                out.push(1);
                out.extend_from_slice(&next.to_le_bytes());
                out.extend_from_slice(&(map.len() as u32).to_le_bytes());
                let mut entries: Vec<(RecordId, RecordPointer)> =
                    map.iter().map(|(&id, &ptr)| (id, ptr)).collect();
                entries.sort_unstable_by_key(|&(id, _)| id);
                for (id, pointer) in entries {
                    out.extend_from_slice(&id.to_le_bytes());
                    out.extend_from_slice(&pointer.page_id.to_le_bytes());
                    out.extend_from_slice(&pointer.slot.to_le_bytes());
                }
            }
        }

        let mut strategy_state = Vec::new();
        self.strategy.serialize_state(&mut strategy_state)?;
        out.extend_from_slice(&(strategy_state.len() as u32).to_le_bytes());
        out.extend_from_slice(&strategy_state);
        Ok(out)
    }

    /// Restores state saved by [`Self::serialize_state`].
    ///
    /// Must run before any record operation; any format, version or
    /// id-strategy mismatch is fatal.
    pub fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        let mut input = state;
        let version = take_u8(&mut input)?;
        if version != MANAGER_STATE_VERSION {
            return Err(SelvaError::Corruption(format!(
                "record manager state version mismatch: found {version}"
            )));
        }

        let page_count = take_u32(&mut input)? as usize;
        let mut pages = PageTable::new();
        for _ in 0..page_count {
            let page_id = take_u32(&mut input)?;
            let bytes_free = take_u64(&mut input)? as usize;
            if bytes_free > self.page_capacity {
                return Err(SelvaError::Corruption(
                    "restored page claims more free space than capacity".into(),
                ));
            }
            let record_count = take_u32(&mut input)? as usize;
            let link_record_count = take_u32(&mut input)? as usize;
            pages.insert(
                page_id,
                PageInfo {
                    bytes_free,
                    record_count,
                    link_record_count,
                },
            );
        }

        let tag = take_u8(&mut input)?;
        let ids = match (tag, &self.ids) {
            (0, IdTable::Identity { .. }) => {
                let count = take_u32(&mut input)? as usize;
                let mut live = FxHashSet::default();
                for _ in 0..count {
                    live.insert(take_u64(&mut input)?);
                }
                IdTable::Identity { live }
            }
            (1, IdTable::Mapped { .. }) => {
                let next = take_u64(&mut input)?;
                let count = take_u32(&mut input)? as usize;
                let mut map = FxHashMap::default();
                for _ in 0..count {
                    let id = take_u64(&mut input)?;
                    let page_id = take_u32(&mut input)?;
                    let slot = take_u16(&mut input)?;
                    map.insert(id, RecordPointer { page_id, slot });
                }
                IdTable::Mapped { next, map }
            }
            _ => {
                return Err(SelvaError::Corruption(
                    "record manager state id-strategy mismatch".into(),
                ))
            }
        };

        let strategy_len = take_u32(&mut input)? as usize;
        if input.len() != strategy_len {
            return Err(SelvaError::Corruption(
                "record manager state length mismatch".into(),
            ));
        }
        self.strategy.deserialize_state(&mut input)?;
        if !input.is_empty() {
            return Err(SelvaError::Corruption(
                "trailing bytes in record manager state".into(),
            ));
        }

        self.pages = pages;
        self.ids = ids;
        Ok(())
    }

    /// Serializes the placement strategy's resumable state.
    pub fn strategy_state(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.strategy.serialize_state(&mut out)?;
        Ok(out)
    }

    /// Restores placement-strategy state saved by [`Self::strategy_state`].
    ///
    /// Must be called before any record operation; a format or version
    /// mismatch is fatal.
    pub fn restore_strategy_state(&mut self, state: &[u8]) -> Result<()> {
        let mut input = state;
        self.strategy.deserialize_state(&mut input)?;
        if !input.is_empty() {
            return Err(SelvaError::Corruption(
                "trailing bytes in strategy state".into(),
            ));
        }
        Ok(())
    }

    /// Flushes the underlying store and closes the strategy.
    pub fn close(&mut self) -> Result<()> {
        self.strategy.close();
        self.store.flush()
    }

    /// Flushes buffered pages to the underlying store.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Mutable access to the underlying store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consumes the manager, returning the underlying store.
    ///
    /// Callers wanting durability should [`Self::flush`] first.
    pub fn into_store(self) -> S {
        self.store
    }

    fn write_chain(&mut self, payload: &[u8]) -> Result<RecordPointer> {
        let data_cap = self.max_fragment - RECORD_HEADER_SIZE;
        if payload.len() <= data_cap {
            return self.place_fragment(&encode_record(RecordKind::Data, payload));
        }

        let link_cap = data_cap - LINK_POINTER_SIZE;
        let mut chunks: Vec<&[u8]> = Vec::new();
        let mut rest = payload;
        while rest.len() > data_cap {
            let (chunk, remainder) = rest.split_at(link_cap);
            chunks.push(chunk);
            rest = remainder;
        }

        // The tail is written first so every link fragment can carry a
        // resolved continuation pointer.
        let mut next = self.place_fragment(&encode_record(RecordKind::Tail, rest))?;
        for (idx, chunk) in chunks.iter().enumerate().rev() {
            let kind = if idx == 0 {
                RecordKind::Link
            } else {
                RecordKind::Cont
            };
            let mut body = Vec::with_capacity(LINK_POINTER_SIZE + chunk.len());
            body.extend_from_slice(&next.encode());
            body.extend_from_slice(chunk);
            next = self.place_fragment(&encode_record(kind, &body))?;
        }
        Ok(next)
    }

    fn place_fragment(&mut self, encoded: &[u8]) -> Result<RecordPointer> {
        debug_assert!(encoded.len() <= self.max_fragment);
        let need = required_space(encoded.len());

        if let Some(page_id) = self.strategy.select_page(&self.pages, need) {
            if let Some(pointer) = self.try_place_on(page_id, encoded)? {
                self.commit_placement(pointer.page_id, encoded)?;
                return Ok(pointer);
            }
            // Logical free space can exceed what the page physically offers
            // once freed slots fragment it; fall through to a fresh page.
            debug!(page = page_id, "selected page could not host fragment");
        }

        let page_id = self.allocate_fresh_page()?;
        match self.try_place_on(page_id, encoded)? {
            Some(pointer) => {
                self.commit_placement(pointer.page_id, encoded)?;
                Ok(pointer)
            }
            None => Err(SelvaError::InvalidArgument(
                "newly allocated page cannot fit record".into(),
            )),
        }
    }

    fn allocate_fresh_page(&mut self) -> Result<PageId> {
        let page_id = self.store.allocate_page()?;
        let info = PageInfo::new(self.page_capacity);
        self.pages.insert(page_id, info);
        self.strategy.on_page_inserted(page_id, &info);
        debug!(page = page_id, "page registered with record manager");
        Ok(page_id)
    }

    fn try_place_on(&mut self, page_id: PageId, encoded: &[u8]) -> Result<Option<RecordPointer>> {
        let mut data = self.store.read_page(page_id)?;
        let slot;
        {
            let mut page = RecordPage::from_bytes(&mut data)?;
            page.initialize()?;

            // Exact-footprint reuse keeps the free-space accounting precise.
            let padded = align_to_eight(encoded.len());
            let count = page.record_count()? as usize;
            let mut reused = None;
            for idx in 0..count {
                let header = page.record_header_at(idx)?;
                if header.kind == RecordKind::Free
                    && RECORD_HEADER_SIZE + header.payload_length as usize == padded
                    && page.try_reuse_slot(idx, encoded)?
                {
                    reused = Some(idx as u16);
                    break;
                }
            }

            slot = match reused {
                Some(idx) => Some(idx),
                None => {
                    if page.can_fit(encoded.len())? {
                        Some(page.append_record(encoded)?)
                    } else {
                        None
                    }
                }
            };
        }
        match slot {
            Some(slot) => {
                self.store.write_page(page_id, &data)?;
                Ok(Some(RecordPointer { page_id, slot }))
            }
            None => Ok(None),
        }
    }

    fn commit_placement(&mut self, page_id: PageId, encoded: &[u8]) -> Result<()> {
        let need = required_space(encoded.len());
        let kind = RecordKind::from_byte(encoded[0])?;
        let info = self
            .pages
            .get_mut(&page_id)
            .ok_or_else(|| SelvaError::Corruption("page missing from table".into()))?;
        if info.bytes_free < need {
            return Err(SelvaError::Corruption(
                "page accounting underflow on placement".into(),
            ));
        }
        info.bytes_free -= need;
        info.record_count += 1;
        let link_added = i32::from(kind.has_continuation());
        info.link_record_count += kind.has_continuation() as usize;
        let snapshot = *info;
        self.strategy.on_record_updated(
            page_id,
            &snapshot,
            RecordDelta {
                records_added: 1,
                bytes_added: need as i64,
                link_records_added: link_added,
            },
        );
        Ok(())
    }

    /// Reads one fragment, returning its kind and payload.
    ///
    /// `head` toggles whether head or continuation kinds are expected.
    fn fragment_at(&mut self, pointer: RecordPointer, head: bool) -> Result<(RecordKind, Vec<u8>)> {
        let mut data = self.store.read_page(pointer.page_id).map_err(|e| {
            if head {
                e
            } else {
                SelvaError::Corruption(format!("link record chain broken: {e}"))
            }
        })?;
        let page = RecordPage::from_bytes(&mut data)?;
        let slice = page.record_slice(pointer.slot as usize).map_err(|e| {
            SelvaError::Corruption(format!("link record chain broken: {e}"))
        })?;
        let kind = RecordKind::from_byte(slice[0])?;
        let expected = if head {
            kind.is_head()
        } else {
            matches!(kind, RecordKind::Cont | RecordKind::Tail)
        };
        if !expected {
            return Err(SelvaError::Corruption(format!(
                "unexpected record kind {kind:?} in chain"
            )));
        }
        Ok((kind, slice[RECORD_HEADER_SIZE..].to_vec()))
    }

    fn read_chain(&mut self, head: RecordPointer) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut pointer = head;
        let mut at_head = true;
        let mut hops = 0usize;
        loop {
            let (kind, payload) = self.fragment_at(pointer, at_head)?;
            if kind.has_continuation() {
                let next = RecordPointer::decode(&payload)?;
                out.extend_from_slice(&payload[LINK_POINTER_SIZE..]);
                pointer = next;
            } else {
                out.extend_from_slice(&payload);
                return Ok(out);
            }
            at_head = false;
            hops += 1;
            if hops > MAX_CHAIN_HOPS {
                return Err(SelvaError::Corruption(
                    "link record chain does not terminate".into(),
                ));
            }
        }
    }

    fn free_chain(&mut self, head: RecordPointer) -> Result<()> {
        let mut pointer = head;
        let mut at_head = true;
        let mut hops = 0usize;
        loop {
            let (kind, payload) = self.fragment_at(pointer, at_head)?;
            let next = if kind.has_continuation() {
                Some(RecordPointer::decode(&payload)?)
            } else {
                None
            };

            let mut data = self.store.read_page(pointer.page_id)?;
            {
                let mut page = RecordPage::from_bytes(&mut data)?;
                page.mark_slot_free(pointer.slot as usize)?;
            }
            self.store.write_page(pointer.page_id, &data)?;

            let need = required_space(RECORD_HEADER_SIZE + payload.len());
            let page_id = pointer.page_id;
            let info = self
                .pages
                .get_mut(&page_id)
                .ok_or_else(|| SelvaError::Corruption("page missing from table".into()))?;
            if info.bytes_free + need > self.page_capacity || info.record_count == 0 {
                return Err(SelvaError::Corruption(
                    "page accounting overflow on removal".into(),
                ));
            }
            info.bytes_free += need;
            info.record_count -= 1;
            let link_removed = i32::from(kind.has_continuation());
            info.link_record_count -= kind.has_continuation() as usize;
            let snapshot = *info;
            self.strategy.on_record_updated(
                page_id,
                &snapshot,
                RecordDelta {
                    records_added: -1,
                    bytes_added: -(need as i64),
                    link_records_added: -link_removed,
                },
            );

            if snapshot.record_count == 0 {
                self.pages.remove(&page_id);
                self.strategy.on_page_removed(page_id, &snapshot);
                self.store.free_page(page_id)?;
                debug!(page = page_id, "empty page evicted");
            }

            match next {
                Some(next) => pointer = next,
                None => return Ok(()),
            }
            at_head = false;
            hops += 1;
            if hops > MAX_CHAIN_HOPS {
                return Err(SelvaError::Corruption(
                    "link record chain does not terminate".into(),
                ));
            }
        }
    }
}

/// Iterator over `(id, payload)` pairs from a snapshot of live ids.
pub struct Entries<'m, S: PageStore> {
    manager: &'m mut RecordManager<S>,
    snapshot: Vec<RecordId>,
    pos: usize,
}

impl<S: PageStore> Iterator for Entries<'_, S> {
    type Item = Result<(RecordId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.snapshot.len() {
            let id = self.snapshot[self.pos];
            self.pos += 1;
            match self.manager.get(id) {
                Ok(payload) => return Some(Ok((id, payload))),
                Err(SelvaError::NotFound(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Iterator over payloads from a snapshot of live ids.
pub struct Objects<'m, S: PageStore> {
    inner: Entries<'m, S>,
}

impl<S: PageStore> Iterator for Objects<'_, S> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| item.map(|(_, payload)| payload))
    }
}

/// Iteration session supporting `remove` and `update` of the current record.
///
/// The id list is snapshotted when the cursor opens; mutations made through
/// the cursor do not invalidate continued traversal. Mutations bypassing an
/// open cursor leave traversal results unspecified, but `close` stays safe.
pub struct RecordCursor<'m, S: PageStore> {
    manager: &'m mut RecordManager<S>,
    snapshot: Vec<RecordId>,
    pos: usize,
    current: Option<RecordId>,
}

impl<S: PageStore> RecordCursor<'_, S> {
    /// Advances to the next live record, returning its id.
    pub fn next(&mut self) -> Option<RecordId> {
        while self.pos < self.snapshot.len() {
            let id = self.snapshot[self.pos];
            self.pos += 1;
            if self.manager.ids.resolve(id).is_ok() {
                self.current = Some(id);
                return Some(id);
            }
        }
        self.current = None;
        None
    }

    /// Payload of the record the cursor is positioned on.
    pub fn get(&mut self) -> Result<Vec<u8>> {
        let id = self.current.ok_or(SelvaError::NotFound("cursor position"))?;
        self.manager.get(id)
    }

    /// Removes the current record; the cursor can keep advancing.
    pub fn remove(&mut self) -> Result<()> {
        let id = self.current.take().ok_or(SelvaError::NotFound("cursor position"))?;
        self.manager.remove(id)
    }

    /// Replaces the current record's payload, returning its (possibly new) id.
    pub fn update(&mut self, payload: &[u8]) -> Result<RecordId> {
        let id = self.current.ok_or(SelvaError::NotFound("cursor position"))?;
        let new_id = self.manager.update(id, payload)?;
        self.current = Some(new_id);
        Ok(new_id)
    }

    /// Ends the session. Always safe, whatever happened during iteration.
    pub fn close(self) {}
}
