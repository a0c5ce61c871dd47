use std::collections::BTreeMap;

use crate::pager::PageId;

/// Per-page bookkeeping the record manager maintains for placement decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageInfo {
    /// Bytes still available for new records, slot-directory overhead included.
    pub bytes_free: usize,
    /// Directory slots currently holding live data.
    pub record_count: usize,
    /// Live slots holding link fragments of chained records.
    pub link_record_count: usize,
}

impl PageInfo {
    /// Creates bookkeeping for a fresh page with `bytes_free` available.
    pub fn new(bytes_free: usize) -> Self {
        Self {
            bytes_free,
            record_count: 0,
            link_record_count: 0,
        }
    }

    /// Free bytes remaining if `bytes_required` were reserved on this page.
    ///
    /// Pure query: negative results mean the reservation does not fit.
    pub fn bytes_free_after_reservation(&self, bytes_required: usize) -> i64 {
        self.bytes_free as i64 - bytes_required as i64
    }
}

/// Ordered page-id to [`PageInfo`] mapping.
///
/// Map order is page-id order, the natural order placement strategies scan.
pub type PageTable = BTreeMap<PageId, PageInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_query_is_pure_and_signed() {
        let info = PageInfo::new(10);
        assert_eq!(info.bytes_free_after_reservation(4), 6);
        assert_eq!(info.bytes_free_after_reservation(10), 0);
        assert_eq!(info.bytes_free_after_reservation(11), -1);
        // The query never mutates.
        assert_eq!(info.bytes_free, 10);
    }
}
