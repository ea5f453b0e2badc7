//! Slotted heap page: a used-slot bitmap header followed by fixed-stride
//! tuple slots.
//!
//! The raw byte image is the source of truth; tuple access parses slots in
//! place. Reading a page and writing it back therefore reproduces the file
//! region byte for byte, padding bits and all.

use std::sync::Arc;

use crate::errors::{Result, StoreError};
use crate::tuple::{RecordId, Tuple, TupleDesc, SLOT_NONE};
use crate::{PageId, TransactionId};

/// Number of tuple slots on a page: each slot costs its tuple width in the
/// body plus one bit in the header bitmap.
pub fn slot_count(page_size: usize, tuple_size: usize) -> usize {
    (page_size * 8) / (tuple_size * 8 + 1)
}

/// Bytes of header bitmap needed for `slots` slots. Bits past the slot
/// count are padding and stay zero.
pub fn header_size(slots: usize) -> usize {
    slots.div_ceil(8)
}

impl std::fmt::Debug for HeapPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapPage").field("pid", &self.pid).finish_non_exhaustive()
    }
}

pub struct HeapPage {
    pid: PageId,
    desc: Arc<TupleDesc>,
    data: Vec<u8>,
    before_image: Vec<u8>,
    dirtier: Option<TransactionId>,
}

impl HeapPage {
    /// Wraps bytes read from disk. The before-image starts equal to the
    /// bytes as read.
    pub fn from_bytes(pid: PageId, desc: Arc<TupleDesc>, data: Vec<u8>) -> Self {
        let before_image = data.clone();
        Self {
            pid,
            desc,
            data,
            before_image,
            dirtier: None,
        }
    }

    /// A fresh all-zero page: empty bitmap, empty slots.
    pub fn empty(pid: PageId, desc: Arc<TupleDesc>, page_size: usize) -> Self {
        Self::from_bytes(pid, desc, vec![0; page_size])
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    /// The live byte image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bytes as last committed (or as last read from disk).
    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Rolls the committed snapshot forward to the live image; called by the
    /// buffer pool once the matching update record is on stable storage.
    pub fn set_before_image(&mut self) {
        self.before_image.copy_from_slice(&self.data);
    }

    /// Rolls the live image back to the committed snapshot (abort of a
    /// never-flushed page).
    pub fn restore_before_image(&mut self) {
        self.data.copy_from_slice(&self.before_image);
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirtier = Some(tid);
    }

    pub fn mark_clean(&mut self) {
        self.dirtier = None;
    }

    pub fn slot_count(&self) -> usize {
        slot_count(self.data.len(), self.desc.byte_size())
    }

    fn header_size(&self) -> usize {
        header_size(self.slot_count())
    }

    pub fn is_slot_used(&self, slot: usize) -> bool {
        slot < self.slot_count() && self.data[slot / 8] >> (slot % 8) & 1 == 1
    }

    fn set_slot(&mut self, slot: usize, used: bool) {
        if used {
            self.data[slot / 8] |= 1 << (slot % 8);
        } else {
            self.data[slot / 8] &= !(1 << (slot % 8));
        }
    }

    pub fn free_slot_count(&self) -> usize {
        (0..self.slot_count()).filter(|&s| !self.is_slot_used(s)).count()
    }

    /// Indices of occupied slots, in slot order.
    pub fn used_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slot_count()).filter(|&s| self.is_slot_used(s))
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let stride = self.desc.byte_size();
        let start = self.header_size() + slot * stride;
        start..start + stride
    }

    /// Writes the tuple into the first free slot and stamps its record id.
    pub fn insert_tuple(&mut self, t: &mut Tuple) -> Result<()> {
        if **t.desc() != *self.desc {
            return Err(StoreError::Schema(
                "tuple descriptor does not match page".to_string(),
            ));
        }
        let slot = (0..self.slot_count())
            .find(|&s| !self.is_slot_used(s))
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!("page {} has no free slots", self.pid))
            })?;

        let range = self.slot_range(slot);
        t.encode(&mut self.data[range]);
        self.set_slot(slot, true);
        t.set_record_id(Some(RecordId {
            page_id: self.pid,
            slot,
        }));
        Ok(())
    }

    /// Clears the tuple's slot bit. The slot bytes are left in place; the
    /// tuple's record id keeps the page and takes the deleted sentinel.
    pub fn delete_tuple(&mut self, t: &mut Tuple) -> Result<()> {
        let rid = t.record_id().ok_or_else(|| {
            StoreError::InvalidRequest("tuple has no record id".to_string())
        })?;
        if rid.page_id != self.pid {
            return Err(StoreError::InvalidRequest(format!(
                "tuple belongs to page {}, not {}",
                rid.page_id, self.pid
            )));
        }
        if !self.is_slot_used(rid.slot) {
            return Err(StoreError::InvalidRequest(format!(
                "slot {} of page {} is already empty",
                rid.slot, self.pid
            )));
        }
        self.set_slot(rid.slot, false);
        t.set_record_id(Some(RecordId {
            page_id: rid.page_id,
            slot: SLOT_NONE,
        }));
        Ok(())
    }

    /// Parses the tuple in the given slot.
    pub fn tuple_at(&self, slot: usize) -> Result<Tuple> {
        if !self.is_slot_used(slot) {
            return Err(StoreError::InvalidRequest(format!(
                "slot {} of page {} is empty",
                slot, self.pid
            )));
        }
        let range = self.slot_range(slot);
        let mut t = Tuple::decode(self.desc.clone(), &self.data[range])?;
        t.set_record_id(Some(RecordId {
            page_id: self.pid,
            slot,
        }));
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{Field, FieldType};

    fn int_desc(n: usize) -> Arc<TupleDesc> {
        Arc::new(TupleDesc::new(vec![FieldType::Int; n]))
    }

    fn int_tuple(desc: &Arc<TupleDesc>, v: i32) -> Tuple {
        let fields = (0..desc.num_fields()).map(|_| Field::Int(v)).collect();
        Tuple::new(desc.clone(), fields).unwrap()
    }

    #[test]
    fn slot_math_matches_the_layout_formula() {
        // 4096-byte page, 4-byte tuples: 32768 bits / 33 bits per slot.
        assert_eq!(slot_count(4096, 4), 992);
        assert_eq!(header_size(992), 124);
        // A tuple wider than the page yields zero slots.
        assert_eq!(slot_count(64, 100), 0);
        assert_eq!(header_size(0), 0);
    }

    #[test]
    fn insert_stamps_record_id_and_fills_slots_in_order() {
        let desc = int_desc(1);
        let pid = PageId::new(7, 0);
        let mut page = HeapPage::empty(pid, desc.clone(), 128);
        let total = page.slot_count();
        assert!(total > 2);

        let mut t0 = int_tuple(&desc, 10);
        let mut t1 = int_tuple(&desc, 11);
        page.insert_tuple(&mut t0).unwrap();
        page.insert_tuple(&mut t1).unwrap();

        assert_eq!(t0.record_id().unwrap().slot, 0);
        assert_eq!(t1.record_id().unwrap().slot, 1);
        assert_eq!(page.free_slot_count(), total - 2);
        match page.tuple_at(1).unwrap().field(0).unwrap() {
            Field::Int(v) => assert_eq!(*v, 11),
            other => panic!("unexpected field {other:?}"),
        }
    }

    #[test]
    fn delete_clears_the_bit_and_leaves_a_sentinel_record_id() {
        let desc = int_desc(1);
        let pid = PageId::new(7, 0);
        let mut page = HeapPage::empty(pid, desc.clone(), 128);

        let mut t = int_tuple(&desc, 42);
        page.insert_tuple(&mut t).unwrap();
        page.delete_tuple(&mut t).unwrap();

        assert!(!page.is_slot_used(0));
        let rid = t.record_id().unwrap();
        assert_eq!(rid.page_id, pid);
        assert_eq!(rid.slot, SLOT_NONE);

        // Deleting again is an invalid request, not a crash.
        let err = page.delete_tuple(&mut t).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn full_page_rejects_inserts() {
        let desc = int_desc(1);
        let mut page = HeapPage::empty(PageId::new(1, 0), desc.clone(), 16);
        let total = page.slot_count();
        for i in 0..total {
            let mut t = int_tuple(&desc, i as i32);
            page.insert_tuple(&mut t).unwrap();
        }
        let mut extra = int_tuple(&desc, -1);
        assert!(matches!(
            page.insert_tuple(&mut extra),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn before_image_tracks_commits_not_writes() {
        let desc = int_desc(1);
        let mut page = HeapPage::empty(PageId::new(1, 0), desc.clone(), 64);
        let original = page.data().to_vec();

        let mut t = int_tuple(&desc, 5);
        page.insert_tuple(&mut t).unwrap();
        assert_eq!(page.before_image(), &original[..]);
        assert_ne!(page.data(), &original[..]);

        page.set_before_image();
        assert_eq!(page.before_image(), page.data());
    }
}
