// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use thiserror::Error;

use crate::codec::mvd::parser::CtuGeometry;
use crate::codec::mvd::parser::NaluType;
use crate::codec::mvd::picture::Picture;

/// Index of a picture buffer in the DPB arena. Stays valid for the lifetime of the DPB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DpbSlot(pub(crate) usize);

impl DpbSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("no picture with POC {0} in the DPB")]
    NotFound(i32),
}

/// Deferred reference marking started by a CDR picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RefreshState {
    pending: bool,
    poc_cdr: i32,
}

/// Summary of one DPB entry, used for output snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpbEntrySummary {
    pub slot: DpbSlot,
    pub poc: i32,
    pub referenced: bool,
    pub reconstructed: bool,
}

/// The decoded picture buffer of one layer.
///
/// Buffers live in an arena and are never freed: once `max_num_pics` buffers exist, new
/// pictures recycle the first buffer that holds no live picture, in list order.
pub struct Dpb<A> {
    /// Picture buffers. `None` while the buffer is checked out for decoding.
    entries: Vec<Option<Picture<A>>>,
    /// Buffers holding a live picture, or checked out.
    used: Vec<bool>,
    /// List order of the buffers. Insertion order until sorted by POC.
    order: Vec<usize>,
    /// The maximum number of pictures that can be stored.
    max_num_pics: usize,
    refresh: RefreshState,
}

impl<A> Dpb<A> {
    pub fn new(max_num_pics: usize) -> Self {
        Self {
            max_num_pics,
            ..Default::default()
        }
    }

    /// Returns the number of allocated picture buffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffers holding a live picture or being decoded into.
    pub fn num_live(&self) -> usize {
        self.used.iter().filter(|used| **used).count()
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Set the dpb's max num pics. Only unused trailing buffers can be given back when shrinking.
    pub fn set_max_num_pics(&mut self, max_num_pics: usize) -> anyhow::Result<()> {
        while self.entries.len() > max_num_pics {
            let last = self.entries.len() - 1;
            if self.used[last] {
                return Err(anyhow!(
                    "Cannot shrink the DPB to {} pictures: buffer {} is in use",
                    max_num_pics,
                    last
                ));
            }

            self.entries.pop();
            self.used.pop();
            self.order.retain(|&i| i != last);
        }

        self.max_num_pics = max_num_pics;
        Ok(())
    }

    /// Returns an iterator over the stored pictures, in list order.
    pub fn pictures(&self) -> impl Iterator<Item = (DpbSlot, &Picture<A>)> {
        self.order
            .iter()
            .filter_map(|&i| self.entries[i].as_ref().map(|pic| (DpbSlot(i), pic)))
    }

    /// Returns an iterator over the live stored pictures, in list order.
    pub fn live_pictures(&self) -> impl Iterator<Item = (DpbSlot, &Picture<A>)> {
        self.pictures()
            .filter(|(slot, _)| self.used[slot.0])
    }

    pub fn get(&self, slot: DpbSlot) -> Option<&Picture<A>> {
        self.entries.get(slot.0)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: DpbSlot) -> Option<&mut Picture<A>> {
        self.entries.get_mut(slot.0)?.as_mut()
    }

    /// Takes a buffer for a new `width`x`height` picture.
    ///
    /// A new buffer is allocated while the DPB has fewer than `max_num_pics` buffers. Otherwise
    /// the first buffer holding no live picture is recycled. If every buffer is live, the DPB is
    /// sorted by POC and the picture with the lowest POC is evicted.
    ///
    /// The buffer stays checked out until it is given back through [`Dpb::commit`] or
    /// [`Dpb::discard`].
    pub fn acquire(
        &mut self,
        width: u32,
        height: u32,
        geometry: CtuGeometry,
    ) -> anyhow::Result<(DpbSlot, Picture<A>)> {
        let index = if self.entries.len() < self.max_num_pics {
            self.entries.push(Some(Picture::new(width, height, geometry)));
            self.used.push(false);
            self.order.push(self.entries.len() - 1);
            self.entries.len() - 1
        } else if let Some(&index) = self.order.iter().find(|&&i| !self.used[i]) {
            index
        } else {
            self.sort_by_poc();
            let index = *self
                .order
                .iter()
                .find(|&&i| self.entries[i].is_some())
                .ok_or(anyhow!("No DPB buffer can be evicted, all of them are checked out"))?;

            if let Some(pic) = &self.entries[index] {
                log::warn!(
                    "DPB is exhausted, evicting POC {} (referenced: {})",
                    pic.data.poc,
                    pic.data.is_ref()
                );
            }

            index
        };

        let mut picture = self.entries[index]
            .take()
            .ok_or(anyhow!("DPB buffer {} is already checked out", index))?;
        picture.recycle(width, height, geometry);
        self.used[index] = true;

        log::debug!(
            "Acquired DPB buffer {}, {} of {} buffers allocated",
            index,
            self.entries.len(),
            self.max_num_pics
        );

        Ok((DpbSlot(index), picture))
    }

    /// Stores a decoded picture back into the buffer it was acquired from.
    pub fn commit(&mut self, slot: DpbSlot, mut picture: Picture<A>) -> anyhow::Result<()> {
        let entry = self
            .entries
            .get_mut(slot.0)
            .ok_or(anyhow!("Invalid DPB slot {}", slot.0))?;
        if entry.is_some() {
            return Err(anyhow!("DPB slot {} was not checked out", slot.0));
        }

        log::debug!(
            "Stored picture POC {} (layer {:?}) in DPB slot {}",
            picture.data.poc,
            picture.data.layer,
            slot.0
        );

        picture.data.reconstructed = true;
        *entry = Some(picture);
        self.used[slot.0] = true;

        Ok(())
    }

    /// Gives back a checked out buffer whose picture will not be completed.
    pub fn discard(&mut self, slot: DpbSlot, mut picture: Picture<A>) -> anyhow::Result<()> {
        let entry = self
            .entries
            .get_mut(slot.0)
            .ok_or(anyhow!("Invalid DPB slot {}", slot.0))?;
        if entry.is_some() {
            return Err(anyhow!("DPB slot {} was not checked out", slot.0));
        }

        log::debug!("Discarding picture POC {}", picture.data.poc);

        picture.data.set_reference(false);
        picture.data.reconstructed = false;
        picture.aux = None;
        *entry = Some(picture);
        self.used[slot.0] = false;

        Ok(())
    }

    /// Frees the buffer of a live picture for reuse.
    pub fn retire(&mut self, slot: DpbSlot) {
        if let Some(Some(pic)) = self.entries.get_mut(slot.0) {
            log::debug!("Retiring picture POC {}", pic.data.poc);
            pic.data.reconstructed = false;
            pic.planes.reset_border();
            self.used[slot.0] = false;
        }
    }

    /// Finds the live picture with `poc`.
    pub fn find_by_poc(&self, poc: i32) -> Option<DpbSlot> {
        let slot = self
            .live_pictures()
            .find(|(_, pic)| pic.data.poc == poc)
            .map(|(slot, _)| slot);

        log::debug!("find_by_poc: {}, found slot {:?}", poc, slot);
        slot
    }

    /// Marks the border of the picture at `slot` as extended.
    pub fn extend_border(&mut self, slot: DpbSlot) {
        if let Some(pic) = self.get_mut(slot) {
            pic.planes.extend_border();
        }
    }

    /// Drops the backend side buffers of the live pictures with `poc`. The reconstructed samples
    /// stay available for reference.
    pub fn release(&mut self, poc: i32) -> Result<(), DpbError> {
        let mut found = false;
        for (entry, _) in self.entries.iter_mut().zip(&self.used).filter(|(_, used)| **used) {
            if let Some(pic) = entry.as_mut().filter(|pic| pic.data.poc == poc) {
                pic.aux = None;
                found = true;
            }
        }

        if !found {
            return Err(DpbError::NotFound(poc));
        }

        Ok(())
    }

    /// Marks every stored picture except those with a POC in `except_pocs` as unused for
    /// reference.
    pub fn mark_unreferenced(&mut self, except_pocs: &[i32]) {
        for pic in self.entries.iter_mut().flatten() {
            if !except_pocs.contains(&pic.data.poc) {
                pic.data.set_reference(false);
            }
        }
    }

    /// Reference marking at decoding refresh points, run before the references of a new slice
    /// with `poc` are resolved.
    ///
    /// An IDR picture unmarks everything else immediately. A CDR picture defers the unmarking
    /// until a picture with a later POC arrives, sparing the CDR picture itself.
    pub fn decoding_refresh_marking(&mut self, poc: i32, nalu_type: NaluType) {
        if nalu_type.is_idr() {
            self.mark_unreferenced(&[poc]);
            self.refresh.pending = false;
            return;
        }

        if self.refresh.pending && poc > self.refresh.poc_cdr {
            log::debug!(
                "Applying pending refresh of CDR POC {} at POC {}",
                self.refresh.poc_cdr,
                poc
            );
            self.mark_unreferenced(&[poc, self.refresh.poc_cdr]);
            self.refresh.pending = false;
        }

        if nalu_type.is_cdr() {
            self.refresh = RefreshState {
                pending: true,
                poc_cdr: poc,
            };
        }
    }

    /// Stable ascending sort of the list order by POC.
    pub fn sort_by_poc(&mut self) {
        let entries = &self.entries;
        self.order.sort_by_key(|&i| {
            entries[i]
                .as_ref()
                .map(|pic| pic.data.poc)
                .unwrap_or(i32::MIN)
        });
    }

    /// Summaries of the live pictures, in list order.
    pub fn snapshot(&self) -> Vec<DpbEntrySummary> {
        self.live_pictures()
            .map(|(slot, pic)| DpbEntrySummary {
                slot,
                poc: pic.data.poc,
                referenced: pic.data.is_ref(),
                reconstructed: pic.data.reconstructed,
            })
            .collect()
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");

        let max_num_pics = self.max_num_pics;

        *self = Default::default();
        self.max_num_pics = max_num_pics;
    }
}

impl<A> Default for Dpb<A> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            used: Default::default(),
            order: Default::default(),
            max_num_pics: Default::default(),
            refresh: Default::default(),
        }
    }
}

impl<A> std::fmt::Debug for Dpb<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dpb")
            .field("pictures", &self.snapshot())
            .field("max_num_pics", &self.max_num_pics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mvd::parser::LayerId;

    fn store(dpb: &mut Dpb<()>, poc: i32, referenced: bool) -> DpbSlot {
        let (slot, mut pic) = dpb.acquire(16, 16, Default::default()).unwrap();
        pic.data.poc = poc;
        pic.data.layer = LayerId::texture(0);
        pic.data.set_reference(referenced);
        dpb.commit(slot, pic).unwrap();
        slot
    }

    fn referenced_pocs(dpb: &Dpb<()>) -> Vec<i32> {
        dpb.live_pictures()
            .filter(|(_, pic)| pic.data.is_ref())
            .map(|(_, pic)| pic.data.poc)
            .collect()
    }

    #[test]
    fn eviction_takes_lowest_poc() {
        let _ = env_logger::try_init();

        let mut dpb = Dpb::<()>::new(2);
        // Insert out of POC order so that list order and POC order differ.
        let slot1 = store(&mut dpb, 1, true);
        let slot0 = store(&mut dpb, 0, true);
        assert_ne!(slot0, slot1);

        let (slot, pic) = dpb.acquire(16, 16, Default::default()).unwrap();
        assert_eq!(slot, slot0);
        assert_eq!(pic.data.poc, 0);
        assert!(!pic.data.is_ref());
        assert_eq!(dpb.len(), 2);

        dpb.commit(slot, pic).unwrap();
    }

    #[test]
    fn reuse_prefers_free_buffers() {
        let _ = env_logger::try_init();

        let mut dpb = Dpb::<()>::new(3);
        let slot0 = store(&mut dpb, 0, true);
        let slot1 = store(&mut dpb, 1, false);
        let _slot2 = store(&mut dpb, 2, true);

        dpb.retire(slot1);
        let (slot, _pic) = dpb.acquire(16, 16, Default::default()).unwrap();
        assert_eq!(slot, slot1);
        assert_ne!(slot, slot0);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let _ = env_logger::try_init();

        let mut dpb = Dpb::<()>::new(3);
        for poc in 0..20 {
            store(&mut dpb, poc, poc % 3 != 0);
            assert!(dpb.len() <= 3);
            assert!(dpb.num_live() <= 3);
        }

        assert_eq!(dpb.len(), 3);
        let mut pocs = dpb
            .live_pictures()
            .map(|(_, pic)| pic.data.poc)
            .collect::<Vec<_>>();
        pocs.sort();
        assert_eq!(pocs, vec![17, 18, 19]);
    }

    #[test]
    fn checked_out_buffer_is_never_evicted() {
        let mut dpb = Dpb::<()>::new(1);
        let (slot, pic) = dpb.acquire(16, 16, Default::default()).unwrap();
        assert!(dpb.acquire(16, 16, Default::default()).is_err());
        assert!(dpb.find_by_poc(0).is_none());

        dpb.discard(slot, pic).unwrap();
        assert_eq!(dpb.num_live(), 0);
        assert!(dpb.acquire(16, 16, Default::default()).is_ok());
    }

    #[test]
    fn release_drops_side_buffers() {
        let mut dpb = Dpb::<Vec<u8>>::new(2);
        let (slot, mut pic) = dpb.acquire(16, 16, Default::default()).unwrap();
        pic.data.poc = 7;
        pic.aux = Some(vec![0; 64]);
        dpb.commit(slot, pic).unwrap();

        assert_eq!(dpb.release(3), Err(DpbError::NotFound(3)));
        assert!(dpb.get(slot).unwrap().aux.is_some());

        // A repeated POC is released along with the first one.
        let (again, mut pic) = dpb.acquire(16, 16, Default::default()).unwrap();
        pic.data.poc = 7;
        pic.aux = Some(vec![0; 64]);
        dpb.commit(again, pic).unwrap();

        dpb.release(7).unwrap();
        let pic = dpb.get(slot).unwrap();
        assert!(pic.aux.is_none());
        assert!(pic.data.reconstructed);
        assert!(dpb.get(again).unwrap().aux.is_none());
        assert_eq!(dpb.find_by_poc(7), Some(slot));
    }

    #[test]
    fn idr_unmarks_immediately() {
        let mut dpb = Dpb::<()>::new(4);
        store(&mut dpb, 0, true);
        store(&mut dpb, 1, true);
        store(&mut dpb, 2, true);

        dpb.decoding_refresh_marking(2, NaluType::CodedSliceIdr);
        assert_eq!(referenced_pocs(&dpb), vec![2]);
    }

    #[test]
    fn cdr_unmarks_once_a_later_poc_arrives() {
        let mut dpb = Dpb::<()>::new(6);
        store(&mut dpb, 0, true);
        store(&mut dpb, 4, true);

        dpb.decoding_refresh_marking(8, NaluType::CodedSliceCdr);
        store(&mut dpb, 8, true);
        assert_eq!(referenced_pocs(&dpb), vec![0, 4, 8]);

        // Leading pictures before the CDR keep every reference.
        dpb.decoding_refresh_marking(6, NaluType::CodedSlice);
        store(&mut dpb, 6, true);
        assert_eq!(referenced_pocs(&dpb), vec![0, 4, 8, 6]);

        dpb.decoding_refresh_marking(12, NaluType::CodedSlice);
        assert_eq!(referenced_pocs(&dpb), vec![8]);

        // The refresh is applied only once.
        store(&mut dpb, 12, true);
        dpb.decoding_refresh_marking(16, NaluType::CodedSlice);
        assert_eq!(referenced_pocs(&dpb), vec![8, 12]);
    }

    #[test]
    fn sort_is_stable() {
        let mut dpb = Dpb::<()>::new(4);
        let a = store(&mut dpb, 3, true);
        let b = store(&mut dpb, 1, true);
        let c = store(&mut dpb, 3, true);
        let d = store(&mut dpb, 0, true);

        dpb.sort_by_poc();
        let slots = dpb.pictures().map(|(slot, _)| slot).collect::<Vec<_>>();
        assert_eq!(slots, vec![d, b, a, c]);
    }

    #[test]
    fn shrink_keeps_live_buffers() {
        let mut dpb = Dpb::<()>::new(4);
        let slot0 = store(&mut dpb, 0, true);
        let slot1 = store(&mut dpb, 1, true);

        dpb.retire(slot1);
        dpb.set_max_num_pics(1).unwrap();
        assert_eq!(dpb.len(), 1);
        assert_eq!(dpb.find_by_poc(0), Some(slot0));

        assert!(dpb.set_max_num_pics(0).is_err());
        assert_eq!(dpb.max_num_pics(), 1);
    }
}
