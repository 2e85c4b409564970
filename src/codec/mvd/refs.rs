// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::codec::mvd::dpb::Dpb;
use crate::codec::mvd::dpb::DpbSlot;
use crate::codec::mvd::parser::LayerId;
use crate::codec::mvd::parser::RefPocMode;
use crate::codec::mvd::parser::SliceHeader;
use crate::codec::mvd::parser::SliceType;

/// Locates a picture in the DPB of its layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PicHandle {
    pub layer: LayerId,
    pub slot: DpbSlot,
}

/// A decoded picture of another layer in the current access unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterViewPicture {
    pub poc: i32,
    pub view_idx: u8,
    pub handle: PicHandle,
}

/// A resolved entry of a reference picture list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefPicListEntry {
    /// POC of the bound picture. Differs from the requested POC after a mirrored lookup.
    pub poc: i32,
    pub view_idx: u8,
    pub handle: PicHandle,
}

impl RefPicListEntry {
    fn key(&self) -> (i32, u8) {
        (self.poc, self.view_idx)
    }
}

/// The combined reference list of a B slice and its mappings back to list 0 and list 1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CombinedList {
    /// `(list, index)` each combined entry comes from.
    pub entries: Vec<(usize, usize)>,
    /// Combined index of each list entry that introduced a new picture.
    pub idx_of_lc: [Vec<Option<usize>>; 2],
    /// Index in list 1 of the list 0 entries that duplicate a list 1 entry.
    pub l1_from_l0: Vec<Option<usize>>,
    /// Index in list 0 of the list 1 entries that duplicate a list 0 entry.
    pub l0_from_l1: Vec<Option<usize>>,
    /// Combined index holding the picture of each list entry, duplicates included.
    shared: [Vec<usize>; 2],
}

impl CombinedList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Combined index of the picture referenced by entry `idx` of `list`.
    pub fn combined_index(&self, list: usize, idx: usize) -> Option<usize> {
        self.shared.get(list)?.get(idx).copied()
    }
}

/// Interleaves list 0 and list 1, keeping the first occurrence of every picture. List 0 wins
/// when both lists reference the same picture at the same index.
pub fn build_combined_list(list0: &[RefPicListEntry], list1: &[RefPicListEntry]) -> CombinedList {
    let lists = [list0, list1];
    let mut combined = CombinedList {
        idx_of_lc: [vec![None; list0.len()], vec![None; list1.len()]],
        l1_from_l0: vec![None; list0.len()],
        l0_from_l1: vec![None; list1.len()],
        shared: [vec![0; list0.len()], vec![0; list1.len()]],
        ..Default::default()
    };

    for idx in 0..list0.len().max(list1.len()) {
        for (list, entries) in lists.iter().enumerate() {
            let Some(entry) = entries.get(idx) else {
                continue;
            };

            let existing = combined
                .entries
                .iter()
                .position(|&(l, i)| lists[l][i].key() == entry.key());

            match existing {
                Some(lc) => {
                    let (other_list, other_idx) = combined.entries[lc];
                    log::trace!(
                        "L{}[{}] duplicates L{}[{}] (combined index {})",
                        list,
                        idx,
                        other_list,
                        other_idx,
                        lc
                    );

                    if other_list != list {
                        if list == 0 {
                            combined.l1_from_l0[idx] = Some(other_idx);
                            combined.l0_from_l1[other_idx] = Some(idx);
                        } else {
                            combined.l0_from_l1[idx] = Some(other_idx);
                            combined.l1_from_l0[other_idx] = Some(idx);
                        }
                    }
                    combined.shared[list][idx] = lc;
                }
                None => {
                    let lc = combined.entries.len();
                    combined.entries.push((list, idx));
                    combined.idx_of_lc[list][idx] = Some(lc);
                    combined.shared[list][idx] = lc;
                }
            }
        }
    }

    combined
}

/// Reference pictures of a slice, bound to concrete DPB entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePicLists {
    pub list0: Vec<RefPicListEntry>,
    pub list1: Vec<RefPicListEntry>,
    pub combined: Option<CombinedList>,
    /// Both lists reference the same pictures in the same order.
    pub no_back_pred: bool,
    /// Co-located texture picture of a depth slice.
    pub texture: Option<PicHandle>,
}

impl ReferencePicLists {
    pub fn list(&self, list: usize) -> &[RefPicListEntry] {
        match list {
            0 => &self.list0,
            _ => &self.list1,
        }
    }

    /// Every bound entry of both lists.
    pub fn entries(&self) -> impl Iterator<Item = &RefPicListEntry> {
        self.list0.iter().chain(self.list1.iter())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error(
        "inter-view reference to POC {ref_poc} of view {ref_view_idx} from POC {poc}: {reason}"
    )]
    InterViewConsistency {
        poc: i32,
        ref_poc: i32,
        ref_view_idx: u8,
        reason: &'static str,
    },
    #[error("list {list} references POC {ref_poc} of view {view_idx}, which is not available")]
    StreamInconsistency { list: usize, ref_poc: i32, view_idx: u8 },
}

/// Turns the `(POC, view)` entries of a slice into pictures.
#[derive(Clone, Debug)]
pub struct ReferencePictureResolver {
    /// Retry missing future references mirrored around the current POC.
    pub mirrored_poc_fallback: bool,
}

impl Default for ReferencePictureResolver {
    fn default() -> Self {
        Self {
            mirrored_poc_fallback: true,
        }
    }
}

impl ReferencePictureResolver {
    pub fn new(mirrored_poc_fallback: bool) -> Self {
        Self {
            mirrored_poc_fallback,
        }
    }

    /// Resolves the reference lists of `hdr`.
    ///
    /// Temporal references are looked up in `dpb`, the store of the slice's layer. Inter-view
    /// references must be among `siblings`, the pictures of the other views in the current
    /// access unit. Depth slices also need `texture`, the co-located texture picture.
    pub fn resolve<A>(
        &self,
        hdr: &SliceHeader,
        dpb: &mut Dpb<A>,
        siblings: &[InterViewPicture],
        texture: Option<&InterViewPicture>,
    ) -> Result<ReferencePicLists, ReferenceError> {
        let mut lists = ReferencePicLists::default();
        let layer = hdr.layer();

        if hdr.is_depth {
            let texture = texture
                .filter(|pic| pic.poc == hdr.poc && pic.view_idx == hdr.view_idx)
                .ok_or(ReferenceError::InterViewConsistency {
                    poc: hdr.poc,
                    ref_poc: hdr.poc,
                    ref_view_idx: hdr.view_idx,
                    reason: "the texture picture of the depth slice is missing",
                })?;
            lists.texture = Some(texture.handle);
        }

        if hdr.slice_type == SliceType::I {
            return Ok(lists);
        }

        dpb.sort_by_poc();

        for list in 0..2 {
            let mut entries = Vec::with_capacity(hdr.num_active_refs(list));

            for idx in 0..hdr.num_active_refs(list) {
                let ref_poc = hdr.ref_poc(list, idx);
                let ref_view = hdr.ref_view(list, idx);
                let (Some(ref_poc), Some(ref_view)) = (ref_poc, ref_view) else {
                    return Err(ReferenceError::StreamInconsistency {
                        list,
                        ref_poc: hdr.poc,
                        view_idx: hdr.view_idx,
                    });
                };

                let entry = if ref_view == hdr.view_idx {
                    self.resolve_temporal(hdr, layer, dpb, list, ref_poc)?
                } else {
                    Self::resolve_inter_view(hdr, siblings, ref_poc, ref_view)?
                };

                log::trace!(
                    "POC {} view {} L{}[{}] -> POC {} view {} (slot {})",
                    hdr.poc,
                    hdr.view_idx,
                    list,
                    idx,
                    entry.poc,
                    entry.view_idx,
                    entry.handle.slot.index()
                );
                entries.push(entry);
            }

            match list {
                0 => lists.list0 = entries,
                _ => lists.list1 = entries,
            }
        }

        if hdr.slice_type == SliceType::B {
            if hdr.ref_pic_list_combination {
                if !hdr.ref_pic_list_modification_lc {
                    lists.combined = Some(build_combined_list(&lists.list0, &lists.list1));
                }
            } else {
                lists.no_back_pred = lists.list0.len() == lists.list1.len()
                    && lists
                        .list0
                        .iter()
                        .zip(&lists.list1)
                        .all(|(l0, l1)| l0.poc == l1.poc);
            }
        }

        Ok(lists)
    }

    fn resolve_temporal<A>(
        &self,
        hdr: &SliceHeader,
        layer: LayerId,
        dpb: &mut Dpb<A>,
        list: usize,
        ref_poc: i32,
    ) -> Result<RefPicListEntry, ReferenceError> {
        let mut found = dpb.find_by_poc(ref_poc).map(|slot| (slot, ref_poc));

        if found.is_none()
            && self.mirrored_poc_fallback
            && hdr.ref_poc_mode == RefPocMode::Relative
            && ref_poc > hdr.poc
        {
            let mirrored = 2 * hdr.poc - ref_poc;
            found = dpb.find_by_poc(mirrored).map(|slot| (slot, mirrored));
            if found.is_some() {
                log::warn!(
                    "POC {} of view {} is missing, using mirrored POC {} for POC {}",
                    ref_poc,
                    hdr.view_idx,
                    mirrored,
                    hdr.poc
                );
            }
        }

        let (slot, poc) = found.ok_or(ReferenceError::StreamInconsistency {
            list,
            ref_poc,
            view_idx: hdr.view_idx,
        })?;

        dpb.extend_border(slot);

        Ok(RefPicListEntry {
            poc,
            view_idx: hdr.view_idx,
            handle: PicHandle { layer, slot },
        })
    }

    fn resolve_inter_view(
        hdr: &SliceHeader,
        siblings: &[InterViewPicture],
        ref_poc: i32,
        ref_view: u8,
    ) -> Result<RefPicListEntry, ReferenceError> {
        let error = |reason| ReferenceError::InterViewConsistency {
            poc: hdr.poc,
            ref_poc,
            ref_view_idx: ref_view,
            reason,
        };

        if ref_poc != hdr.poc {
            return Err(error("inter-view references must share the POC of the slice"));
        }

        let sibling = siblings
            .iter()
            .find(|pic| pic.view_idx == ref_view && pic.poc == ref_poc)
            .ok_or_else(|| error("the view has not been decoded in this access unit"))?;

        Ok(RefPicListEntry {
            poc: sibling.poc,
            view_idx: sibling.view_idx,
            handle: sibling.handle,
        })
    }
}
