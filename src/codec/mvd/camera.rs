// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Collection of the multiview camera parameters.
//!
//! Texture slices carry, directly or through their SPS, the scale and offset converting depth
//! samples of a base view into disparities towards the slice's view, and back. The collector
//! gathers them per access unit, checks that views agree with each other and emits one
//! [`CameraParameterRecord`] per access unit that has something new to report.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use crate::codec::mvd::parser::ScaleOffset;
use crate::codec::mvd::parser::SliceHeader;
use crate::codec::mvd::parser::Sps;
use crate::codec::mvd::parser::MAX_NUM_VIEWS;

/// End POC of rows that stay valid for the rest of the stream.
pub const END_OF_STREAM_POC: i32 = i32::MAX;

/// Number of entries of a depth-to-disparity lookup table. The last entry repeats the one
/// before it so that interpolation at the upper bound stays in range.
pub const SHIFT_LUT_SIZE: usize = 257;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraParameterError {
    #[error("view {view_idx} is out of range, at most {num_views} views are supported")]
    ViewOutOfRange { view_idx: usize, num_views: usize },
    #[error("inconsistent camera parameters for view {view_idx}: {what}")]
    Inconsistent { view_idx: u8, what: String },
    #[error("access unit with POC {poc} is missing view {view_idx}")]
    IncompleteAccessUnit { poc: i32, view_idx: u8 },
    #[error("view {view_idx} of POC {poc} arrived after view {previous:?}")]
    ViewOrder {
        poc: i32,
        view_idx: u8,
        previous: Option<u8>,
    },
    #[error("camera parameter precision {precision} is too low for the lookup tables")]
    LutPrecision { precision: u32 },
    #[error("shifts of scale {scale} and offset {offset} do not fit the lookup tables")]
    LutOverflow { scale: i32, offset: i32 },
}

impl CameraParameterError {
    /// Whether decoding can go on after this error. Only the camera parameter output of the
    /// access unit is unreliable then.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CameraParameterError::Inconsistent { .. })
    }
}

/// A square matrix indexed by `[base view][target view]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewMatrix<T> {
    num_views: usize,
    cells: Vec<T>,
}

impl<T: Clone + Default> ViewMatrix<T> {
    pub fn new(num_views: usize) -> Result<Self, CameraParameterError> {
        if num_views > MAX_NUM_VIEWS {
            return Err(CameraParameterError::ViewOutOfRange {
                view_idx: num_views - 1,
                num_views: MAX_NUM_VIEWS,
            });
        }

        Ok(Self {
            num_views,
            cells: vec![Default::default(); num_views * num_views],
        })
    }

    pub fn num_views(&self) -> usize {
        self.num_views
    }

    fn index(&self, base: usize, target: usize) -> Result<usize, CameraParameterError> {
        for view_idx in [base, target] {
            if view_idx >= self.num_views {
                return Err(CameraParameterError::ViewOutOfRange {
                    view_idx,
                    num_views: self.num_views,
                });
            }
        }

        Ok(base * self.num_views + target)
    }

    pub fn get(&self, base: usize, target: usize) -> Result<&T, CameraParameterError> {
        let index = self.index(base, target)?;
        Ok(&self.cells[index])
    }

    pub fn set(
        &mut self,
        base: usize,
        target: usize,
        value: T,
    ) -> Result<(), CameraParameterError> {
        let index = self.index(base, target)?;
        self.cells[index] = value;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cells.fill(Default::default());
    }
}

/// Integer depth-to-disparity shift tables of one directed view pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShiftLut {
    pub luma: [i32; SHIFT_LUT_SIZE],
    pub chroma: [i32; SHIFT_LUT_SIZE],
}

impl ShiftLut {
    /// Builds the tables for depth samples of `bit_depth` bits and shifts with
    /// `log2_precision` fractional bits.
    pub fn new(
        coded: ScaleOffset,
        precision: u32,
        log2_precision: u32,
        bit_depth: u32,
    ) -> Result<Self, CameraParameterError> {
        let log2_div_luma =
            i64::from(bit_depth) + i64::from(precision) + 1 - i64::from(log2_precision);
        if log2_div_luma <= 0 || log2_div_luma >= 62 || bit_depth > 16 {
            return Err(CameraParameterError::LutPrecision { precision });
        }
        let log2_div_chroma = log2_div_luma + 1;

        let offset = i64::from(coded.offset) << bit_depth;
        let offset_luma = offset + ((1i64 << log2_div_luma) >> 1);
        let offset_chroma = offset + ((1i64 << log2_div_chroma) >> 1);

        let overflow = CameraParameterError::LutOverflow {
            scale: coded.scale,
            offset: coded.offset,
        };

        let mut luma = [0; SHIFT_LUT_SIZE];
        let mut chroma = [0; SHIFT_LUT_SIZE];
        for depth in 0..SHIFT_LUT_SIZE - 1 {
            let scaled = depth as i64 * i64::from(coded.scale);
            luma[depth] = i32::try_from((scaled + offset_luma) >> log2_div_luma)
                .map_err(|_| overflow.clone())?;
            chroma[depth] = i32::try_from((scaled + offset_chroma) >> log2_div_chroma)
                .map_err(|_| overflow.clone())?;
        }
        luma[SHIFT_LUT_SIZE - 1] = luma[SHIFT_LUT_SIZE - 2];
        chroma[SHIFT_LUT_SIZE - 1] = chroma[SHIFT_LUT_SIZE - 2];

        Ok(Self { luma, chroma })
    }
}

/// Camera parameters on file for the current access unit.
///
/// `coded_scale[base][target]` and `coded_scale[target][base]` come from independent syntax
/// elements and are never derived from each other.
///
/// The depth-to-disparity tables of a pair are rebuilt whenever its parameters are stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraParameterTable {
    pub coded_scale: ViewMatrix<Option<i32>>,
    pub coded_offset: ViewMatrix<Option<i32>>,
    pub precision: u32,
    pub varies_over_time: bool,
    /// Fractional bits of the shifts in the lookup tables.
    log2_precision: u32,
    /// Bit depth of the depth samples indexing the lookup tables.
    bit_depth: u32,
    luts: BTreeMap<(usize, usize), ShiftLut>,
}

impl CameraParameterTable {
    pub fn new(num_views: usize) -> Result<Self, CameraParameterError> {
        Ok(Self {
            coded_scale: ViewMatrix::new(num_views)?,
            coded_offset: ViewMatrix::new(num_views)?,
            precision: 0,
            varies_over_time: false,
            log2_precision: 2,
            bit_depth: 8,
            luts: Default::default(),
        })
    }

    /// Sets the format of the lookup tables built from now on.
    pub fn set_lut_format(&mut self, log2_precision: u32, bit_depth: u32) {
        self.log2_precision = log2_precision;
        self.bit_depth = bit_depth;
    }

    /// The coded pair converting depth of `base` into disparity towards `target`.
    pub fn get(
        &self,
        base: usize,
        target: usize,
    ) -> Result<Option<ScaleOffset>, CameraParameterError> {
        let scale = *self.coded_scale.get(base, target)?;
        let offset = *self.coded_offset.get(base, target)?;

        Ok(scale.zip(offset).map(|(scale, offset)| ScaleOffset { scale, offset }))
    }

    fn set(
        &mut self,
        base: usize,
        target: usize,
        value: ScaleOffset,
    ) -> Result<(), CameraParameterError> {
        self.coded_scale.set(base, target, Some(value.scale))?;
        self.coded_offset.set(base, target, Some(value.offset))?;

        let lut = ShiftLut::new(value, self.precision, self.log2_precision, self.bit_depth)?;
        self.luts.insert((base, target), lut);

        Ok(())
    }

    /// Depth-to-disparity tables from `base` to `target`, if their parameters are on file.
    pub fn shift_lut(&self, base: usize, target: usize) -> Option<&ShiftLut> {
        self.luts.get(&(base, target))
    }

    fn clear(&mut self) {
        self.coded_scale.clear();
        self.coded_offset.clear();
        self.precision = 0;
        self.varies_over_time = false;
        self.luts.clear();
    }
}

/// One row of the camera parameter output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraParameterRow {
    pub start_poc: i32,
    /// Last POC the row applies to, [`END_OF_STREAM_POC`] for parameters fixed in the SPS.
    pub end_poc: i32,
    pub target_view: u8,
    pub base_view: u8,
    pub coded_scale: i32,
    pub coded_offset: i32,
    pub precision: u32,
}

/// Camera parameters emitted at the end of an access unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraParameterRecord {
    pub poc: i32,
    /// `(view index, view order index)` of every view. Only present for the first access unit.
    pub views: Option<Vec<(u8, i32)>>,
    pub rows: Vec<CameraParameterRow>,
    /// Cleared when the views of the access unit disagreed on some parameter.
    pub consistent: bool,
}

impl fmt::Display for CameraParameterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(views) = &self.views {
            writeln!(f, "#     ViewId ViewOrderIdx")?;
            writeln!(f, "#----------- ------------")?;
            for (view_idx, view_order_idx) in views {
                writeln!(f, "{:12} {:12}", view_idx, view_order_idx)?;
            }
            writeln!(f)?;
            writeln!(f)?;
            writeln!(
                f,
                "{}{}",
                "# StartFrame     EndFrame   TargetView     BaseView",
                "   CodedScale  CodedOffset    Precision"
            )?;
            writeln!(
                f,
                "{}{}",
                "#----------- ------------ ------------ ------------",
                " ------------ ------------ ------------"
            )?;
        }

        for row in &self.rows {
            writeln!(
                f,
                "{:12} {:12} {:12} {:12} {:12} {:12} {:12}",
                row.start_poc,
                row.end_poc,
                row.target_view,
                row.base_view,
                row.coded_scale,
                row.coded_offset,
                row.precision
            )?;
        }

        Ok(())
    }
}

/// Receives the records produced by a [`CameraParameterCollector`].
pub trait CameraParameterSink {
    fn emit(&mut self, record: CameraParameterRecord);
}

impl CameraParameterSink for Vec<CameraParameterRecord> {
    fn emit(&mut self, record: CameraParameterRecord) {
        self.push(record);
    }
}

impl CameraParameterSink for VecDeque<CameraParameterRecord> {
    fn emit(&mut self, record: CameraParameterRecord) {
        self.push_back(record);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollectorState {
    /// No texture slice seen yet.
    #[default]
    Uninitialized,
    /// Gathering the views of the access unit with this POC.
    Collecting(i32),
    /// The access unit with this POC has been emitted.
    Flushed(i32),
}

pub struct CameraParameterCollector<S: CameraParameterSink> {
    sink: S,
    state: CollectorState,
    table: CameraParameterTable,
    /// Number of access units seen so far. The first one defines the set of views.
    num_access_units: usize,
    /// Highest view index of the first access unit.
    max_view: Option<u8>,
    /// `(view index, view order index)` pairs of the first access unit.
    views: Vec<(u8, i32)>,
    /// Views received in the current access unit.
    received: Vec<bool>,
    last_view: Option<u8>,
    consistent: bool,
}

impl<S: CameraParameterSink> CameraParameterCollector<S> {
    pub fn new(sink: S, num_views: usize) -> Result<Self, CameraParameterError> {
        Ok(Self {
            sink,
            state: Default::default(),
            table: CameraParameterTable::new(num_views)?,
            num_access_units: 0,
            max_view: None,
            views: Vec::new(),
            received: vec![false; num_views],
            last_view: None,
            consistent: true,
        })
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn table(&self) -> &CameraParameterTable {
        &self.table
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Sets the format of the depth-to-disparity tables built from the collected parameters.
    pub fn set_lut_format(&mut self, log2_precision: u32, bit_depth: u32) {
        self.table.set_lut_format(log2_precision, bit_depth);
    }

    /// Forgets everything collected so far.
    pub fn reset(&mut self) {
        self.state = Default::default();
        self.table.clear();
        self.num_access_units = 0;
        self.max_view = None;
        self.views.clear();
        self.received.fill(false);
        self.last_view = None;
        self.consistent = true;
    }

    fn in_first_access_unit(&self) -> bool {
        self.num_access_units == 1
    }

    /// Feeds the next decoded slice with its SPS. `None` marks the end of the stream and
    /// flushes the pending access unit.
    ///
    /// Consistency errors are returned after the slice has been fully taken into account. They
    /// only flag the record of the access unit as unreliable.
    pub fn observe_slice(
        &mut self,
        slice: Option<(&SliceHeader, &Sps)>,
    ) -> Result<(), CameraParameterError> {
        let (hdr, sps) = match slice {
            Some(slice) => slice,
            None => {
                return match self.state {
                    CollectorState::Collecting(poc) => self.flush(poc),
                    _ => Ok(()),
                }
            }
        };

        if hdr.is_depth {
            return Ok(());
        }

        let poc = hdr.poc;
        let view_idx = hdr.view_idx;
        if usize::from(view_idx) >= self.received.len() {
            return Err(CameraParameterError::ViewOutOfRange {
                view_idx: view_idx.into(),
                num_views: self.received.len(),
            });
        }

        // Once flushed, an access unit is closed even if the next one reuses its POC.
        let new_access_unit = match self.state {
            CollectorState::Uninitialized | CollectorState::Flushed(_) => true,
            CollectorState::Collecting(cur) => cur != poc,
        };

        if new_access_unit {
            if let CollectorState::Collecting(prev) = self.state {
                self.flush(prev)?;
            }

            if view_idx != 0 {
                return Err(CameraParameterError::ViewOrder {
                    poc,
                    view_idx,
                    previous: None,
                });
            }

            self.num_access_units += 1;
            if self.in_first_access_unit() {
                log::debug!("First camera parameter access unit has POC {}", poc);
            }

            self.received.fill(false);
            self.last_view = None;
            self.consistent = true;
            self.state = CollectorState::Collecting(poc);
        }

        if let Some(previous) = self.last_view {
            if view_idx < previous {
                return Err(CameraParameterError::ViewOrder {
                    poc,
                    view_idx,
                    previous: Some(previous),
                });
            }
        }

        let mut first_error = None;
        let mut check = |result: Result<(), CameraParameterError>| match result {
            Err(e) if e.is_recoverable() => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                Ok(())
            }
            other => other,
        };

        let repeated_view = self.received[usize::from(view_idx)];
        if repeated_view {
            // Later slices of a view only repeat the parameters on file.
            if self.table.varies_over_time && view_idx > 0 {
                check(self.check_slice_parameters(hdr))?;
            }
        } else if self.in_first_access_unit() {
            check(self.collect_first_view(hdr, sps))?;
        } else {
            check(self.collect_view(hdr, sps))?;
        }

        self.received[usize::from(view_idx)] = true;
        self.last_view = Some(view_idx);

        match first_error {
            Some(e) => {
                log::warn!("Camera parameters of POC {} are unreliable: {}", poc, e);
                self.consistent = false;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Takes the first slice of a view of the first access unit into account.
    fn collect_first_view(
        &mut self,
        hdr: &SliceHeader,
        sps: &Sps,
    ) -> Result<(), CameraParameterError> {
        let view_idx = hdr.view_idx;

        self.max_view = Some(self.max_view.map_or(view_idx, |max| max.max(view_idx)));
        self.views.push((view_idx, sps.view_order_idx));

        if view_idx == 0 {
            return Ok(());
        }

        let mut result = Ok(());
        if view_idx == 1 {
            self.table.precision = sps.cam_par_precision;
            self.table.varies_over_time = sps.cam_par_in_slice_header;
        } else if self.table.precision != sps.cam_par_precision
            || self.table.varies_over_time != sps.cam_par_in_slice_header
        {
            result = Err(CameraParameterError::Inconsistent {
                view_idx,
                what: format!(
                    "precision {} (varying: {}) differs from view 1 precision {} (varying: {})",
                    sps.cam_par_precision,
                    sps.cam_par_in_slice_header,
                    self.table.precision,
                    self.table.varies_over_time
                ),
            });
        }

        let stored = self.store_pairs(hdr, sps);
        result.and(stored)
    }

    /// Takes the first slice of a view of a later access unit into account.
    fn collect_view(&mut self, hdr: &SliceHeader, sps: &Sps) -> Result<(), CameraParameterError> {
        let view_idx = hdr.view_idx;

        match self.views.iter().find(|(idx, _)| *idx == view_idx) {
            Some((_, view_order_idx)) if *view_order_idx != sps.view_order_idx => {
                return Err(CameraParameterError::Inconsistent {
                    view_idx,
                    what: format!(
                        "view order index changed from {} to {}",
                        view_order_idx, sps.view_order_idx
                    ),
                })
            }
            Some(_) => (),
            None => {
                return Err(CameraParameterError::Inconsistent {
                    view_idx,
                    what: String::from("view was not part of the first access unit"),
                })
            }
        }

        if self.table.varies_over_time && view_idx > 0 {
            self.store_pairs(hdr, sps)?;
        }

        Ok(())
    }

    /// Records the pairs between `hdr`'s view and every lower view.
    fn store_pairs(&mut self, hdr: &SliceHeader, sps: &Sps) -> Result<(), CameraParameterError> {
        let view_idx = usize::from(hdr.view_idx);
        let varying = self.table.varies_over_time;
        let coded = if varying {
            &hdr.camera_parameters
        } else {
            &sps.camera_parameters
        };

        let mut result = Ok(());
        for base in 0..view_idx {
            let Some((forward, inverse)) = coded.for_base(base) else {
                if result.is_ok() {
                    result = Err(CameraParameterError::Inconsistent {
                        view_idx: hdr.view_idx,
                        what: format!("no parameters coded towards base view {}", base),
                    });
                }
                continue;
            };

            for (from, to, value) in [(base, view_idx, forward), (view_idx, base, inverse)] {
                if !varying {
                    if let Some(on_file) = self.table.get(from, to)? {
                        if on_file != value {
                            if result.is_ok() {
                                result = Err(CameraParameterError::Inconsistent {
                                    view_idx: hdr.view_idx,
                                    what: format!(
                                        "pair {}->{} is {:?}, {:?} already on file",
                                        from, to, value, on_file
                                    ),
                                });
                            }
                            continue;
                        }
                    }
                }

                log::trace!("Camera parameters {}->{}: {:?}", from, to, value);
                self.table.set(from, to, value)?;
            }
        }

        result
    }

    /// Compares the parameters of a later slice of a view with those on file.
    fn check_slice_parameters(&self, hdr: &SliceHeader) -> Result<(), CameraParameterError> {
        let view_idx = usize::from(hdr.view_idx);

        for base in 0..view_idx {
            let coded = hdr.camera_parameters.for_base(base);
            let on_file = self.table.get(base, view_idx)?.zip(self.table.get(view_idx, base)?);
            if coded != on_file {
                return Err(CameraParameterError::Inconsistent {
                    view_idx: hdr.view_idx,
                    what: format!(
                        "slice parameters towards base view {} changed within the picture",
                        base
                    ),
                });
            }
        }

        Ok(())
    }

    /// Closes the access unit with `poc` and emits its record if it carries anything new.
    ///
    /// Flushing an access unit that has already been flushed does nothing.
    pub fn flush(&mut self, poc: i32) -> Result<(), CameraParameterError> {
        match self.state {
            CollectorState::Collecting(cur) if cur == poc => (),
            _ => return Ok(()),
        }

        self.state = CollectorState::Flushed(poc);

        if let Some(max_view) = self.max_view {
            if let Some(missing) = (0..=max_view).find(|&v| !self.received[usize::from(v)]) {
                return Err(CameraParameterError::IncompleteAccessUnit {
                    poc,
                    view_idx: missing,
                });
            }
        }

        let first = self.in_first_access_unit();
        if !first && !self.table.varies_over_time {
            return Ok(());
        }

        let end_poc = if self.table.varies_over_time {
            poc
        } else {
            END_OF_STREAM_POC
        };

        let num_views = self.max_view.map_or(0, |max| usize::from(max) + 1);
        let mut rows = Vec::new();
        for target in 0..num_views {
            for base in (0..num_views).filter(|&base| base != target) {
                if let Some(coded) = self.table.get(base, target)? {
                    rows.push(CameraParameterRow {
                        start_poc: poc,
                        end_poc,
                        target_view: target as u8,
                        base_view: base as u8,
                        coded_scale: coded.scale,
                        coded_offset: coded.offset,
                        precision: self.table.precision,
                    });
                }
            }
        }

        log::debug!("Emitting {} camera parameter rows for POC {}", rows.len(), poc);

        let mut views = None;
        if first {
            let mut sorted = self.views.clone();
            sorted.sort();
            views = Some(sorted);
        }

        self.sink.emit(CameraParameterRecord {
            poc,
            views,
            rows,
            consistent: self.consistent,
        });

        Ok(())
    }
}
