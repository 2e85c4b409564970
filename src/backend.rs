// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for codec backends.
//!
//! A backend performs the pixel reconstruction of the pictures the decoder assembles. This module
//! contains backend-related code that is not tied to any particular codec.

#[cfg(any(test, fuzzing))]
pub mod dummy;
