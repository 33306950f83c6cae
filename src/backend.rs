// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accelerator backends.
//!
//! A backend drives the actual decoding of the frames the task broker hands over. This crate only
//! ships a scripted backend that lets the session run without hardware.

pub mod dummy;
