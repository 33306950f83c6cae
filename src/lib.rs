// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture management for H.264 decoders.
//!
//! The crate keeps track of everything a hardware H.264 decoder needs besides the actual
//! macroblock decoding: picture order counts, the decoded picture buffer of every view and layer,
//! reference marking (sliding window and memory management control operations), frame_num gap
//! concealment, output ordering and the submission of completed frames to an accelerator.
//!
//! [`decoder::supplier::TaskSupplier`] is the entry point. It takes parsed slices and SEI messages
//! and hands frames over to a [`decoder::VideoAccelerator`].

pub mod backend;
pub mod codec;
pub mod decoder;
