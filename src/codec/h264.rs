// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod frame;
pub mod marking;
pub mod nalu_reader;
pub mod parser;
pub mod poc;
pub mod sei;
