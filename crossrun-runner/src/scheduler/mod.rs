// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The bounded-concurrency scheduler.
//!
//! The main structure in this module is [`SuiteRunner`].

mod imp;

pub use imp::*;
