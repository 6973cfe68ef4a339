// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reporting channel.
//!
//! Suites and the scheduler emit [`events::RunEvent`]s into an
//! [`EventChannel`]; reporters implement [`RunReporter`] and are registered
//! on the channel before the run starts.

pub mod events;
mod imp;
mod summaries;
#[cfg(test)]
pub(crate) mod test_helpers;

pub use imp::*;
pub use summaries::*;
