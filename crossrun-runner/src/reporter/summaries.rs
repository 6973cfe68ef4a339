// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialized forms of suites and tests, consumed by reporters.
//!
//! The same shapes travel over the wire from remote sessions, so everything
//! here derives both `Serialize` and `Deserialize` with camelCase field
//! names.

use crate::reporter::events::ErrorSummary;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// A serialized suite, including its (possibly nested) children.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuiteSummary {
    /// The suite name.
    pub name: SmolStr,

    /// The full id: the names of the suite and its ancestors joined.
    pub id: SmolStr,

    /// The remote session this suite runs against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SmolStr>,

    /// False for root suites.
    pub has_parent: bool,

    /// The suite's children, in registration order.
    pub tests: Vec<NodeSummary>,

    /// Wall-clock time the suite took to run, in milliseconds.
    #[serde(default, with = "duration_ms")]
    pub time_elapsed: Duration,

    /// The number of tests in the subtree.
    pub num_tests: usize,

    /// The number of failed tests in the subtree.
    pub num_failed_tests: usize,

    /// The number of skipped tests in the subtree.
    pub num_skipped_tests: usize,

    /// The suite's fatal error, if one was recorded.
    #[serde(default)]
    pub error: Option<ErrorSummary>,
}

/// A serialized test.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    /// The test name.
    pub name: SmolStr,

    /// The full id: the names of the test and its ancestors joined.
    pub id: SmolStr,

    /// The remote session this test ran against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SmolStr>,

    /// Always true for tests; kept for symmetry with suite summaries.
    pub has_parent: bool,

    /// The test's timeout, in milliseconds.
    #[serde(default, with = "duration_ms")]
    pub timeout: Duration,

    /// True iff the body completed without error and was not skipped.
    pub has_passed: bool,

    /// The skip reason, if the test was skipped.
    #[serde(default)]
    pub skipped: Option<SmolStr>,

    /// Wall-clock time the test took to run, in milliseconds.
    #[serde(default, with = "duration_ms")]
    pub time_elapsed: Duration,

    /// The error that settled the test, if any.
    #[serde(default)]
    pub error: Option<ErrorSummary>,
}

/// One entry in a suite's serialized child list.
///
/// The wire format is structural: suite objects carry `tests`/`numTests`,
/// test objects carry `hasPassed`, so an untagged enum disambiguates.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NodeSummary {
    /// A nested suite.
    Suite(SuiteSummary),
    /// A leaf test.
    Test(TestSummary),
}

impl NodeSummary {
    /// The number of tests under this node.
    pub fn num_tests(&self) -> usize {
        match self {
            NodeSummary::Suite(suite) => suite.num_tests,
            NodeSummary::Test(_) => 1,
        }
    }

    /// The number of failed tests under this node.
    pub fn num_failed_tests(&self) -> usize {
        match self {
            NodeSummary::Suite(suite) => suite.num_failed_tests,
            NodeSummary::Test(test) => {
                usize::from(test.error.is_some() && test.skipped.is_none())
            }
        }
    }

    /// The number of skipped tests under this node.
    pub fn num_skipped_tests(&self) -> usize {
        match self {
            NodeSummary::Suite(suite) => suite.num_skipped_tests,
            NodeSummary::Test(test) => usize::from(test.skipped.is_some()),
        }
    }
}

/// Durations travel as fractional milliseconds on the wire.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(D::Error::custom(format!(
                "invalid duration in milliseconds: {millis}"
            )));
        }
        Ok(Duration::from_secs_f64(millis / 1000.0))
    }
}
