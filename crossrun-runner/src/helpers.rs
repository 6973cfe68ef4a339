// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Small shared helpers.

use std::fmt;

/// A write-once cell for suite properties that may be inherited from an
/// ancestor but never overwritten.
///
/// An explicit second write is a programming error and panics.
#[derive(Clone)]
pub(crate) struct SetOnce<T> {
    value: Option<T>,
}

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T> SetOnce<T> {
    /// Sets the value, panicking if it was already set.
    pub(crate) fn set(&mut self, field: &'static str, value: T) {
        if self.value.is_some() {
            panic!("illegal second write: `{field}` may only be set once");
        }
        self.value = Some(value);
    }

    /// Sets the value only if unset. Used for inheritance from an ancestor.
    pub(crate) fn set_if_unset(&mut self, value: T) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    pub(crate) fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T: fmt::Debug> fmt::Debug for SetOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => f.debug_tuple("SetOnce").field(value).finish(),
            None => f.write_str("SetOnce(unset)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once_inherits_without_overwriting() {
        let mut cell = SetOnce::default();
        cell.set("session_id", 1);
        cell.set_if_unset(2);
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    #[should_panic(expected = "`session_id` may only be set once")]
    fn set_once_panics_on_second_write() {
        let mut cell = SetOnce::default();
        cell.set("session_id", 1);
        cell.set("session_id", 2);
    }
}
