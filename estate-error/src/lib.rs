// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type and status codes shared across the pipeline crates.
//!
//! Mirrors the `Error { code, messages }` shape used throughout the
//! pipeline: every fallible boundary (Store, ObjectStore, Fetcher,
//! Scheduler) returns this type so call sites can match on `Code` rather
//! than downcast a driver-specific error.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status codes a component can fail with. Roughly follows the gRPC
/// status vocabulary; only the subset this system actually produces is
/// kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The caller supplied something invalid (bad task name, instances
    /// out of range, malformed record).
    InvalidArgument,
    /// The requested thing does not exist.
    NotFound,
    /// A unique-key violation. Treated as "already present", not as a
    /// hard failure; see `estate-store`.
    AlreadyExists,
    /// A transient condition (network, 5xx, timeout) that may succeed if
    /// retried.
    Unavailable,
    /// Credentials missing or rejected.
    Unauthenticated,
    /// An invariant the caller relies on did not hold; recovered by
    /// deferring the record, never fatal on its own.
    FailedPrecondition,
    /// Anything else, including conditions that should propagate to the
    /// supervisor (store unreachable, required env var missing).
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An error carrying a `Code` and a stack of human-readable messages, the
/// innermost pushed first by `err_tip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    #[must_use]
    pub fn new(code: Code, message: String) -> Self {
        Error {
            code,
            messages: vec![message],
        }
    }

    /// Folds another error's messages into this one, keeping this
    /// error's code. Used when an outer layer wants to annotate a
    /// failure with additional context produced separately (e.g. the
    /// scheduler appending "stage cancelled" to a worker's error).
    #[must_use]
    pub fn merge(mut self, other: Error) -> Self {
        self.messages.extend(other.messages);
        self
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Code::Unavailable)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {{ code: {}, messages: {:?} }}", self.code, self.messages)
    }
}

impl std::error::Error for Error {}

/// Constructs an [`Error`] with a formatted message, in the style of
/// `format!`. A trailing comma after the format args is accepted, to
/// match call sites that always terminate the macro invocation with one.
#[macro_export]
macro_rules! make_err {
    ($code:expr, $fmt:expr $(, $args:expr)* $(,)?) => {
        $crate::Error::new($code, format!($fmt $(, $args)*))
    };
}

/// Shorthand for `make_err!(Code::InvalidArgument, ...)`, used at request
/// validation boundaries (HTTP handlers, config parsing).
#[macro_export]
macro_rules! make_input_err {
    ($fmt:expr $(, $args:expr)* $(,)?) => {
        $crate::make_err!($crate::Code::InvalidArgument, $fmt $(, $args)*)
    };
}

/// Extension trait for attaching context to a `Result<_, Error>` as it
/// unwinds, the way `.context()` works for `anyhow` but keeping our own
/// `Code`.
pub trait ResultExt<T> {
    /// Pushes `msg()` onto the error's message stack, lazily, so the
    /// cost of formatting is only paid on the error path.
    fn err_tip<F, M>(self, msg: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>;

    /// Like `err_tip`, but also overrides the code, for layers that know
    /// more about what the failure actually means than the origin did.
    fn err_tip_with_code<F, M>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Error) -> (Code, M),
        M: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn err_tip<F, M>(self, msg: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|e| {
            let mut err: Error = e.into();
            err.messages.insert(0, msg().into());
            err
        })
    }

    fn err_tip_with_code<F, M>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Error) -> (Code, M),
        M: Into<String>,
    {
        self.map_err(|e| {
            let err: Error = e.into();
            let (code, msg) = f(&err);
            Error {
                code,
                messages: {
                    let mut m = err.messages;
                    m.insert(0, msg.into());
                    m
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_matches_expected_shape() {
        let err = make_err!(Code::Unavailable, "Dummy failure");
        assert_eq!(
            err.to_string(),
            "Error { code: Unavailable, messages: [\"Dummy failure\"] }"
        );
    }

    #[test]
    fn err_tip_prepends_context() {
        let result: Result<(), Error> = Err(make_err!(Code::NotFound, "missing"));
        let tipped = result.err_tip(|| "while loading listing");
        assert_eq!(
            tipped.unwrap_err().messages,
            vec!["while loading listing".to_string(), "missing".to_string()]
        );
    }

    #[test]
    fn merge_keeps_first_code_appends_messages() {
        let a = make_err!(Code::Internal, "outer");
        let b = make_err!(Code::Unavailable, "inner");
        let merged = a.merge(b);
        assert_eq!(merged.code, Code::Internal);
        assert_eq!(merged.messages, vec!["outer".to_string(), "inner".to_string()]);
    }

    #[test]
    fn is_transient_only_for_unavailable() {
        assert!(make_err!(Code::Unavailable, "x").is_transient());
        assert!(!make_err!(Code::Internal, "x").is_transient());
    }
}
