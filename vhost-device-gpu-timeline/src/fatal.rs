// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Fatal error path for timeline contract violations.
//!
//! A violated completion protocol means the guest-visible fence order can no
//! longer be trusted, so the process is aborted instead of unwinding.

use std::fmt;

use log::{error, log_enabled, Level};
use thiserror::Error as ThisError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ThisError)]
pub enum AbortReason {
    #[error("task id was never issued")]
    UnknownTask,
    #[error("task was already retired from its timeline")]
    ExpiredTask,
    #[error("task id does not match the indexed task")]
    TaskIdMismatch,
    #[error("task completion reported twice")]
    TaskAlreadyCompleted,
    #[error("ring has no timeline")]
    UnknownRing,
    #[error("poll is not supported with async fence delivery")]
    PollUnsupported,
}

impl AbortReason {
    /// Stable numeric code reported alongside the diagnostic.
    pub const fn code(self) -> u32 {
        match self {
            Self::UnknownTask => 1,
            Self::ExpiredTask => 2,
            Self::TaskIdMismatch => 3,
            Self::TaskAlreadyCompleted => 4,
            Self::UnknownRing => 5,
            Self::PollUnsupported => 6,
        }
    }
}

#[doc(hidden)]
#[cold]
pub fn abort_with(
    reason: AbortReason,
    file: &str,
    line: u32,
    function: &str,
    args: fmt::Arguments<'_>,
) -> ! {
    if log_enabled!(Level::Error) {
        error!(
            "{file}:{line} {function}: fatal timeline error {} ({reason}): {args}",
            reason.code()
        );
        log::logger().flush();
    } else {
        eprintln!(
            "{file}:{line} {function}: fatal timeline error {} ({reason}): {args}",
            reason.code()
        );
    }
    std::process::abort()
}

/// Logs a diagnostic naming the enclosing function and aborts the process.
macro_rules! timeline_fatal {
    ($reason:expr, $($arg:tt)+) => {{
        fn f() {}
        let function = ::std::any::type_name_of_val(&f).trim_end_matches("::f");
        $crate::fatal::abort_with($reason, file!(), line!(), function, format_args!($($arg)+))
    }};
}

pub(crate) use timeline_fatal;
