// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
};

use rusty_fork::ChildWrapper;

use crate::fatal::AbortReason;

/// Waits for a forked test child and checks that it was killed by `SIGABRT`
/// after reporting `reason`.
pub fn assert_child_aborted(child: &mut ChildWrapper, output: &mut File, reason: AbortReason) {
    let status = child.wait().unwrap();
    let mut log = String::new();
    output.seek(SeekFrom::Start(0)).unwrap();
    output.read_to_string(&mut log).unwrap();

    assert_eq!(
        status.unix_signal(),
        Some(libc::SIGABRT),
        "child exited with {status}, output:\n{log}"
    );
    let expected = format!("fatal timeline error {} ({reason})", reason.code());
    assert!(
        log.contains(&expected),
        "expected `{expected}` in child output:\n{log}"
    );
}

/// Runs `$body` in a forked child and expects it to abort with `$reason`.
macro_rules! assert_aborts {
    ($test:ident, $reason:expr, $body:block) => {
        rusty_fork::fork(
            rusty_fork::rusty_fork_test_name!($test),
            rusty_fork::rusty_fork_id!(),
            |_| {},
            |child, output| $crate::testutils::assert_child_aborted(child, output, $reason),
            || $body,
        )
        .unwrap()
    };
}

pub(crate) use assert_aborts;
