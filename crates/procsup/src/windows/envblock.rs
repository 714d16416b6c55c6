//! Unicode environment block for `CreateProcessW`
//!
//! The block is a sequence of `KEY=VALUE\0` entries sorted by key without
//! regard to case, terminated by an extra NUL.

use std::cmp::Ordering;

fn fold(c: u16) -> u16 {
    if (b'a' as u16..=b'z' as u16).contains(&c) {
        c - 32
    } else {
        c
    }
}

fn compare_keys(a: &[u16], b: &[u16]) -> Ordering {
    a.iter().map(|&c| fold(c)).cmp(b.iter().map(|&c| fold(c)))
}

/// Build a block from wide pairs. A later entry replaces an earlier one
/// whose key differs only in case.
pub fn env_block(vars: Vec<(Vec<u16>, Vec<u16>)>) -> Vec<u16> {
    let mut merged: Vec<(Vec<u16>, Vec<u16>)> = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        match merged
            .iter_mut()
            .find(|(existing, _)| compare_keys(existing, &key) == Ordering::Equal)
        {
            Some(slot) => *slot = (key, value),
            None => merged.push((key, value)),
        }
    }
    merged.sort_by(|(a, _), (b, _)| compare_keys(a, b));

    let mut block = Vec::new();
    for (key, value) in &merged {
        block.extend_from_slice(key);
        block.push(b'=' as u16);
        block.extend_from_slice(value);
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

#[cfg(windows)]
pub fn environment_block(vars: &[(std::ffi::OsString, std::ffi::OsString)]) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;

    env_block(
        vars.iter()
            .map(|(k, v)| (k.encode_wide().collect(), v.encode_wide().collect()))
            .collect(),
    )
}
