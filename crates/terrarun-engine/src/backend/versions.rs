// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform version listing helpers.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::traits::Result;

/// Compare two strings treating runs of digits as numbers (`1.10.0 > 1.9.3`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_number(&mut a);
                let right = take_number(&mut b);
                // Longer digit runs are larger once leading zeros are dropped.
                let ord = left
                    .trim_start_matches('0')
                    .len()
                    .cmp(&right.trim_start_matches('0').len())
                    .then_with(|| {
                        left.trim_start_matches('0')
                            .cmp(right.trim_start_matches('0'))
                    });
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut number = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        number.push(c);
        chars.next();
    }
    number
}

/// Sort versions newest first.
pub fn sort_descending(versions: &mut [String]) {
    versions.sort_by(|a, b| natural_cmp(b, a));
}

/// Periodically refreshed version list that falls back to the last good value.
#[derive(Debug)]
pub struct VersionCache {
    refresh_interval: Duration,
    entry: Mutex<Option<(Instant, Vec<String>)>>,
}

impl VersionCache {
    /// Create an empty cache.
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            entry: Mutex::new(None),
        }
    }

    /// Return cached versions, refreshing them with `fetch` when stale.
    ///
    /// A failed refresh keeps serving the last known good list; it only
    /// errors when nothing was ever fetched successfully.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        let cached = self.entry.lock().clone();
        if let Some((fetched_at, versions)) = &cached
            && fetched_at.elapsed() < self.refresh_interval
        {
            return Ok(versions.clone());
        }

        match fetch().await {
            Ok(mut versions) => {
                sort_descending(&mut versions);
                *self.entry.lock() = Some((Instant::now(), versions.clone()));
                Ok(versions)
            }
            Err(e) => match cached {
                Some((_, versions)) => {
                    warn!(error = %e, "Version refresh failed, using last known versions");
                    Ok(versions)
                }
                None => Err(e),
            },
        }
    }
}
