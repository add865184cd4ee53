// Copyright 2026 Optail Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! [`Options`] carries every knob the engine reads. Use the builder:
//!
//! ```rust
//! use std::time::Duration;
//! use optail::{Options, OrderingGuarantee};
//!
//! let options = Options::builder()
//!     .ordering(OrderingGuarantee::Document)
//!     .worker_count(4)
//!     .buffer_duration(Duration::from_millis(500))
//!     .direct_read_ns(vec!["shop.orders".to_string()])
//!     .build();
//!
//! assert_eq!(options.worker_count, 4);
//! ```
//!
//! Values left at zero (or empty) are normalized to their defaults when a
//! context starts, so a partially specified `Options` behaves the same as
//! one that spelled everything out. Normalization also enforces the
//! ordering invariants: [`OrderingGuarantee::Oplog`] forces a single
//! worker, and delta mode bypasses the workers entirely.

use bson::{Bson, Document, Timestamp};
use futures::future::BoxFuture;
use mongodb::Collection;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TailError;
use crate::op::{DataDecoder, OpFilter, OplogEntry};
use crate::ordering::OrderingGuarantee;

/// Produces the timestamp tailing begins after, given the resolved oplog
/// collection. The default reads the timestamp of the last oplog entry.
pub type TimestampSource =
    Arc<dyn Fn(Collection<OplogEntry>) -> BoxFuture<'static, Result<Timestamp, TailError>> + Send + Sync>;

/// Engine configuration. See the module docs for defaulting rules.
#[derive(Clone)]
pub struct Options {
    /// Where tailing starts. `None` means "after the last oplog entry".
    pub after: Option<TimestampSource>,
    /// Applied to every op before it is emitted.
    pub filter: Option<OpFilter>,
    /// Applied while parsing oplog entries, before ids are extracted.
    pub namespace_filter: Option<OpFilter>,
    /// Database holding the oplog. Default `"local"`.
    pub oplog_database_name: String,
    /// Oplog collection name. `None` resolves to the first collection
    /// whose name begins with `"oplog."`; failing that, starting errors.
    pub oplog_collection_name: Option<String>,
    /// Server-side await window for the tailing cursor, as a duration
    /// string such as `"100s"`. Invalid values fail `start`.
    pub cursor_timeout: String,
    /// Capacity of the op, error, and per-worker channels. Default 512.
    pub channel_size: usize,
    /// Ops staged per worker before a forced flush. Default 50.
    pub buffer_size: usize,
    /// Period of the worker flush tick. Default 750 ms.
    pub buffer_duration: Duration,
    /// Client-side idle window between control checks while the cursor has
    /// nothing to deliver. Default 5 s.
    pub eof_duration: Duration,
    /// Ordering guarantee for emitted ops. Default oplog order.
    pub ordering: OrderingGuarantee,
    /// Fetch workers. Forced to 1 under oplog ordering and 0 in delta
    /// mode.
    pub worker_count: usize,
    /// Emit raw update descriptors instead of post-images; bypasses the
    /// workers and enrichment.
    pub update_data_as_delta: bool,
    /// Namespaces to bulk-read before/alongside tailing.
    pub direct_read_ns: Vec<String>,
    /// Applied to direct-read ops before emission.
    pub direct_read_filter: Option<OpFilter>,
    /// Page size for single-threaded direct reads. Default 500.
    pub direct_read_batch_size: usize,
    /// Cursors requested from `parallelCollectionScan`. Default 10.
    pub direct_read_cursors: usize,
    /// Decodes raw documents into caller values.
    pub unmarshal: DataDecoder,
}

impl Options {
    #[must_use]
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Replaces zero/empty values with defaults and enforces the ordering
    /// invariants. Idempotent; called by `start`.
    pub fn set_defaults(&mut self) {
        let defaults = Options::default();
        if self.oplog_database_name.is_empty() {
            self.oplog_database_name = defaults.oplog_database_name;
        }
        if self.cursor_timeout.is_empty() {
            self.cursor_timeout = defaults.cursor_timeout;
        }
        if self.channel_size < 1 {
            self.channel_size = defaults.channel_size;
        }
        if self.buffer_size < 1 {
            self.buffer_size = defaults.buffer_size;
        }
        if self.buffer_duration.is_zero() {
            self.buffer_duration = defaults.buffer_duration;
        }
        if self.eof_duration.is_zero() {
            self.eof_duration = defaults.eof_duration;
        }
        if self.ordering == OrderingGuarantee::Oplog {
            self.worker_count = 1;
        }
        if self.worker_count < 1 {
            self.worker_count = 1;
        }
        if self.update_data_as_delta {
            self.ordering = OrderingGuarantee::Oplog;
            self.worker_count = 0;
        }
        if self.direct_read_batch_size < 1 {
            self.direct_read_batch_size = defaults.direct_read_batch_size;
        }
        if self.direct_read_cursors < 1 {
            self.direct_read_cursors = defaults.direct_read_cursors;
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            after: None,
            filter: None,
            namespace_filter: None,
            oplog_database_name: "local".to_string(),
            oplog_collection_name: None,
            cursor_timeout: "100s".to_string(),
            channel_size: 512,
            buffer_size: 50,
            buffer_duration: Duration::from_millis(750),
            eof_duration: Duration::from_secs(5),
            ordering: OrderingGuarantee::Oplog,
            worker_count: 1,
            update_data_as_delta: false,
            direct_read_ns: Vec::new(),
            direct_read_filter: None,
            direct_read_batch_size: 500,
            direct_read_cursors: 10,
            unmarshal: default_decoder(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("oplog_database_name", &self.oplog_database_name)
            .field("oplog_collection_name", &self.oplog_collection_name)
            .field("cursor_timeout", &self.cursor_timeout)
            .field("channel_size", &self.channel_size)
            .field("buffer_size", &self.buffer_size)
            .field("buffer_duration", &self.buffer_duration)
            .field("eof_duration", &self.eof_duration)
            .field("ordering", &self.ordering)
            .field("worker_count", &self.worker_count)
            .field("update_data_as_delta", &self.update_data_as_delta)
            .field("direct_read_ns", &self.direct_read_ns)
            .field("direct_read_batch_size", &self.direct_read_batch_size)
            .field("direct_read_cursors", &self.direct_read_cursors)
            .finish_non_exhaustive()
    }
}

/// The default decoder: the raw document itself.
fn default_decoder() -> DataDecoder {
    Arc::new(|_namespace: &str, raw: &Document| Ok(Bson::Document(raw.clone())))
}

/// Builder for [`Options`]. Every method mirrors a field; see the field
/// docs on [`Options`].
#[derive(Default)]
pub struct OptionsBuilder {
    options: Option<Options>,
}

impl OptionsBuilder {
    fn options(&mut self) -> &mut Options {
        self.options.get_or_insert_with(Options::default)
    }

    #[must_use]
    pub fn after(mut self, after: TimestampSource) -> Self {
        self.options().after = Some(after);
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: OpFilter) -> Self {
        self.options().filter = Some(filter);
        self
    }

    #[must_use]
    pub fn namespace_filter(mut self, filter: OpFilter) -> Self {
        self.options().namespace_filter = Some(filter);
        self
    }

    #[must_use]
    pub fn oplog_database_name(mut self, name: impl Into<String>) -> Self {
        self.options().oplog_database_name = name.into();
        self
    }

    #[must_use]
    pub fn oplog_collection_name(mut self, name: impl Into<String>) -> Self {
        self.options().oplog_collection_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn cursor_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.options().cursor_timeout = timeout.into();
        self
    }

    #[must_use]
    pub fn channel_size(mut self, size: usize) -> Self {
        self.options().channel_size = size;
        self
    }

    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.options().buffer_size = size;
        self
    }

    #[must_use]
    pub fn buffer_duration(mut self, duration: Duration) -> Self {
        self.options().buffer_duration = duration;
        self
    }

    #[must_use]
    pub fn eof_duration(mut self, duration: Duration) -> Self {
        self.options().eof_duration = duration;
        self
    }

    #[must_use]
    pub fn ordering(mut self, ordering: OrderingGuarantee) -> Self {
        self.options().ordering = ordering;
        self
    }

    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.options().worker_count = count;
        self
    }

    #[must_use]
    pub fn update_data_as_delta(mut self, delta: bool) -> Self {
        self.options().update_data_as_delta = delta;
        self
    }

    #[must_use]
    pub fn direct_read_ns(mut self, namespaces: Vec<String>) -> Self {
        self.options().direct_read_ns = namespaces;
        self
    }

    #[must_use]
    pub fn direct_read_filter(mut self, filter: OpFilter) -> Self {
        self.options().direct_read_filter = Some(filter);
        self
    }

    #[must_use]
    pub fn direct_read_batch_size(mut self, size: usize) -> Self {
        self.options().direct_read_batch_size = size;
        self
    }

    #[must_use]
    pub fn direct_read_cursors(mut self, cursors: usize) -> Self {
        self.options().direct_read_cursors = cursors;
        self
    }

    #[must_use]
    pub fn unmarshal(mut self, decoder: DataDecoder) -> Self {
        self.options().unmarshal = decoder;
        self
    }

    #[must_use]
    pub fn build(mut self) -> Options {
        self.options.take().unwrap_or_default()
    }
}

/// Parses duration strings of the form `100s`, `750ms`, `1.5m`, `2h`,
/// including concatenations like `1m30s`.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit after {rest:?}"))?;
        if digits == 0 {
            return Err(format!("expected a number at {rest:?}"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number {:?}", &rest[..digits]))?;
        let unit_len = rest[digits..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len() - digits);
        let unit = &rest[digits..digits + unit_len];
        let seconds_per_unit = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit {unit:?}")),
        };
        total += Duration::from_secs_f64(value * seconds_per_unit);
        rest = &rest[digits + unit_len..];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = Options::default();
        assert_eq!(options.oplog_database_name, "local");
        assert_eq!(options.cursor_timeout, "100s");
        assert_eq!(options.channel_size, 512);
        assert_eq!(options.buffer_size, 50);
        assert_eq!(options.buffer_duration, Duration::from_millis(750));
        assert_eq!(options.eof_duration, Duration::from_secs(5));
        assert_eq!(options.ordering, OrderingGuarantee::Oplog);
        assert_eq!(options.worker_count, 1);
        assert_eq!(options.direct_read_batch_size, 500);
        assert_eq!(options.direct_read_cursors, 10);
        assert!(!options.update_data_as_delta);
    }

    #[test]
    fn zero_values_are_normalized() {
        let mut options = Options::builder()
            .channel_size(0)
            .buffer_size(0)
            .buffer_duration(Duration::ZERO)
            .direct_read_batch_size(0)
            .direct_read_cursors(0)
            .build();
        options.set_defaults();
        assert_eq!(options.channel_size, 512);
        assert_eq!(options.buffer_size, 50);
        assert_eq!(options.buffer_duration, Duration::from_millis(750));
        assert_eq!(options.direct_read_batch_size, 500);
        assert_eq!(options.direct_read_cursors, 10);
    }

    #[test]
    fn oplog_ordering_forces_one_worker() {
        let mut options = Options::builder()
            .ordering(OrderingGuarantee::Oplog)
            .worker_count(8)
            .build();
        options.set_defaults();
        assert_eq!(options.worker_count, 1);
    }

    #[test]
    fn document_ordering_keeps_worker_count() {
        let mut options = Options::builder()
            .ordering(OrderingGuarantee::Document)
            .worker_count(8)
            .build();
        options.set_defaults();
        assert_eq!(options.worker_count, 8);
    }

    #[test]
    fn delta_mode_bypasses_workers() {
        let mut options = Options::builder()
            .ordering(OrderingGuarantee::Document)
            .worker_count(8)
            .update_data_as_delta(true)
            .build();
        options.set_defaults();
        assert_eq!(options.ordering, OrderingGuarantee::Oplog);
        assert_eq!(options.worker_count, 0);
    }

    #[test]
    fn set_defaults_is_idempotent() {
        let mut options = Options::default();
        options.set_defaults();
        let worker_count = options.worker_count;
        options.set_defaults();
        assert_eq!(options.worker_count, worker_count);
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(parse_duration("100s").unwrap(), Duration::from_secs(100));
        assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn bad_duration_strings_are_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("100").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }
}
