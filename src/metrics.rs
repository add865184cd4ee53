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

//! Metrics instrumentation.
//!
//! Uses the `metrics` facade so any exporter works. Names follow
//! Prometheus conventions under an `optail_` prefix. Labels stay
//! low-cardinality: operation codes, op sources, and error categories
//! only — never namespaces or ids.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Ops delivered on the output channel.
///
/// Counter. Labels: `source`, `operation`.
pub const OPS_EMITTED_TOTAL: &str = "optail_ops_emitted_total";

/// Errors delivered on the error channel.
///
/// Counter. Labels: `category`.
pub const ERRORS_TOTAL: &str = "optail_errors_total";

/// Completed waits for the connection to come back.
///
/// Counter. No labels.
pub const RECONNECTS_TOTAL: &str = "optail_reconnects_total";

/// Worker buffer flushes.
///
/// Counter. Labels: `trigger` (`tick` or `size`).
pub const BUFFER_FLUSHES_TOTAL: &str = "optail_buffer_flushes_total";

/// Wall time of a worker buffer flush, including the enrichment fetch.
///
/// Histogram, seconds.
pub const BUFFER_FLUSH_DURATION_SECONDS: &str = "optail_buffer_flush_duration_seconds";

/// Registers descriptions with the installed recorder. Optional; call once
/// after installing an exporter.
pub fn describe() {
    describe_counter!(OPS_EMITTED_TOTAL, "Ops delivered on the output channel");
    describe_counter!(ERRORS_TOTAL, "Errors delivered on the error channel");
    describe_counter!(
        RECONNECTS_TOTAL,
        "Completed waits for the connection to come back"
    );
    describe_counter!(BUFFER_FLUSHES_TOTAL, "Worker buffer flushes");
    describe_histogram!(
        BUFFER_FLUSH_DURATION_SECONDS,
        "Wall time of a worker buffer flush in seconds"
    );
}

pub(crate) fn record_op_emitted(source: &'static str, operation: &'static str) {
    counter!(OPS_EMITTED_TOTAL, "source" => source, "operation" => operation).increment(1);
}

pub(crate) fn record_error(category: &'static str) {
    counter!(ERRORS_TOTAL, "category" => category).increment(1);
}

pub(crate) fn record_reconnect() {
    counter!(RECONNECTS_TOTAL).increment(1);
}

pub(crate) fn record_buffer_flush(trigger: &'static str, seconds: f64) {
    counter!(BUFFER_FLUSHES_TOTAL, "trigger" => trigger).increment(1);
    histogram!(BUFFER_FLUSH_DURATION_SECONDS).record(seconds);
}
