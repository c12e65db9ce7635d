//! ringway runtime metrics.
//!
//! Counters for ring utilization and cancellation, exposed through the
//! metriken registry for whatever exposition layer the embedding
//! application runs.

use metriken::{Counter, metric};

#[metric(
    name = "ringway/sqe/pushed",
    description = "Total SQEs pushed to the submission queue"
)]
pub static SQE_PUSHED: Counter = Counter::new();

#[metric(
    name = "ringway/sq/full_recoveries",
    description = "SQ-full events recovered by flushing to the kernel"
)]
pub static SQ_FULL_RECOVERIES: Counter = Counter::new();

#[metric(
    name = "ringway/cqe/processed",
    description = "Total CQEs processed by the run loop"
)]
pub static CQE_PROCESSED: Counter = Counter::new();

#[metric(
    name = "ringway/ops/cancelled",
    description = "Operations cancelled before their completion arrived"
)]
pub static OPS_CANCELLED: Counter = Counter::new();
