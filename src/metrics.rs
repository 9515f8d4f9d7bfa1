//! Runtime counters and gauges.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "accept_errors", description = "Accept calls that failed")]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(
    name = "fd_exhaustion_sheds",
    description = "Connections accepted and immediately closed after EMFILE"
)]
pub static FD_EXHAUSTION_SHEDS: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Total bytes read from peers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to peers")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups delivered through the eventfd"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Timer callbacks executed")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(name = "http_requests", description = "Complete HTTP requests parsed")]
pub static HTTP_REQUESTS: Counter = Counter::new();

#[metric(
    name = "http_protocol_errors",
    description = "Malformed HTTP requests answered with 400"
)]
pub static HTTP_PROTOCOL_ERRORS: Counter = Counter::new();
