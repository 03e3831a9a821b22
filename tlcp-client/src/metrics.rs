//! Client metrics definitions
//!
//! OpenTelemetry instruments describing the health of one client. They are
//! exported through whatever meter provider `init_observability` installed;
//! without one, recording is a no-op.
//!
//! # Metrics Collected
//!
//! - **tlcp.client.status**: current client status (gauge, see [`status_code`])
//! - **tlcp.client.sessions.created**: sessions created (counter)
//! - **tlcp.client.recoveries**: recovery attempts (counter)
//! - **tlcp.client.control.sent**: control requests written (counter)
//! - **tlcp.client.retransmissions**: control requests sent again (counter)
//! - **tlcp.client.updates.received**: `U` notifications delivered (counter)
//! - **tlcp.client.server.errors**: server-declared errors (counter)
//! - **tlcp.client.batch.size**: requests per HTTP control batch (histogram)

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};
use tlcp_core::ClientStatus;

/// Numeric value of a status for the status gauge
pub fn status_code(status: ClientStatus) -> i64 {
    match status {
        ClientStatus::Disconnected => 0,
        ClientStatus::Connecting => 1,
        ClientStatus::StreamSensing => 2,
        ClientStatus::Connected(_) => 3,
        ClientStatus::Stalled => 4,
        ClientStatus::TryingRecovery => 5,
        ClientStatus::WillRetry => 6,
    }
}

/// Client metrics for monitoring
pub struct ClientMetrics {
    pub status: Gauge<i64>,
    pub sessions_created: Counter<u64>,
    pub recoveries: Counter<u64>,
    pub control_sent: Counter<u64>,
    pub retransmissions: Counter<u64>,
    pub updates_received: Counter<u64>,
    pub server_errors: Counter<u64>,
    pub batch_size: Histogram<u64>,
}

impl ClientMetrics {
    /// Instruments on the global meter named `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            status: meter
                .i64_gauge("tlcp.client.status")
                .with_description("Client status (0=disconnected, 1=connecting, 2=stream-sensing, 3=connected, 4=stalled, 5=trying-recovery, 6=will-retry)")
                .build(),
            sessions_created: meter
                .u64_counter("tlcp.client.sessions.created")
                .with_description("Sessions created")
                .build(),
            recoveries: meter
                .u64_counter("tlcp.client.recoveries")
                .with_description("Session recovery attempts")
                .build(),
            control_sent: meter
                .u64_counter("tlcp.client.control.sent")
                .with_description("Control requests written to a transport")
                .build(),
            retransmissions: meter
                .u64_counter("tlcp.client.retransmissions")
                .with_description("Control requests retransmitted")
                .build(),
            updates_received: meter
                .u64_counter("tlcp.client.updates.received")
                .with_description("Update notifications delivered")
                .build(),
            server_errors: meter
                .u64_counter("tlcp.client.server.errors")
                .with_description("Errors declared by the server")
                .build(),
            batch_size: meter
                .u64_histogram("tlcp.client.batch.size")
                .with_description("Requests per HTTP control batch")
                .build(),
        }
    }

    pub fn record_status(&self, status: ClientStatus) {
        self.status.record(
            status_code(status),
            &[KeyValue::new("status", status.as_str())],
        );
    }

    pub fn record_session_created(&self, transport: &str) {
        self.sessions_created
            .add(1, &[KeyValue::new("transport", transport.to_string())]);
    }

    pub fn record_recovery(&self) {
        self.recoveries.add(1, &[]);
    }

    /// A control request of kind `name` went on the wire
    pub fn record_control_sent(&self, name: &'static str) {
        self.control_sent.add(1, &[KeyValue::new("request", name)]);
    }

    pub fn record_retransmission(&self, name: &'static str) {
        self.retransmissions.add(1, &[KeyValue::new("request", name)]);
    }

    pub fn record_update(&self) {
        self.updates_received.add(1, &[]);
    }

    pub fn record_server_error(&self, code: i32) {
        self.server_errors.add(1, &[KeyValue::new("code", code as i64)]);
    }

    pub fn record_batch(&self, size: u64) {
        self.batch_size.record(size, &[]);
    }
}
