//! Metric names shared by the router and the transport layer.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

/// Transport connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "parley_ws_connections_total";
/// Transport connections closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "parley_ws_disconnections_total";
/// Open transport connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "parley_ws_connections_active";
/// Connections refused at the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "parley_ws_connections_rejected_total";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "parley_ws_connection_duration_seconds";
/// Registered clients (gauge).
pub const CLIENTS_REGISTERED: &str = "parley_clients_registered";
/// Live calls (gauge).
pub const CALLS_ACTIVE: &str = "parley_calls_active";
/// Calls requested and accepted into the store (counter).
pub const CALLS_STARTED_TOTAL: &str = "parley_calls_started_total";
/// Calls accepted by the receiver (counter).
pub const CALLS_CONNECTED_TOTAL: &str = "parley_calls_connected_total";
/// Calls ended (counter, labels: reason).
pub const CALLS_ENDED_TOTAL: &str = "parley_calls_ended_total";
/// Call requests that failed (counter, labels: reason).
pub const CALLS_FAILED_TOTAL: &str = "parley_calls_failed_total";
/// Connected call duration in seconds (histogram).
pub const CALL_DURATION_SECONDS: &str = "parley_call_duration_seconds";
/// Inbound messages handled (counter, labels: type).
pub const MESSAGES_RECEIVED_TOTAL: &str = "parley_messages_received_total";
/// Media negotiation messages relayed (counter, labels: type).
pub const MESSAGES_FORWARDED_TOTAL: &str = "parley_messages_forwarded_total";
/// Messages that could not be delivered (counter, labels: reason).
pub const MESSAGES_DROPPED_TOTAL: &str = "parley_messages_dropped_total";
