pub mod aggregator;
pub mod client;
pub mod connection;
pub mod coordinator;
pub mod types;

pub const CURRENT_STATE_EVENT: &str = "current_state";
pub const CONNECTION_STATE_EVENT: &str = "connection_state";
pub const SYSTEM_ALERT_EVENT: &str = "system_alert";
pub const DIAGNOSTIC_EVENT: &str = "diagnostic";

#[cfg(test)]
pub(crate) mod test_support;
