use crate::notification::EntityKind;
use std::time::Duration;
use thiserror::Error;

/// Monitor error types
///
/// Filter rejections are not errors and never show up here. Fetch failures are
/// reported by the fetch collaborators and turned into terminal cache failures.
#[derive(Error, Debug)]
pub enum MonitorError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON serialization error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Channel send error")]
	ChannelSend,

	#[error("Failed to send stop signal to monitor")]
	StopSignal,

	#[error("Monitor not initialized")]
	NotInitialized,

	#[error("Fetch failed: {kind:?} {id} - {cause}")]
	Fetch { kind: EntityKind, id: i64, cause: String },

	#[error("{kind:?} {id} not found")]
	NotFound { kind: EntityKind, id: i64 },

	#[error("Operation timeout: {operation} exceeded {timeout:?}")]
	Timeout { operation: String, timeout: Duration },

	#[error("Configuration error: {parameter} - {reason}")]
	Configuration { parameter: String, reason: String },

	#[error("Invalid notification: {reason}")]
	InvalidNotification { reason: String },

	#[error("Recovery failed: {operation} after {attempts} attempts - {last_error}")]
	RecoveryFailed {
		operation: String,
		attempts: u32,
		last_error: String,
	},
}

/// Error recovery configuration used by retrying fetch collaborators
#[derive(Debug, Clone)]
pub struct ErrorRecoveryConfig {
	/// Maximum number of retry attempts for recoverable errors
	pub max_retries: u32,
	/// Initial retry delay
	pub initial_retry_delay: Duration,
	/// Maximum retry delay (for exponential backoff)
	pub max_retry_delay: Duration,
	/// Exponential backoff multiplier
	pub backoff_multiplier: f64,
	/// Whether to enable exponential backoff
	pub exponential_backoff: bool,
}

impl Default for ErrorRecoveryConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_retry_delay: Duration::from_millis(100),
			max_retry_delay: Duration::from_secs(30),
			backoff_multiplier: 2.0,
			exponential_backoff: true,
		}
	}
}

impl ErrorRecoveryConfig {
	/// Calculate the delay for a given retry attempt
	pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
		if !self.exponential_backoff {
			return self.initial_retry_delay;
		}

		let delay_ms = self.initial_retry_delay.as_millis() as f64
			* self.backoff_multiplier.powi(attempt as i32);

		let delay = Duration::from_millis(delay_ms as u64);
		std::cmp::min(delay, self.max_retry_delay)
	}
}

impl MonitorError {
	/// Check if this error indicates that the operation should be retried
	pub fn is_retryable(&self) -> bool {
		match self {
			MonitorError::Io(io_err) => matches!(
				io_err.kind(),
				std::io::ErrorKind::TimedOut
					| std::io::ErrorKind::ConnectionRefused
					| std::io::ErrorKind::ConnectionAborted
					| std::io::ErrorKind::Interrupted
					| std::io::ErrorKind::WouldBlock
			),
			MonitorError::Fetch { .. } => true,
			MonitorError::Timeout { .. } => true,
			MonitorError::ChannelSend => true,

			// The entity is gone server-side, asking again will not help
			MonitorError::NotFound { .. } => false,
			MonitorError::StopSignal => false,
			MonitorError::NotInitialized => false,
			MonitorError::Configuration { .. } => false,
			MonitorError::InvalidNotification { .. } => false,
			MonitorError::Json(_) => false,
			MonitorError::RecoveryFailed { .. } => false,
		}
	}

	/// Check if this error is related to configuration issues
	pub fn is_configuration_error(&self) -> bool {
		matches!(self, MonitorError::Configuration { .. })
	}

	/// Get error category for logging and metrics
	pub fn category(&self) -> &'static str {
		match self {
			MonitorError::Io(_) => "io",
			MonitorError::Json(_) => "serialization",
			MonitorError::ChannelSend => "channel",
			MonitorError::StopSignal => "shutdown",
			MonitorError::NotInitialized => "initialization",
			MonitorError::Fetch { .. } => "fetch",
			MonitorError::NotFound { .. } => "not_found",
			MonitorError::Timeout { .. } => "timeout",
			MonitorError::Configuration { .. } => "configuration",
			MonitorError::InvalidNotification { .. } => "notification",
			MonitorError::RecoveryFailed { .. } => "recovery",
		}
	}

	/// Create a fetch error for an entity
	pub fn fetch_failed(kind: EntityKind, id: i64, cause: &str) -> Self {
		MonitorError::Fetch { kind, id, cause: cause.to_string() }
	}

	/// Create a timeout error
	pub fn timeout(operation: &str, timeout: Duration) -> Self {
		MonitorError::Timeout { operation: operation.to_string(), timeout }
	}

	/// Create a configuration error
	pub fn configuration_error(parameter: &str, reason: &str) -> Self {
		MonitorError::Configuration {
			parameter: parameter.to_string(),
			reason: reason.to_string(),
		}
	}

	/// Create an invalid notification error
	pub fn invalid_notification(reason: &str) -> Self {
		MonitorError::InvalidNotification { reason: reason.to_string() }
	}
}

pub type Result<T> = std::result::Result<T, MonitorError>;
