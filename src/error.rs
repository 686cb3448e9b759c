//! Shared error taxonomy and retry policy.
//!
//! Every remote-write path in the core goes through the same classification:
//! validation and auth failures surface immediately with a localized message,
//! transport failures pass through a bounded backoff before surfacing. Each error carries a stable machine code for the frontend.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Error types
// ═══════════════════════════════════════════════════════════

/// Transport failure categories considered transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
}

impl TransportKind {
    fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Unavailable => "unavailable",
            TransportKind::DeadlineExceeded => "deadline-exceeded",
            TransportKind::ResourceExhausted => "resource-exhausted",
            TransportKind::Aborted => "aborted",
        }
    }
}

/// Core error taxonomy shared by every remote read/write path.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Not authenticated: {0}")]
    Auth(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport failure ({}): {message}", kind.as_str())]
    Transport { kind: TransportKind, message: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CoreError {
    /// Convenience constructor for validation failures.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for transport failures.
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        CoreError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Whether a retry can plausibly succeed. Validation, auth, permission
    /// and not-found failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transport { .. } | CoreError::Unknown(_))
    }

    /// Stable machine code consumed by the frontend.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "VALIDATION",
            CoreError::Auth(_) => "AUTH_REQUIRED",
            CoreError::Permission(_) => "PERMISSION_DENIED",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Transport { .. } => "TRANSPORT",
            CoreError::Unknown(_) => "UNKNOWN",
        }
    }

    /// User-facing message shown by the app (Spanish-language product).
    pub fn user_message(&self) -> String {
        match self {
            CoreError::Validation { message, .. } => {
                format!("Datos no válidos: {message}")
            }
            CoreError::Auth(_) => "Debes iniciar sesión para continuar.".into(),
            CoreError::Permission(_) => {
                "No tienes permiso para realizar esta acción.".into()
            }
            CoreError::NotFound(_) => "No se encontró el recurso solicitado.".into(),
            CoreError::Transport { .. } => {
                "No se pudo conectar con el dispositivo. Inténtalo de nuevo.".into()
            }
            CoreError::Unknown(_) => "Ocurrió un error inesperado.".into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Retry policy
// ═══════════════════════════════════════════════════════════

/// Bounded linear-growth backoff: delay = base_delay × attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleep between attempts, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before re-running after the given 1-based attempt number.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Run `op` under the policy. Non-retryable errors surface immediately;
/// retryable errors are re-attempted with backoff until attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!(
                    code = err.code(),
                    attempts = attempt,
                    "remote operation failed after retries: {err}"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    code = err.code(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable failure, backing off: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
