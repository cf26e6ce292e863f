//! Retry policy and error classification
//!
//! Every outbound cloud call is wrapped by a policy keyed on the operation's
//! idempotence class. Backoff is exponential from 250 ms to 30 s with ±20 %
//! jitter, bounded by 8 attempts or the caller's deadline.

use super::api::CloudError;
use crate::error::Error;
use backoff::ExponentialBackoff;
use reqwest::StatusCode;
use std::time::Duration;

/// Base delay before the first retry
pub const RETRY_BASE: Duration = Duration::from_millis(250);
/// Delay ceiling
pub const RETRY_CAP: Duration = Duration::from_secs(30);
/// Attempt ceiling per call
pub const MAX_ATTEMPTS: u32 = 8;
/// Window in which a 404 on a read is assumed to be eventual consistency
pub const EVENTUAL_CONSISTENCY_WINDOW: Duration = Duration::from_secs(15);

/// Idempotence class of a cloud operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Safe to repeat; 404s are retried inside the consistency window
    IdempotentRead,
    /// Write carrying a client token; duplicates collapse server-side
    TokenedWrite,
    /// Write that may not be repeated once the server has seen it
    NonIdempotentWrite,
}

/// Backoff schedule for one call, capped by the remaining deadline.
pub fn backoff_policy(remaining: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: RETRY_BASE,
        max_interval: RETRY_CAP,
        multiplier: 2.0,
        randomization_factor: 0.2,
        max_elapsed_time: Some(remaining),
        ..ExponentialBackoff::default()
    }
}

/// Whether a failed attempt may be retried under the given class.
///
/// Conflicts (409/412) are never retried here: the caller must refresh its
/// etag and decide. Non-idempotent writes retry only when the request
/// demonstrably never reached the server.
pub fn should_retry(class: CallClass, err: &CloudError, elapsed: Duration) -> bool {
    if err.is_conflict() {
        return false;
    }
    match class {
        CallClass::IdempotentRead | CallClass::TokenedWrite => {
            if err.status.is_none() || err.is_throttle() || err.is_server_error() {
                return true;
            }
            if err.is_not_found() && class == CallClass::IdempotentRead {
                return elapsed < EVENTUAL_CONSISTENCY_WINDOW;
            }
            false
        }
        CallClass::NonIdempotentWrite => {
            (err.status.is_none() || err.is_server_error()) && !err.received_by_server()
        }
    }
}

/// Map a terminally failed attempt to the operator error kind.
///
/// `kind` and `name` identify the resource the call was about, so NotFound
/// and AlreadyExists stay actionable for the caller.
pub fn classify(err: CloudError, kind: &str, name: &str) -> Error {
    let CloudError {
        status,
        code,
        message,
        request_id,
    } = err;

    let status = match status {
        None => {
            return Error::TryAgain {
                message,
                request_id,
            }
        }
        Some(s) => s,
    };

    match status {
        StatusCode::NOT_FOUND => Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Forbidden {
            message,
            request_id,
        },
        StatusCode::CONFLICT => {
            if code.as_deref() == Some("AlreadyExists") {
                Error::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            } else {
                Error::Conflict { message }
            }
        }
        StatusCode::PRECONDITION_FAILED => Error::Conflict { message },
        StatusCode::TOO_MANY_REQUESTS => {
            if matches!(code.as_deref(), Some("LimitExceeded") | Some("QuotaExceeded")) {
                Error::QuotaExceeded {
                    message,
                    request_id,
                }
            } else {
                Error::TryAgain {
                    message,
                    request_id,
                }
            }
        }
        StatusCode::BAD_REQUEST => Error::InvalidConfiguration(message),
        s if s.is_server_error() => Error::TryAgain {
            message,
            request_id,
        },
        _ => Error::TryAgain {
            message,
            request_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_reads_retry_transient() {
        let class = CallClass::IdempotentRead;
        assert!(should_retry(class, &CloudError::transport("reset"), Duration::ZERO));
        assert!(should_retry(
            class,
            &CloudError::http(StatusCode::SERVICE_UNAVAILABLE, None, ""),
            Duration::ZERO
        ));
        assert!(should_retry(
            class,
            &CloudError::http(StatusCode::TOO_MANY_REQUESTS, None, ""),
            Duration::ZERO
        ));
    }

    #[test]
    fn test_read_404_retries_only_inside_window() {
        let nf = CloudError::not_found("lb not visible yet");
        assert!(should_retry(CallClass::IdempotentRead, &nf, Duration::from_secs(5)));
        assert!(!should_retry(
            CallClass::IdempotentRead,
            &nf,
            Duration::from_secs(20)
        ));
        assert!(!should_retry(CallClass::TokenedWrite, &nf, Duration::ZERO));
    }

    #[test]
    fn test_non_idempotent_write_gated_on_server_receipt() {
        let class = CallClass::NonIdempotentWrite;
        assert!(should_retry(class, &CloudError::transport("refused"), Duration::ZERO));

        // 500 with an echoed request id means the server saw it.
        let seen = CloudError::http(StatusCode::INTERNAL_SERVER_ERROR, None, "boom")
            .with_request_id("req-9");
        assert!(!should_retry(class, &seen, Duration::ZERO));
    }

    #[test]
    fn test_conflict_never_retried() {
        for class in [
            CallClass::IdempotentRead,
            CallClass::TokenedWrite,
            CallClass::NonIdempotentWrite,
        ] {
            assert!(!should_retry(
                class,
                &CloudError::precondition_failed("etag moved"),
                Duration::ZERO
            ));
        }
    }

    #[test]
    fn test_classification() {
        assert_matches!(
            classify(CloudError::not_found(""), "Volume", "v1"),
            Error::NotFound { kind, name } if kind == "Volume" && name == "v1"
        );
        assert_matches!(
            classify(CloudError::precondition_failed("etag"), "SecurityList", "sl"),
            Error::Conflict { .. }
        );
        assert_matches!(
            classify(
                CloudError::http(StatusCode::TOO_MANY_REQUESTS, Some("LimitExceeded"), "quota"),
                "LoadBalancer",
                "lb"
            ),
            Error::QuotaExceeded { .. }
        );
        assert_matches!(
            classify(
                CloudError::http(StatusCode::FORBIDDEN, None, "policy").with_request_id("r"),
                "LoadBalancer",
                "lb"
            ),
            Error::Forbidden { request_id: Some(r), .. } if r == "r"
        );
        assert_matches!(
            classify(CloudError::transport("refused"), "Instance", "i"),
            Error::TryAgain { .. }
        );
    }
}
