use std::time::Duration;

use crate::api::ApiError;

/// Retry cap per individual portal call.
pub const MAX_RETRIES: u32 = 3;

/// Delay schedule for rate-limit (and timeout) retries, indexed by attempt.
const RATE_LIMIT_BACKOFF_MS: &[u64] = &[2_000, 5_000, 10_000];

const OVERLOAD_BACKOFF_STEP_MS: u64 = 15_000;
const OVERLOAD_BACKOFF_CAP_MS: u64 = 60_000;

/// What a failed portal call means for retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 409/429: the portal is throttling us. Retry on the fixed schedule.
    RateLimited,
    /// 503: the portal is shedding load. Retry with longer, growing delays.
    Overloaded,
    /// 401/403: the token is bad or expired. Never retried.
    AuthFailure,
    /// 404: nothing to fetch for this call. Never retried.
    NotFound,
    /// The call (or a broken connection) expired. Retried like a rate limit.
    Timeout,
    /// Any other 4xx: the request itself is wrong. Never retried.
    FatalClient,
    /// Any other 5xx, or an undecodable body. Never retried.
    FatalServer,
}

pub fn classify(e: &ApiError) -> ErrorClass {
    match e {
        ApiError::Status { status, .. } => match status {
            409 | 429 => ErrorClass::RateLimited,
            503 => ErrorClass::Overloaded,
            401 | 403 => ErrorClass::AuthFailure,
            404 => ErrorClass::NotFound,
            400..=499 => ErrorClass::FatalClient,
            _ => ErrorClass::FatalServer,
        },
        ApiError::Timeout | ApiError::Transport(_) => ErrorClass::Timeout,
        ApiError::Decode(_) | ApiError::Url(_) => ErrorClass::FatalServer,
    }
}

pub fn is_retryable(class: ErrorClass) -> bool {
    matches!(
        class,
        ErrorClass::RateLimited | ErrorClass::Overloaded | ErrorClass::Timeout
    )
}

/// Delay before retry number `attempt` (0-based) for a retryable class.
/// Non-retryable classes fall back to the rate-limit schedule; the
/// pagination driver uses that as its between-failures wait.
pub fn backoff_delay(class: ErrorClass, attempt: u32) -> Duration {
    let ms = match class {
        ErrorClass::Overloaded => {
            (OVERLOAD_BACKOFF_STEP_MS * (attempt as u64 + 1)).min(OVERLOAD_BACKOFF_CAP_MS)
        }
        _ => RATE_LIMIT_BACKOFF_MS
            .get(attempt as usize)
            .copied()
            .unwrap_or(RATE_LIMIT_BACKOFF_MS[RATE_LIMIT_BACKOFF_MS.len() - 1]),
    };
    Duration::from_millis(ms)
}

/// Retry a portal call expression with class-aware bounded backoff.
///
/// Usage: `retry_api!(client.fetch_page(token, search, page, state))`
///
/// The expression is re-evaluated on each attempt, so every retry goes
/// back through the scheduler. This is a macro because async closures
/// that return borrowed futures can't satisfy `Fn`. The attempt counter
/// is an explicit loop variable; retries never recurse.
macro_rules! retry_api {
    ($expr:expr) => {{
        let mut _attempt: u32 = 0;
        loop {
            match $expr.await {
                Ok(val) => break Ok(val),
                Err(e) => {
                    let class = $crate::sync::retry::classify(&e);
                    if $crate::sync::retry::is_retryable(class)
                        && _attempt < $crate::sync::retry::MAX_RETRIES
                    {
                        let wait = $crate::sync::retry::backoff_delay(class, _attempt);
                        log::warn!(
                            "{class:?} from portal, waiting {}ms before retry {}/{}",
                            wait.as_millis(),
                            _attempt + 1,
                            $crate::sync::retry::MAX_RETRIES
                        );
                        tokio::time::sleep(wait).await;
                        _attempt += 1;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

pub(crate) use retry_api;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ApiError {
        ApiError::Status {
            status: code,
            message: String::new(),
        }
    }

    #[test]
    fn classification_covers_the_full_taxonomy() {
        assert_eq!(classify(&status(429)), ErrorClass::RateLimited);
        assert_eq!(classify(&status(409)), ErrorClass::RateLimited);
        assert_eq!(classify(&status(503)), ErrorClass::Overloaded);
        assert_eq!(classify(&status(401)), ErrorClass::AuthFailure);
        assert_eq!(classify(&status(403)), ErrorClass::AuthFailure);
        assert_eq!(classify(&status(404)), ErrorClass::NotFound);
        assert_eq!(classify(&status(400)), ErrorClass::FatalClient);
        assert_eq!(classify(&status(422)), ErrorClass::FatalClient);
        assert_eq!(classify(&status(500)), ErrorClass::FatalServer);
        assert_eq!(classify(&status(502)), ErrorClass::FatalServer);
        assert_eq!(classify(&ApiError::Timeout), ErrorClass::Timeout);
        assert_eq!(
            classify(&ApiError::Transport("reset".into())),
            ErrorClass::Timeout
        );
        assert_eq!(
            classify(&ApiError::Decode("bad".into())),
            ErrorClass::FatalServer
        );
    }

    #[test]
    fn only_transient_classes_are_retryable() {
        assert!(is_retryable(ErrorClass::RateLimited));
        assert!(is_retryable(ErrorClass::Overloaded));
        assert!(is_retryable(ErrorClass::Timeout));
        assert!(!is_retryable(ErrorClass::AuthFailure));
        assert!(!is_retryable(ErrorClass::NotFound));
        assert!(!is_retryable(ErrorClass::FatalClient));
        assert!(!is_retryable(ErrorClass::FatalServer));
    }

    #[test]
    fn rate_limit_backoff_is_monotonic_and_capped() {
        let mut prev = Duration::ZERO;
        for attempt in 0..5 {
            let d = backoff_delay(ErrorClass::RateLimited, attempt);
            assert!(d >= prev, "delay shrank at attempt {attempt}");
            prev = d;
        }
        assert_eq!(
            backoff_delay(ErrorClass::RateLimited, 0),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff_delay(ErrorClass::RateLimited, 1),
            Duration::from_secs(5)
        );
        assert_eq!(
            backoff_delay(ErrorClass::RateLimited, 2),
            Duration::from_secs(10)
        );
        // Past the schedule the last step repeats.
        assert_eq!(
            backoff_delay(ErrorClass::RateLimited, 9),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn overload_backoff_grows_linearly_to_a_cap() {
        assert_eq!(
            backoff_delay(ErrorClass::Overloaded, 0),
            Duration::from_secs(15)
        );
        assert_eq!(
            backoff_delay(ErrorClass::Overloaded, 1),
            Duration::from_secs(30)
        );
        assert_eq!(
            backoff_delay(ErrorClass::Overloaded, 2),
            Duration::from_secs(45)
        );
        assert_eq!(
            backoff_delay(ErrorClass::Overloaded, 3),
            Duration::from_secs(60)
        );
        assert_eq!(
            backoff_delay(ErrorClass::Overloaded, 10),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn timeout_follows_the_rate_limit_schedule() {
        for attempt in 0..3 {
            assert_eq!(
                backoff_delay(ErrorClass::Timeout, attempt),
                backoff_delay(ErrorClass::RateLimited, attempt)
            );
        }
    }
}
