use pds_core::types::ErrorClass;
use rand::Rng;
use std::time::Duration;

/// What the Processor should do after a job attempt fails.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    /// REUPLOAD_NEEDED crossed its retry-vs-convert threshold: keep
    /// retrying, but first flip the job to DELETE_AND_CREATE.
    ConvertAndRetry(Duration),
    Block,
}

const MINUTE: u64 = 60;

/// §4.4's error classification table, translated into a concrete delay or
/// a block decision. `rate_limit_hint_secs` is the server-provided
/// `Retry-After`, when the failure carried one.
pub fn decide(
    class: ErrorClass,
    n_retries: i64,
    rate_limit_hint_secs: Option<u64>,
) -> RetryDecision {
    match class {
        ErrorClass::TransientNetwork => {
            RetryDecision::Retry(jittered(exp_backoff_secs(n_retries, 5 * MINUTE)))
        }
        ErrorClass::RateLimited => {
            let secs = rate_limit_hint_secs.unwrap_or(30);
            RetryDecision::Retry(Duration::from_secs(secs))
        }
        ErrorClass::ReuploadNeeded => {
            if n_retries >= 5 {
                RetryDecision::Block
            } else {
                let delay = jittered(exp_backoff_secs(n_retries, 2 * MINUTE));
                if n_retries >= 2 {
                    RetryDecision::ConvertAndRetry(delay)
                } else {
                    RetryDecision::Retry(delay)
                }
            }
        }
        ErrorClass::ClientState => {
            if n_retries >= 3 {
                RetryDecision::Block
            } else {
                RetryDecision::Retry(Duration::from_secs(5))
            }
        }
        ErrorClass::Permanent => RetryDecision::Block,
    }
}

/// `exp(2^n * 1s)`, capped at `cap_secs`.
fn exp_backoff_secs(n_retries: i64, cap_secs: u64) -> Duration {
    let n = n_retries.max(0).min(20) as u32;
    let secs = 2u64.saturating_pow(n).min(cap_secs);
    Duration::from_secs(secs.min(cap_secs))
}

/// ±20% jitter.
fn jittered(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
