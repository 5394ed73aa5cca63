/// Delay before retry `attempt` of an immediate send (attempts count from 1).
///
/// `base_ms * 2^(attempt-1)`, saturating. Attempt 0 is treated as 1.
pub fn exponential_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(63);
    base_ms.saturating_mul(1_u64 << exp)
}
