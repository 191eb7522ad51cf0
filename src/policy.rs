use alloy::primitives::U256;
use std::time::Duration;
use tokio::time::Instant;

/// Why the policy did or did not fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// A previous transfer has not settled yet
    InFlight,
    /// The last top-up is more recent than the cooldown
    CoolingDown { remaining: Duration },
    /// Balance is at or above the threshold
    AboveThreshold,
    /// Balance is strictly below the threshold and nothing blocks a top-up
    BelowThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopUpDecision {
    pub trigger: bool,
    /// Always the configured top-up amount
    pub amount: U256,
    pub reason: DecisionReason,
}

/// Inputs to a single decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInput {
    pub current_balance: U256,
    pub threshold: U256,
    pub top_up_amount: U256,
    pub now: Instant,
    pub last_top_up: Option<Instant>,
    pub cooldown: Duration,
    pub in_flight: bool,
}

/// Decide whether to top up. Pure: no I/O, no clock reads.
///
/// `trigger = !in_flight && cooldown elapsed && balance < threshold`. The
/// amount is the fixed top-up amount, never "raise to threshold". A zero
/// amount still triggers; amounts are validated at configuration intake.
pub fn decide(input: &PolicyInput) -> TopUpDecision {
    let hold = |reason| TopUpDecision {
        trigger: false,
        amount: input.top_up_amount,
        reason,
    };

    if input.in_flight {
        return hold(DecisionReason::InFlight);
    }

    if let Some(last) = input.last_top_up {
        let elapsed = input.now.saturating_duration_since(last);
        if elapsed < input.cooldown {
            return hold(DecisionReason::CoolingDown {
                remaining: input.cooldown - elapsed,
            });
        }
    }

    if input.current_balance >= input.threshold {
        return hold(DecisionReason::AboveThreshold);
    }

    TopUpDecision {
        trigger: true,
        amount: input.top_up_amount,
        reason: DecisionReason::BelowThreshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC: u64 = 1_000_000;

    fn input(balance: u64) -> PolicyInput {
        // Offset so subtracting cooldown windows never underflows the clock
        let now = Instant::now() + Duration::from_secs(3600);
        PolicyInput {
            current_balance: U256::from(balance),
            threshold: U256::from(USDC),
            top_up_amount: U256::from(USDC),
            now,
            last_top_up: None,
            cooldown: Duration::from_secs(30),
            in_flight: false,
        }
    }

    #[test]
    fn test_triggers_below_threshold() {
        // 0.5 USDC against a 1 USDC threshold
        let decision = decide(&input(USDC / 2));
        assert!(decision.trigger);
        assert_eq!(decision.amount, U256::from(1_000_000u64));
        assert_eq!(decision.reason, DecisionReason::BelowThreshold);
    }

    #[test]
    fn test_in_flight_blocks_trigger() {
        let mut input = input(USDC / 2);
        input.in_flight = true;

        let decision = decide(&input);
        assert!(!decision.trigger);
        assert_eq!(decision.reason, DecisionReason::InFlight);
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        let decision = decide(&input(USDC));
        assert!(!decision.trigger);
        assert_eq!(decision.reason, DecisionReason::AboveThreshold);

        assert!(decide(&input(USDC - 1)).trigger);
    }

    #[test]
    fn test_cooldown_blocks_regardless_of_balance() {
        for balance in [0, 1, USDC / 2, USDC - 1] {
            let mut input = input(balance);
            input.last_top_up = Some(input.now - Duration::from_secs(10));

            let decision = decide(&input);
            assert!(!decision.trigger, "balance {balance} triggered during cooldown");
            assert_eq!(
                decision.reason,
                DecisionReason::CoolingDown {
                    remaining: Duration::from_secs(20)
                }
            );
        }
    }

    #[test]
    fn test_cooldown_elapsed_exactly_allows_trigger() {
        let mut input = input(0);
        input.last_top_up = Some(input.now - Duration::from_secs(30));
        assert!(decide(&input).trigger);
    }

    #[test]
    fn test_zero_amount_still_triggers() {
        let mut input = input(0);
        input.top_up_amount = U256::ZERO;

        let decision = decide(&input);
        assert!(decision.trigger);
        assert_eq!(decision.amount, U256::ZERO);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let mut input = input(USDC / 4);
        input.last_top_up = Some(input.now - Duration::from_secs(45));

        let first = decide(&input);
        for _ in 0..100 {
            assert_eq!(decide(&input), first);
        }
    }

    #[test]
    fn test_in_flight_wins_over_cooldown() {
        let mut input = input(0);
        input.in_flight = true;
        input.last_top_up = Some(input.now);
        assert_eq!(decide(&input).reason, DecisionReason::InFlight);
    }
}
