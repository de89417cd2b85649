//! Risk validation of a provider batch before anything is executed

use rust_decimal::Decimal;
use std::collections::BTreeSet;

use crate::decision::audit::Verdict;
use crate::decision::RiskLimits;
use crate::domain::{Action, Direction, PositionKey};
use crate::error::ValidationError;

/// Validate `actions` against the positions held when the cycle started.
///
/// Closes are always accepted. Hold/wait are no-ops. Opens are checked in
/// order: shape, leverage cap, notional cap against `equity`, duplicate key
/// (held or opened earlier in the batch), then the open-position cap.
/// Closes of held keys free their slot here; the loop re-checks the cap with
/// [`check_capacity`] once it knows which closes actually filled.
pub fn validate_batch(
    actions: &[Action],
    held: &BTreeSet<PositionKey>,
    equity: Decimal,
    limits: &RiskLimits,
) -> Vec<Verdict> {
    let closing: BTreeSet<PositionKey> = actions
        .iter()
        .filter(|a| a.kind.is_close())
        .filter_map(Action::key)
        .filter(|k| held.contains(k))
        .collect();
    let mut open_count = held.len() - closing.len();
    let mut opened: BTreeSet<PositionKey> = BTreeSet::new();

    actions
        .iter()
        .map(|action| {
            if action.kind.is_close() {
                return Verdict::Accepted;
            }
            let Some(direction) = action.kind.direction() else {
                return Verdict::NoOp;
            };

            let batch = Batch {
                held,
                opened: &opened,
                open_count,
                equity,
            };
            match check_open(action, direction, &batch, limits) {
                Ok(key) => {
                    open_count += 1;
                    opened.insert(key);
                    Verdict::Accepted
                }
                Err(e) => Verdict::Rejected {
                    reason: e.to_string(),
                },
            }
        })
        .collect()
}

/// One more open on top of `open_count` live positions must stay within the cap.
pub fn check_capacity(open_count: usize, limits: &RiskLimits) -> Result<(), ValidationError> {
    let resulting = open_count + 1;
    if resulting > limits.max_open_positions {
        return Err(ValidationError::MaxPositions {
            resulting,
            max: limits.max_open_positions,
        });
    }
    Ok(())
}

struct Batch<'a> {
    held: &'a BTreeSet<PositionKey>,
    opened: &'a BTreeSet<PositionKey>,
    open_count: usize,
    equity: Decimal,
}

fn check_open(
    action: &Action,
    direction: Direction,
    batch: &Batch<'_>,
    limits: &RiskLimits,
) -> Result<PositionKey, ValidationError> {
    check_shape(action, direction, limits.require_protection)?;

    let cap = limits.leverage_cap(&action.instrument);
    if action.leverage > cap {
        return Err(ValidationError::LeverageCap {
            instrument: action.instrument.clone(),
            requested: action.leverage,
            cap,
        });
    }

    let max_notional = limits.max_notional(&action.instrument, batch.equity);
    if action.size_usd > max_notional {
        return Err(ValidationError::NotionalCap {
            instrument: action.instrument.clone(),
            requested: action.size_usd,
            cap: max_notional.max(Decimal::ZERO).round_dp(2),
        });
    }

    let key = PositionKey::new(action.instrument.clone(), direction);
    if batch.held.contains(&key) || batch.opened.contains(&key) {
        return Err(ValidationError::DuplicateOpen {
            instrument: action.instrument.clone(),
            direction,
        });
    }

    check_capacity(batch.open_count, limits)?;
    Ok(key)
}

fn check_shape(
    action: &Action,
    direction: Direction,
    require_protection: bool,
) -> Result<(), ValidationError> {
    let malformed = |reason: &str| ValidationError::Malformed {
        instrument: action.instrument.clone(),
        reason: reason.to_string(),
    };

    if action.instrument.trim().is_empty() {
        return Err(malformed("missing instrument"));
    }
    if action.size_usd <= Decimal::ZERO {
        return Err(malformed("size_usd must be positive"));
    }
    if action.leverage < 1 {
        return Err(malformed("leverage must be at least 1"));
    }
    if [action.stop_loss, action.take_profit]
        .iter()
        .flatten()
        .any(|price| *price <= Decimal::ZERO)
    {
        return Err(malformed("stop loss and take profit must be positive"));
    }
    match (action.stop_loss, action.take_profit) {
        (Some(stop), Some(target)) => {
            let ordered = match direction {
                Direction::Long => stop < target,
                Direction::Short => stop > target,
            };
            if !ordered {
                return Err(malformed("stop loss and take profit are on the wrong sides"));
            }
        }
        _ if require_protection => {
            return Err(malformed("stop loss and take profit are required"));
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const EQUITY: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

    fn limits(max: usize) -> RiskLimits {
        RiskLimits {
            max_open_positions: max,
            default_leverage_cap: 5,
            leverage_caps: HashMap::from([("BTCUSDT".to_string(), 20)]),
            default_notional_cap: dec!(1.5),
            notional_caps: HashMap::from([("BTCUSDT".to_string(), dec!(10))]),
            require_protection: false,
        }
    }

    fn held(keys: &[(&str, Direction)]) -> BTreeSet<PositionKey> {
        keys.iter().map(|(i, d)| PositionKey::new(*i, *d)).collect()
    }

    fn rejected(verdict: &Verdict) -> bool {
        matches!(verdict, Verdict::Rejected { .. })
    }

    #[test]
    fn duplicate_open_rejected_but_close_accepted() {
        let held = held(&[("XUSDT", Direction::Long)]);
        let verdicts = validate_batch(
            &[
                Action::open("XUSDT", Direction::Long, dec!(100), 2),
                Action::close("XUSDT", Direction::Long),
            ],
            &held,
            EQUITY,
            &limits(5),
        );
        assert!(rejected(&verdicts[0]));
        assert_eq!(verdicts[1], Verdict::Accepted);
    }

    #[test]
    fn leverage_cap_is_per_instrument() {
        let empty = BTreeSet::new();
        let verdicts = validate_batch(
            &[
                Action::open("BTCUSDT", Direction::Long, dec!(100), 20),
                Action::open("SOLUSDT", Direction::Long, dec!(100), 6),
            ],
            &empty,
            EQUITY,
            &limits(5),
        );
        assert_eq!(verdicts[0], Verdict::Accepted);
        assert_eq!(
            verdicts[1],
            Verdict::Rejected {
                reason: "leverage 6x exceeds the 5x cap for SOLUSDT".to_string()
            }
        );
    }

    #[test]
    fn caps_match_instruments_case_insensitively() {
        let risk = crate::config::RiskConfig {
            leverage_caps: HashMap::from([("dogeusdt".to_string(), 2)]),
            notional_caps: HashMap::from([("btcusdt".to_string(), dec!(10))]),
            ..Default::default()
        };
        let limits = RiskLimits::from(&risk);
        assert_eq!(limits.leverage_cap("DOGEUSDT"), 2);
        assert_eq!(limits.leverage_cap("doge"), 2);
        assert_eq!(limits.max_notional("BTCUSDT", dec!(100)), dec!(1010));
    }

    #[test]
    fn notional_is_capped_by_equity_multiple() {
        let empty = BTreeSet::new();
        let verdicts = validate_batch(
            &[
                // 10x of 1000 plus 1% tolerance
                Action::open("BTCUSDT", Direction::Long, dec!(10100), 5),
                Action::open("ETHUSDT", Direction::Long, dec!(1515), 5),
                Action::open("SOLUSDT", Direction::Long, dec!(1516), 5),
            ],
            &empty,
            EQUITY,
            &limits(5),
        );
        assert_eq!(verdicts[0], Verdict::Accepted);
        assert_eq!(verdicts[1], Verdict::Accepted);
        assert_eq!(
            verdicts[2],
            Verdict::Rejected {
                reason: "position value 1516 exceeds the 1515.00 cap for SOLUSDT".to_string()
            }
        );
    }

    #[test]
    fn no_equity_means_no_opens() {
        let verdicts = validate_batch(
            &[Action::open("ETHUSDT", Direction::Short, dec!(10), 2)],
            &BTreeSet::new(),
            Decimal::ZERO,
            &limits(5),
        );
        assert!(rejected(&verdicts[0]));
    }

    #[test]
    fn protection_required_when_configured() {
        let mut limits = limits(5);
        limits.require_protection = true;
        let verdicts = validate_batch(
            &[
                Action::open("ETHUSDT", Direction::Long, dec!(100), 2),
                Action::open("ETHUSDT", Direction::Short, dec!(100), 2)
                    .with_protection(dec!(3100), dec!(2900)),
            ],
            &BTreeSet::new(),
            EQUITY,
            &limits,
        );
        assert_eq!(
            verdicts[0],
            Verdict::Rejected {
                reason: "malformed action for ETHUSDT: stop loss and take profit are required"
                    .to_string()
            }
        );
        assert_eq!(verdicts[1], Verdict::Accepted);
    }

    #[test]
    fn position_cap_counts_batch_closes_and_opens() {
        let held = held(&[("AUSDT", Direction::Long), ("BUSDT", Direction::Short)]);
        let verdicts = validate_batch(
            &[
                Action::open("CUSDT", Direction::Long, dec!(50), 2),
                Action::open("DUSDT", Direction::Long, dec!(50), 2),
                Action::close("AUSDT", Direction::Long),
                Action::open("EUSDT", Direction::Short, dec!(50), 2),
            ],
            &held,
            EQUITY,
            &limits(3),
        );
        // 2 held - 1 closing = 1; C makes 2, D makes 3, E would be 4.
        assert_eq!(verdicts[0], Verdict::Accepted);
        assert_eq!(verdicts[1], Verdict::Accepted);
        assert_eq!(verdicts[2], Verdict::Accepted);
        assert!(rejected(&verdicts[3]));
    }

    #[test]
    fn capacity_check() {
        assert!(check_capacity(0, &limits(1)).is_ok());
        assert_eq!(
            check_capacity(1, &limits(1)),
            Err(ValidationError::MaxPositions {
                resulting: 2,
                max: 1
            })
        );
    }

    #[test]
    fn same_key_twice_in_one_batch() {
        let empty = BTreeSet::new();
        let verdicts = validate_batch(
            &[
                Action::open("ETHUSDT", Direction::Short, dec!(50), 2),
                Action::open("ETHUSDT", Direction::Short, dec!(80), 2),
                Action::open("ETHUSDT", Direction::Long, dec!(80), 2),
            ],
            &empty,
            EQUITY,
            &limits(5),
        );
        assert_eq!(verdicts[0], Verdict::Accepted);
        assert!(rejected(&verdicts[1]));
        assert_eq!(verdicts[2], Verdict::Accepted);
    }

    #[test]
    fn malformed_opens() {
        let empty = BTreeSet::new();
        let limits = limits(5);
        let batch = Batch {
            held: &empty,
            opened: &empty,
            open_count: 0,
            equity: EQUITY,
        };
        let check = |action: Action| {
            let direction = action.kind.direction().unwrap();
            check_open(&action, direction, &batch, &limits)
        };

        assert!(matches!(
            check(Action::open("ETHUSDT", Direction::Long, dec!(0), 2)),
            Err(ValidationError::Malformed { .. })
        ));
        assert!(matches!(
            check(Action::open("ETHUSDT", Direction::Long, dec!(10), 0)),
            Err(ValidationError::Malformed { .. })
        ));
        assert!(check(
            Action::open("ETHUSDT", Direction::Long, dec!(10), 2).with_protection(dec!(3100), dec!(2900))
        )
        .is_err());
        assert!(check(
            Action::open("ETHUSDT", Direction::Short, dec!(10), 2).with_protection(dec!(3100), dec!(2900))
        )
        .is_ok());
        assert!(check(
            Action::open("ETHUSDT", Direction::Long, dec!(10), 2).with_protection(dec!(-1), dec!(2900))
        )
        .is_err());
    }

    #[test]
    fn hold_and_wait_are_no_ops() {
        let mut hold = Action::close("BTCUSDT", Direction::Long);
        hold.kind = crate::domain::ActionKind::Hold;
        let verdicts = validate_batch(&[hold], &BTreeSet::new(), EQUITY, &limits(0));
        assert_eq!(verdicts, vec![Verdict::NoOp]);
    }
}
