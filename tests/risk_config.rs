use autotrader::agent::{validate_batch, LoopSettings};
use autotrader::config::AppConfig;
use autotrader::decision::audit::Verdict;
use autotrader::domain::{Action, Direction};
use rust_decimal_macros::dec;
use std::collections::BTreeSet;

const RISK: &str = r#"
[risk]
max_open_positions = 3
default_leverage_cap = 5
default_notional_cap = 1.5
require_protection = true

[risk.leverage_caps]
BTCUSDT = 10
DOGEUSDT = 2

[risk.notional_caps]
BTCUSDT = 10
"#;

fn load(toml: &str) -> AppConfig {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("default.toml"), toml).unwrap();
    AppConfig::load_from(dir.path()).unwrap()
}

#[test]
fn configured_caps_reach_validation() {
    let config = load(RISK);
    assert!(config.validate().is_ok());
    assert_eq!(config.risk.leverage_cap("BTCUSDT"), 10);
    assert_eq!(config.risk.leverage_cap("DOGEUSDT"), 2);

    let limits = LoopSettings::from_config(&config.decision, &config.risk, None).limits;
    let verdicts = validate_batch(
        &[
            Action::open("BTCUSDT", Direction::Long, dec!(5000), 10)
                .with_protection(dec!(90000), dec!(110000)),
            Action::open("DOGEUSDT", Direction::Long, dec!(100), 3)
                .with_protection(dec!(0.1), dec!(0.2)),
            Action::open("ETHUSDT", Direction::Short, dec!(2000), 3)
                .with_protection(dec!(3100), dec!(2900)),
            Action::open("SOLUSDT", Direction::Long, dec!(100), 3),
        ],
        &BTreeSet::new(),
        dec!(1000),
        &limits,
    );

    assert_eq!(verdicts[0], Verdict::Accepted);
    assert_eq!(
        verdicts[1],
        Verdict::Rejected {
            reason: "leverage 3x exceeds the 2x cap for DOGEUSDT".to_string()
        }
    );
    assert_eq!(
        verdicts[2],
        Verdict::Rejected {
            reason: "position value 2000 exceeds the 1515.00 cap for ETHUSDT".to_string()
        }
    );
    assert_eq!(
        verdicts[3],
        Verdict::Rejected {
            reason: "malformed action for SOLUSDT: stop loss and take profit are required"
                .to_string()
        }
    );
}

#[test]
fn shipped_defaults_cap_majors_above_alts() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
    let config = AppConfig::load_from(dir).unwrap();
    let limits = LoopSettings::from_config(&config.decision, &config.risk, None).limits;

    assert!(limits.leverage_cap("BTCUSDT") > limits.leverage_cap("SOLUSDT"));
    assert!(limits.max_notional("ETHUSDT", dec!(1000)) > limits.max_notional("SOLUSDT", dec!(1000)));
    assert!(limits.require_protection);
}
