use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{Direction, PositionKey};

/// What the decision provider wants done with an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::OpenLong => "open_long",
            ActionKind::OpenShort => "open_short",
            ActionKind::CloseLong => "close_long",
            ActionKind::CloseShort => "close_short",
            ActionKind::Hold => "hold",
            ActionKind::Wait => "wait",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ActionKind::OpenLong | ActionKind::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, ActionKind::CloseLong | ActionKind::CloseShort)
    }

    /// Direction touched by the action; `None` for hold/wait
    pub fn direction(&self) -> Option<Direction> {
        match self {
            ActionKind::OpenLong | ActionKind::CloseLong => Some(Direction::Long),
            ActionKind::OpenShort | ActionKind::CloseShort => Some(Direction::Short),
            ActionKind::Hold | ActionKind::Wait => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open_long" => Ok(ActionKind::OpenLong),
            "open_short" => Ok(ActionKind::OpenShort),
            "close_long" => Ok(ActionKind::CloseLong),
            "close_short" => Ok(ActionKind::CloseShort),
            "hold" => Ok(ActionKind::Hold),
            "wait" => Ok(ActionKind::Wait),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// One decision returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub instrument: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub size_usd: Decimal,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// 0-100
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub rationale: String,
}

impl Action {
    pub fn key(&self) -> Option<PositionKey> {
        self.kind
            .direction()
            .map(|direction| PositionKey::new(self.instrument.clone(), direction))
    }

    pub fn open(
        instrument: impl Into<String>,
        direction: Direction,
        size_usd: Decimal,
        leverage: u32,
    ) -> Self {
        let kind = match direction {
            Direction::Long => ActionKind::OpenLong,
            Direction::Short => ActionKind::OpenShort,
        };
        Self {
            instrument: instrument.into(),
            kind,
            size_usd,
            leverage,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            rationale: String::new(),
        }
    }

    pub fn close(instrument: impl Into<String>, direction: Direction) -> Self {
        let kind = match direction {
            Direction::Long => ActionKind::CloseLong,
            Direction::Short => ActionKind::CloseShort,
        };
        Self {
            instrument: instrument.into(),
            kind,
            size_usd: Decimal::ZERO,
            leverage: 0,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            rationale: String::new(),
        }
    }

    pub fn with_protection(mut self, stop_loss: Decimal, take_profit: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self.take_profit = Some(take_profit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn kind_round_trips_through_serde_names() {
        let json = r#"{"instrument":"ETHUSDT","kind":"close_short"}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert_eq!(action.kind, ActionKind::CloseShort);
        assert_eq!(action.size_usd, Decimal::ZERO);
        assert_eq!(
            action.key(),
            Some(PositionKey::new("ETHUSDT", Direction::Short))
        );
    }

    #[test]
    fn hold_has_no_key() {
        let action = Action {
            kind: ActionKind::Hold,
            ..Action::open("BTCUSDT", Direction::Long, dec!(100), 3)
        };
        assert!(action.key().is_none());
        assert!(!action.kind.is_open());
        assert!(!action.kind.is_close());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("open_sideways".parse::<ActionKind>().is_err());
        assert_eq!("OPEN_LONG".parse::<ActionKind>().unwrap(), ActionKind::OpenLong);
    }
}
