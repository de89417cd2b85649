use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, PositionKey};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in `direction`
    pub fn opening(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side that reduces a position in `direction`
    pub fn closing(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Market order opening exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub instrument: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub leverage: u32,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Market order reducing exposure; `quantity: None` closes everything
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub instrument: String,
    pub direction: Direction,
    pub quantity: Option<Decimal>,
}

/// Result of an executed open/close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    /// Exchange-reported realized PnL, when the venue returns one
    pub realized_pnl: Option<Decimal>,
}

/// Order lifecycle event pushed by the user-data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub instrument: String,
    pub side: OrderSide,
    /// Hedge-mode position side, if the venue reports one
    pub direction: Option<Direction>,
    pub status: String,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub event_time: DateTime<Utc>,
}

impl OrderUpdate {
    pub fn position_key(&self) -> Option<PositionKey> {
        self.direction
            .map(|d| PositionKey::new(self.instrument.clone(), d))
    }

    pub fn is_filled(&self) -> bool {
        self.status.eq_ignore_ascii_case("FILLED")
    }

    /// Whether this fill reduced the position on its side
    pub fn is_reducing(&self) -> bool {
        match self.direction {
            Some(d) => self.side == OrderSide::closing(d),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reducing_detection_uses_position_side() {
        let update = OrderUpdate {
            order_id: "1".into(),
            instrument: "BTCUSDT".into(),
            side: OrderSide::Sell,
            direction: Some(Direction::Long),
            status: "FILLED".into(),
            quantity: dec!(0.01),
            filled_quantity: dec!(0.01),
            avg_price: Some(dec!(65000)),
            realized_pnl: Some(dec!(12.5)),
            event_time: Utc::now(),
        };
        assert!(update.is_filled());
        assert!(update.is_reducing());

        let opening = OrderUpdate {
            side: OrderSide::Buy,
            ..update
        };
        assert!(!opening.is_reducing());
    }
}
