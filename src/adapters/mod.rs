pub mod binance_futures;
pub mod binance_user_stream;
pub mod paper;

pub use binance_futures::{BinanceFuturesClient, BinanceFuturesConfig};
pub use paper::PaperExchange;
