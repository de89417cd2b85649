pub mod cache;

pub use cache::StateCache;
