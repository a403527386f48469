mod contract;

pub use contract::EvmMarketContract;
