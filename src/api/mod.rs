pub mod kraken;

pub use kraken::{KrakenClient, ReferenceData};
