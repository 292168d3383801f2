pub mod asset;
pub mod measurement;

pub use asset::*;
pub use measurement::*;
