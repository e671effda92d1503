pub mod temporal_key;
pub mod value;
