pub mod basis;
pub mod dataset;
pub mod error;
pub mod leakage_model;
pub mod processors;
pub mod resources;
pub mod shape;
pub mod util;

pub use error::Error;
