pub mod lineage;
pub mod task;

pub use lineage::*;
pub use task::*;
