//! Default implementations of [crate::resolver::Resolver]

pub mod fixed;
pub mod hickory;
pub mod system;
