pub mod ancestry;
pub mod branch;
pub mod resolver;
