pub mod layout;
pub mod vmem;
