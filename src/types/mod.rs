pub mod connectivity;
pub mod forest;
pub mod pool;
pub mod quadrant;
pub mod tree;
