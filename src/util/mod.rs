pub mod rolling;
pub mod shared_map;
