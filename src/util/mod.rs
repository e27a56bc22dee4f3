pub mod event;
pub mod random;
