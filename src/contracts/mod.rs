//! Contract ABI bindings

pub mod virtual_bank;

pub use virtual_bank::{IVirtualBank, IERC20};
