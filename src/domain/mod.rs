//! Domain model: purchase and catalog records, product partitions, the
//! merchant legitimacy rule, and the ports the application talks through.

pub mod merchant;
pub mod ports;
pub mod product;
pub mod purchase;
pub mod sku;
