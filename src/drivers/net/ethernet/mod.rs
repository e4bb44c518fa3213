//! Ethernet controller backends, grouped by vendor

pub mod amd;
pub mod intel;
pub mod synopsys;
