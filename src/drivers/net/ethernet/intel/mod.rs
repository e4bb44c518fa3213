//! Intel Ethernet controllers

pub mod e100;
