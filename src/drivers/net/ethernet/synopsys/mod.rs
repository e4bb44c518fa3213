//! Synopsys DesignWare Ethernet controllers

pub mod dwmac;
