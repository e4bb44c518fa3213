//! AMD Ethernet controllers

pub mod pcnet32;
