//! USB tunnel providers exposing a phone's service as a local endpoint

pub mod adb;
pub mod usbmux;
