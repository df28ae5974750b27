//! Gateway hub for BLE and WiFi smart devices. Devices feed events into a
//! remotely managed automation flow; the flow drives devices back through
//! plugins.

pub mod advert;
pub mod backend;
pub mod config;
pub mod device;
pub mod flow;
pub mod hub;
pub mod logger;
pub mod node;
pub mod plugin;
pub mod radio;
pub mod scan;
