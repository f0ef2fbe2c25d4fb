//! Bluetooth Module
//!
//! Session management for a single BLE peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      BleSession                          │
//! │   pair / unpair / discover / init_char / write / notify  │
//! └──────┬──────────────┬───────────────┬───────────────┬────┘
//!        │              │               │               │
//!        ▼              ▼               ▼               ▼
//! ┌────────────┐ ┌────────────┐ ┌──────────────┐ ┌──────────────┐
//! │  Scanner   │ │  Pairing   │ │   Catalog    │ │Characteristic│
//! │ (finder)   │ │ controller │ │ GATT lookup  │ │ write/notify │
//! └─────┬──────┘ └─────┬──────┘ └──────┬───────┘ └──────┬───────┘
//!       └──────────────┴───────┬───────┴────────────────┘
//!                              ▼
//!                     ┌────────────────┐
//!                     │  BlePlatform   │  winrt (Windows) / mock
//!                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`platform`] - Traits and status types for the host BLE stack
//! - [`scanner`] - Time-bounded device lookup by MAC address
//! - [`pairing`] - Pairing ceremony and result classification
//! - [`catalog`] - GATT discovery and bound characteristics
//! - [`characteristic`] - Characteristic writes and notifications
//! - [`service`] - Session coordinator

pub mod catalog;
pub mod characteristic;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
pub mod pairing;
pub mod platform;
pub mod scanner;
pub mod service;
#[cfg(windows)]
pub mod winrt;

// Re-export main session for convenience
pub use service::BleSession;
