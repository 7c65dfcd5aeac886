// === MODULE DEFINITION ===
pub mod module;
pub use module::{RestBridgeModule, MODULE_NAME};

// === INTERNAL MODULES ===
// Exposed for tests; not a stable API.
#[doc(hidden)]
pub mod api;
#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod domain;
