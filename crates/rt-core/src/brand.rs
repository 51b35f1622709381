//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "RTunnel";

/// Binary executable name
pub const BIN_NAME: &str = "rtunnel";

/// Directory name used under the platform config dir
pub const CONFIG_DIR_NAME: &str = "rtunnel";

/// Short description
pub const DESCRIPTION: &str = "TCP tunneling over WebRTC data channels";
