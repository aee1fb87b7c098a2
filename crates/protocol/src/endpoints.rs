//! Network endpoint paths exposed by the bridge

/// Persistent relay channel (WebSocket upgrade)
pub const SUBSCRIBE: &str = "/ws";

/// Peripheral input (POST) and recent peripheral output (GET)
pub const SERIAL: &str = "/serial";

/// Peripheral connection status as JSON
pub const STATUS: &str = "/status";

/// Alternate boot image replacement
pub const BOOT_IMAGE_UPLOAD: &str = "/upload";

/// Content store replacement
pub const CONTENT_STORE_UPLOAD: &str = "/uploadfs";

/// Credential check
pub const LOGIN: &str = "/login";

/// Redirect target after a successful login
pub const LOGIN_SUCCESS_REDIRECT: &str = "/upload.html";

/// Redirect target after a failed login
pub const LOGIN_FAILURE_REDIRECT: &str = "/login.html?error=1";

/// Name of the cookie carrying the session marker
pub const SESSION_COOKIE: &str = "session";
