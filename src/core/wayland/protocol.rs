//! Protocol bindings for the tioga capture extension.
//!
//! Core protocol types come straight from `wayland-server` /
//! `wayland-client`; the capture extension is generated from its XML at
//! build time. Both sides are generated so the snapshot client links
//! against the same definition the server speaks.

// =============================================================================
// Server-side bindings
// =============================================================================

pub mod server {
    pub use wayland_server;
    use wayland_server::protocol::*;

    pub mod __interfaces {
        use wayland_server::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/tioga-capture-v1.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_server_code!("protocols/tioga-capture-v1.xml");
}

// =============================================================================
// Client-side bindings
// =============================================================================

pub mod client {
    pub use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/tioga-capture-v1.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/tioga-capture-v1.xml");
}
