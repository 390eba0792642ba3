pub mod buffer;
pub mod capture;
pub mod compositor;
pub mod errors;
pub mod event_loop;
pub mod output;
pub mod renderer;
pub mod state;
pub mod wayland;

// Re-export key types
pub use compositor::Compositor;
pub use event_loop::EventLoop;
pub use state::ServerState;
