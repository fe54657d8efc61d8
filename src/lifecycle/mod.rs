//! Process lifecycle: signal handling and coordinated shutdown.

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::listen_for_signals;
