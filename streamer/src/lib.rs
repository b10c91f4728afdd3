#[cfg(feature = "streamer-base")]
pub use streamer_base as base;

#[cfg(feature = "streamer-io")]
pub use streamer_io as io;
