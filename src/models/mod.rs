pub mod caddy;

pub use caddy::*;
