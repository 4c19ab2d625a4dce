//! Immutable container execution plans and the engine seam that evaluates them.
//!
//! A [`Container`] is built from pure builder steps; files ([`File`]) and
//! long running processes ([`Service`]) are derived from it. An [`Engine`]
//! turns those values into actual work.
//!
//! # Example
//! ```rust
//! use container_spec::{CacheVolume, Container};
//!
//! let cache = CacheVolume::new("k3s_config_demo");
//! let plan = Container::new()
//!     .from("alpine".parse().unwrap())
//!     .with_mounted_cache("/cache/k3s", &cache)
//!     .with_exec(vec!["ls", "/cache/k3s"]);
//!
//! assert_eq!(plan.cache_mounts().get("/cache/k3s"), Some(&cache));
//! ```

#![deny(missing_docs)]

mod container;
mod engine;
pub mod errors;
pub mod memory;
mod reference;
pub mod render;
mod service;

#[doc(inline)]
pub use container::{CacheVolume, Container, File, FileOpts, Step, WaitPolicy};
#[doc(inline)]
pub use engine::Engine;
#[doc(inline)]
pub use reference::{ParseError, Reference, DEFAULT_REGISTRY};
#[doc(inline)]
pub use service::{Service, ServiceHandle, ServiceOpts};
