//! Villa: a small Vulkan rendering core.
//!
//! - [`backend`]: device, buffers, swapchain, pipelines and the frame loop
//! - [`slab`]: stable integer keys for GPU-side objects
//! - [`window`] and [`game`]: the platform window and the game-loop scaffold

pub mod backend;
pub mod config;
pub mod game;
pub mod logging;
pub mod mesh;
pub mod slab;
pub mod window;

pub use config::Config;
pub use game::Game;
pub use mesh::MeshKey;
