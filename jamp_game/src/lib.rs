//! `jamp_game`
//!
//! The server game module. The engine reaches it only through
//! `GameExport`, and it reaches back only through the `GameImport` borrowed
//! for each call.
//!
//! - `spawn`: entity text → spawn vars → fields → constructors
//! - `spawn_funcs`: classname constructors, including instanced sub-maps
//! - `items`: pickup table
//! - `module`: `GameModule` and its loader

pub mod entity;
pub mod items;
pub mod level;
pub mod module;
pub mod spawn;
pub mod spawn_funcs;

pub use module::{GameModule, GameModuleLoader};
