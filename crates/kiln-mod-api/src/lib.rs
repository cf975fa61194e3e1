//! # kiln-mod-api
//!
//! Host side of Kiln's mod system.
//!
//! This crate provides the bridge between the sandboxed runtime and the game:
//!
//! - The capability API each mod's scripts call into (entities, events,
//!   logging, shared data, hooks, game data)
//! - Host-defined hook points replacing arbitrary patching
//! - An event bus and a synchronized shared-data store
//! - The [`ModLoader`], which takes mods from discovery to active and
//!   handles unload and reload
//!
//! ## Lifecycle
//!
//! A mod's scripts may define `init()` and `shutdown()`. The loader runs
//! the top level and `init` once when the mod loads, and `shutdown` before
//! it unloads. Every execution starts from a fresh script state; anything
//! that must persist goes through `shared`.

pub mod data;
pub mod events;
pub mod hooks;
pub mod host;
pub mod instance;
pub mod loader;
pub mod shared;
pub mod world;

pub use data::{GameData, StaticGameData};
pub use events::{EventBus, ModEvent};
pub use hooks::{HookHandler, HookRegistry};
pub use host::{ModApi, ModHost};
pub use instance::{ModInstance, ModStatus};
pub use loader::{HookOutcome, LoadReport, LoaderConfig, ModLoader, ModReport};
pub use shared::SharedDataStore;
pub use world::{InMemoryWorld, World};
