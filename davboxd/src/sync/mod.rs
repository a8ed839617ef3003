pub mod adapter;
pub mod events;
pub mod folder;
pub mod stats;
