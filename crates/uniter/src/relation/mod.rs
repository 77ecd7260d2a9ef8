//! The relation engine.
//!
//! For every relation the unit takes part in, the engine turns scope and
//! settings changes into an ordered sequence of relation hooks:
//!
//! - `joined` when a peer enters scope, immediately followed by `changed`
//! - `changed` when a joined peer's settings version moves
//! - `departed` when a peer leaves scope
//! - `broken` once a dying relation has no joined peers left
//!
//! Departures come before settings changes and peers are visited in name
//! order. Each relation's state is saved under `state/relations/<id>/`.

mod engine;
mod state;

pub use engine::RelationEngine;
pub use state::{RelationDir, RelationSnapshot};
