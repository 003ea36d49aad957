//! B+Tree access method (spec.md §4.5).
//!
//! Keys and values live only in leaves; interior nodes hold separator keys
//! and child page indices. [`tree`] implements descent, insert/split and
//! delete/redistribute-or-merge maintenance; [`cursor`] walks the leaf
//! sibling chain for streaming range iteration; [`node`] holds the
//! occupancy rules both share.

mod cursor;
mod node;
mod tree;

pub use cursor::Cursor;
pub use tree::BPlusTree;
