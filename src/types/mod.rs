// Core consensus types
// Principle: immutable values, content-addressed where they name something

pub mod primitives;
pub mod signature;
pub mod keys;
pub mod identity;
pub mod block;

pub use primitives::*;
pub use signature::*;
pub use keys::*;
pub use identity::*;
pub use block::*;
