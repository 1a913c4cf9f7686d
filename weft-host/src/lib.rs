//! Host integration for weft
//!
//! The engine in `weft-core` is host-agnostic; this crate supplies the two
//! pieces a host usually wants on day one:
//!
//! - [`RedrawBinding`]: wires a render action to a [`RedrawRequester`] so
//!   that any number of cell writes between frames collapse into a single
//!   redraw request.
//! - [`MemorySource`]: an in-memory keyed value store implementing
//!   [`ExternalValueSource`](weft_core::ExternalValueSource), with
//!   [`binding`](MemorySource::binding) to project a key into an
//!   [`ExternalSourceCell`](weft_core::ExternalSourceCell).

pub mod memory_source;
pub mod redraw;

pub use memory_source::MemorySource;
pub use redraw::{RedrawBinding, RedrawRequester};
