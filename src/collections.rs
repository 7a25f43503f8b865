/// A growable array which grows in fixed increments and never shrinks.
pub mod dyn_array;

/// A fixed capacity circular byte buffer.
pub mod ring_buffer;

/// An append mostly byte store which hands out delimited lines.
pub mod line_store;

pub use dyn_array::DynArray;
pub use line_store::{Line, LineStore, Lines};
pub use ring_buffer::RingBuffer;
