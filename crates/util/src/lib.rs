//! Utilities shared by the ISAAC crates.
//!
//! - [`LockedMap`]: a map behind one lock, or sharded over many by FNV-1a
//! - [`ErrgroupWorker`]: bounded job pool that stops on the first error
//! - [`ContextTimer`] and [`Timers`]: cancellable repeating timers by id
//! - [`lengthed`]: length-prefixed framing of headers and body chunks

mod locked;
pub mod lengthed;
mod timer;
mod timers;
mod worker;

pub use lengthed::{BytesFrameReader, BytesFrameWriter, FrameError};
pub use locked::{LockedMap, LockedMapError, ShardedMap, SingleLockedMap};
pub use timer::{ContextTimer, IntervalFunc, TimerCallback, TimerError};
pub use timers::{TimerId, Timers};
pub use worker::{ErrgroupWorker, WorkerError};
