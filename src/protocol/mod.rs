//! Client-facing streaming protocol (AG-UI event shapes).

pub mod events;

pub use events::{EventClock, OutputEvent, OutputEventKind, RunOutcome};
