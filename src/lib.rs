//! Time-slot booking engine: slot generation from weekly working windows,
//! per-day availability, and race-free reservations with per-requester caps.

pub mod auth;
pub mod command;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod slots;
pub mod tenant;
pub mod wal;
pub mod wire;

pub use engine::{Engine, EngineError, EngineSettings, ErrorKind};
pub use model::{Booking, BookingStatus, Principal, Resource, Slot, Span, WorkingWindow};
pub use slots::{generate, Window};
