//! IPC-клиент для sway и i3.
//!
//! Формат сообщения: `i3-ipc`, длина (u32), тип (u32), JSON.

pub mod codec;
pub mod connection;
pub mod messages;

pub use codec::EventKind;
pub use connection::{SwayConnector, WmConnection, WmConnector};
pub use messages::{CommandOutcome, Node, WindowEventPayload, WmEvent};
