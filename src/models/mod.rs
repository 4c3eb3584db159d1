pub mod booking;
pub mod command;
pub mod conversation;
pub mod service;
pub mod slot;

pub use booking::{BookingRecord, BookingStatus};
pub use command::{Command, InboundEvent, PageDirection};
pub use conversation::{ConversationState, Stage};
pub use service::{Service, ServiceCatalog};
pub use slot::{Slot, SlotRow, SlotStatus};
