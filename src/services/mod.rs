pub mod calendar;
pub mod conversation;
pub mod form;
pub mod messaging;
pub mod receipt;
pub mod sessions;
pub mod slots;
pub mod transcription;
