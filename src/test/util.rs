pub(crate) mod event_buffer;
pub(crate) mod mock;
