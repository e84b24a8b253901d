pub mod outbox;
pub mod ready;
