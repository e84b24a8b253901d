pub mod outbox_events;
