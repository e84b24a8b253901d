pub mod health;
pub mod housekeeping;
pub mod poll;
pub mod projection;
pub mod sweep;
