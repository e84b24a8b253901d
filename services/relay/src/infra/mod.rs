pub mod db;
pub mod stream;
pub mod writer;
