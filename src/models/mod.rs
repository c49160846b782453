pub mod db;
pub mod flow;
pub mod payloads;
pub mod vars;
