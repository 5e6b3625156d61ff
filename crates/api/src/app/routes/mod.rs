pub mod events;
pub mod system;
