pub mod delivery;
pub mod export;
pub mod notify;
