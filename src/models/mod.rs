pub mod assignment;
pub mod chair;
pub mod owner;
pub mod principal;
pub mod ride;
pub mod settlement;
pub mod user;
