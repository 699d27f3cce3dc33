pub mod dispatch;
pub mod ledger;
pub mod notification;
pub mod ride_state;
pub mod sales;
pub mod scoring;
pub mod settlement;
pub mod tracker;
