pub mod bus;
pub mod connectivity;
pub mod executor;
pub mod version;
