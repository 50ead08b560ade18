pub mod error;
pub mod identity;
pub mod locks;
pub mod routes;
pub mod share;
pub mod state;
pub mod storage;
pub mod store;
pub mod trips;
