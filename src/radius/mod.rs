pub mod accounting;
pub mod auth;
pub mod coa;
pub mod packet;
pub mod server;

pub use server::RadiusServer;
