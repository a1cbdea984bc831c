pub mod id;

pub use id::ClientId;
