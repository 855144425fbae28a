pub mod helpers;
pub mod local_network;
pub mod test_protocol;

pub use helpers::*;
pub use local_network::{LocalNetwork, LocalService};
pub use test_protocol::protocol;
