pub mod disconnect;
pub mod dispatcher;
pub mod event;
pub mod handshake;
pub mod ids;
pub mod peer;
pub mod property;
pub mod request;
pub mod reroute;
