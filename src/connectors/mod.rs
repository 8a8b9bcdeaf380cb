//! Default implementations of [crate::transport::SocketFactory]

pub mod tcp;
