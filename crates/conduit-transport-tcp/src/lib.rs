//! `TcpStream`-backed implementation of `conduit_transport::Connection`.

mod connection;

pub use connection::TokioTcpConnection;
