//! A LAN-scoped distributed file repository.
//!
//! A cluster of peer servers shares an IPv4 multicast group as its control
//! plane. Interactive clients discover the live servers, search their
//! combined catalogs by substring, fetch and upload files over
//! point-to-point TCP connections negotiated during the UDP handshake, and
//! remove files from every server holding them. Each server's catalog is
//! independent: there is no replication and no cross-server consistency.
//!
//! Frame shapes and the command vocabulary live in [`netdepot_wire`]. This
//! crate provides the socket endpoints, the server catalog and dispatcher,
//! the client session, and the two binaries built from them.

pub mod client;
pub mod net;
pub mod server;
