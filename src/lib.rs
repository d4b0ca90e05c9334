//! Read-only TFTP server over UDP: a byte-exact packet codec, a per-client
//! send/ack/retry state machine, and a dispatcher that starts one transfer per
//! read request.

pub mod channel;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown_mgr;

pub use channel::{Channel, UdpChannel};
pub use packet::{DataPacket, DataStream, DecodeError, ErrorPacket, ReadRequest, Reply};
pub use protocol::{ErrorCode, Opcode};
pub use server::{ServerConfig, UdpServer};
pub use session::{Session, SessionConfig, SessionError, TransferSummary};
pub use shutdown_mgr::ShutdownManager;
